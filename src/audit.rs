//! Audit batcher
//!
//! Session lifecycle, traffic and access events are submitted without
//! blocking and written to an [`AuditSink`] in batches. Sink failures are
//! retried with exponential backoff and then dropped; they never reach the
//! data plane.

use crate::config::AuditConfig;
use crate::error::Result;
use crate::session::{SessionId, TrafficCounters};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One audit record
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    SessionStart {
        session_id: SessionId,
        username: String,
        group: String,
        addresses: Vec<IpAddr>,
        remote: SocketAddr,
        hostname: Option<String>,
        at: SystemTime,
    },
    SessionEnd {
        session_id: SessionId,
        username: String,
        reason: String,
        counters: TrafficCounters,
        duration: Duration,
        at: SystemTime,
    },
    TrafficSnapshot {
        session_id: SessionId,
        username: String,
        counters: TrafficCounters,
        at: SystemTime,
    },
    Access {
        session_id: SessionId,
        username: String,
        protocol: u8,
        destination: IpAddr,
        port: u16,
        at: SystemTime,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::SessionStart { .. } => "session_start",
            AuditEvent::SessionEnd { .. } => "session_end",
            AuditEvent::TrafficSnapshot { .. } => "traffic",
            AuditEvent::Access { .. } => "access",
        }
    }
}

/// Events flushed together
#[derive(Debug, Clone)]
pub struct AuditBatch {
    pub id: Uuid,
    pub events: Vec<AuditEvent>,
}

/// Persistence collaborator
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(&self, batch: &AuditBatch) -> Result<()>;
}

/// Writes each event as a log line under the `rvpngw::audit` target
#[derive(Debug, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn write_batch(&self, batch: &AuditBatch) -> Result<()> {
        for event in &batch.events {
            match event {
                AuditEvent::SessionStart {
                    session_id,
                    username,
                    group,
                    addresses,
                    remote,
                    ..
                } => log::info!(
                    target: "rvpngw::audit",
                    "batch={} start session={session_id} user={username} group={group} addresses={addresses:?} remote={remote}",
                    batch.id
                ),
                AuditEvent::SessionEnd {
                    session_id,
                    username,
                    reason,
                    counters,
                    duration,
                    ..
                } => log::info!(
                    target: "rvpngw::audit",
                    "batch={} end session={session_id} user={username} reason=\"{reason}\" rx={} tx={} duration={}s",
                    batch.id,
                    counters.bytes_in,
                    counters.bytes_out,
                    duration.as_secs()
                ),
                AuditEvent::TrafficSnapshot {
                    session_id,
                    username,
                    counters,
                    ..
                } => log::info!(
                    target: "rvpngw::audit",
                    "batch={} traffic session={session_id} user={username} rx={} tx={}",
                    batch.id,
                    counters.bytes_in,
                    counters.bytes_out
                ),
                AuditEvent::Access {
                    session_id,
                    username,
                    protocol,
                    destination,
                    port,
                    ..
                } => log::info!(
                    target: "rvpngw::audit",
                    "batch={} access session={session_id} user={username} proto={protocol} dst={destination}:{port}",
                    batch.id
                ),
            }
        }
        Ok(())
    }
}

/// Counters shared by the handle and the batcher task
#[derive(Debug, Default)]
pub struct AuditStats {
    /// Events refused because the buffer was full
    pub submit_dropped: AtomicU64,
    pub events_written: AtomicU64,
    pub batches_written: AtomicU64,
    /// Events in batches abandoned after the last retry
    pub events_lost: AtomicU64,
}

/// Cheap cloneable submission handle
#[derive(Debug, Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEvent>,
    stats: Arc<AuditStats>,
}

impl AuditHandle {
    /// Queue an event; never blocks. Returns false if it was dropped.
    pub fn submit(&self, event: AuditEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.stats.submit_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> &AuditStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Copy)]
struct BatchSettings {
    batch_size: usize,
    flush_interval: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl From<&AuditConfig> for BatchSettings {
    fn from(config: &AuditConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_secs(u64::from(config.flush_interval.max(1))),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Start the batcher task.
///
/// The task flushes whatever is pending and exits when `shutdown` fires or
/// every handle has been dropped.
pub fn spawn_batcher(
    config: &AuditConfig,
    sink: Arc<dyn AuditSink>,
    shutdown: CancellationToken,
) -> (AuditHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.buffer.max(1));
    let stats = Arc::new(AuditStats::default());
    let batcher = Batcher {
        rx,
        sink,
        settings: BatchSettings::from(config),
        stats: stats.clone(),
        pending: Vec::new(),
    };
    let task = tokio::spawn(batcher.run(shutdown));
    (AuditHandle { tx, stats }, task)
}

struct Batcher {
    rx: mpsc::Receiver<AuditEvent>,
    sink: Arc<dyn AuditSink>,
    settings: BatchSettings,
    stats: Arc<AuditStats>,
    pending: Vec<AuditEvent>,
}

impl Batcher {
    async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => {
                        self.pending.push(event);
                        if self.pending.len() >= self.settings.batch_size {
                            self.flush().await;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
                _ = shutdown.cancelled() => {
                    while let Ok(event) = self.rx.try_recv() {
                        self.pending.push(event);
                    }
                    break;
                }
            }
        }

        while !self.pending.is_empty() {
            self.flush().await;
        }
        log::debug!("Audit batcher stopped");
    }

    async fn flush(&mut self) {
        let take = self.pending.len().min(self.settings.batch_size);
        let batch = AuditBatch {
            id: Uuid::new_v4(),
            events: self.pending.drain(..take).collect(),
        };
        let count = batch.events.len() as u64;

        for attempt in 1..=self.settings.max_attempts {
            match self.sink.write_batch(&batch).await {
                Ok(()) => {
                    self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                    self.stats.events_written.fetch_add(count, Ordering::Relaxed);
                    log::trace!("Audit batch {} written ({count} events)", batch.id);
                    return;
                }
                Err(e) if attempt < self.settings.max_attempts => {
                    let delay = backoff_delay(self.settings.backoff, attempt);
                    log::warn!(
                        "Audit batch {} write failed (attempt {attempt}/{}): {e}; retrying in {}ms",
                        batch.id,
                        self.settings.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!(
                        "Audit batch {} dropped after {attempt} attempts, {count} events lost: {e}",
                        batch.id
                    );
                    self.stats.events_lost.fetch_add(count, Ordering::Relaxed);
                }
            }
        }
    }
}

/// `base * 2^(attempt-1)` plus up to 25% jitter, capped at one minute
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let capped = exp.min(Duration::from_secs(60));
    let jitter_ms = fastrand::u64(0..=(capped.as_millis() as u64) / 4);
    capped + Duration::from_millis(jitter_ms)
}
