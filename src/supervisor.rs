//! Periodic liveness sweep over all sessions
//!
//! One task walks the registry every tick. Dead-peer probes and rekeys are
//! posted to the session's egress task; timeouts close the session. Traffic
//! snapshots for the audit log are taken on their own, slower interval.

use crate::audit::{AuditEvent, AuditHandle};
use crate::config::Config;
use crate::protocol::FrameType;
use crate::session::{LivenessAction, SessionCommand, SessionRegistry};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub tick: Duration,
    pub snapshot_every: Option<Duration>,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: config.timers.supervisor_tick(),
            snapshot_every: config.timers.snapshot_every(),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probes: usize,
    pub rekeys: usize,
    pub closed: usize,
}

#[derive(Debug)]
pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    audit: AuditHandle,
    settings: RwLock<SupervisorSettings>,
}

impl Supervisor {
    pub fn new(registry: Arc<SessionRegistry>, audit: AuditHandle, config: &Config) -> Self {
        Self {
            registry,
            audit,
            settings: RwLock::new(SupervisorSettings::from_config(config)),
        }
    }

    pub fn reload(&self, config: &Config) {
        *self.settings.write() = SupervisorSettings::from_config(config);
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = self.settings.read().tick;
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_snapshot = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            let report = self.sweep(now);
            if report.closed > 0 {
                log::debug!("Supervisor closed {} sessions", report.closed);
            }

            let settings = *self.settings.read();
            if let Some(every) = settings.snapshot_every {
                if now.saturating_duration_since(last_snapshot) >= every {
                    self.snapshot_traffic();
                    last_snapshot = now;
                }
            }
            if settings.tick != tick {
                tick = settings.tick;
                ticker = interval(tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }
        log::debug!("Supervisor stopped");
    }

    /// Evaluate every traffic-carrying session once
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for session in self.registry.sessions() {
            if !session.state().forwards_traffic() {
                continue;
            }
            match session.evaluate_liveness(now) {
                LivenessAction::Nothing => {}
                LivenessAction::Probe => {
                    if session.post(SessionCommand::Control(FrameType::DpdRequest)) {
                        report.probes += 1;
                    }
                }
                LivenessAction::Rekey => {
                    if session.post(SessionCommand::Rekey) {
                        report.rekeys += 1;
                    } else {
                        // Retried once the epoch timer is reset
                        session.rekey_finished();
                    }
                }
                LivenessAction::Close(reason) => {
                    if session.begin_close(reason) {
                        report.closed += 1;
                    }
                }
            }
        }
        report
    }

    /// Submit a traffic record for every established session
    pub fn snapshot_traffic(&self) {
        let at = SystemTime::now();
        for session in self.registry.sessions() {
            if !session.state().forwards_traffic() {
                continue;
            }
            self.audit.submit(AuditEvent::TrafficSnapshot {
                session_id: session.id(),
                username: session.username().to_string(),
                counters: session.stats.counters(),
                at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::spawn_batcher;
    use crate::audit::tests::MemorySink;
    use crate::pool::PoolSet;
    use crate::session::tests::test_session;
    use crate::session::{CloseReason, SessionState};

    fn supervisor(config: &Config) -> (Arc<Supervisor>, Arc<MemorySink>, CancellationToken) {
        let sink = Arc::new(MemorySink::default());
        let shutdown = CancellationToken::new();
        let (audit, _) = spawn_batcher(&config.audit, sink.clone(), shutdown.clone());
        let supervisor = Supervisor::new(Arc::new(SessionRegistry::new()), audit, config);
        (Arc::new(supervisor), sink, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_peer_closed_after_missed_probes() {
        let config = Config::for_tests();
        let pools = PoolSet::from_config(&config).unwrap();
        let (supervisor, _sink, _shutdown) = supervisor(&config);
        let (session, mut commands) = test_session(&pools, "alice");
        session.transition(SessionState::Established).unwrap();
        supervisor.registry.insert(session.clone()).unwrap();

        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);

        assert_eq!(supervisor.sweep(at(5)), SweepReport::default());
        assert_eq!(supervisor.sweep(at(10)).probes, 1);
        assert_eq!(
            commands.try_recv().unwrap(),
            SessionCommand::Control(FrameType::DpdRequest)
        );
        assert_eq!(supervisor.sweep(at(20)).probes, 1);
        assert_eq!(session.state(), SessionState::Established);

        assert_eq!(supervisor.sweep(at(30)).closed, 1);
        assert_eq!(session.close_reason(), Some(CloseReason::DeadPeer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_peer_stays_up() {
        let config = Config::for_tests();
        let pools = PoolSet::from_config(&config).unwrap();
        let (supervisor, _sink, _shutdown) = supervisor(&config);
        let (session, _commands) = test_session(&pools, "alice");
        session.transition(SessionState::Established).unwrap();
        supervisor.registry.insert(session.clone()).unwrap();

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(10)).await;
            supervisor.sweep(Instant::now());
            // DPD response from the client
            session.touch(false);
        }
        assert_eq!(session.state(), SessionState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_traffic_does_not_defer_idle_timeout() {
        let config = Config::for_tests();
        let pools = PoolSet::from_config(&config).unwrap();
        let (supervisor, _sink, _shutdown) = supervisor(&config);
        let (session, _commands) = test_session(&pools, "alice");
        session.transition(SessionState::Established).unwrap();
        supervisor.registry.insert(session.clone()).unwrap();

        // idle_timeout = 600s; keepalives every 5s
        for _ in 0..119 {
            tokio::time::advance(Duration::from_secs(5)).await;
            session.touch(false);
            supervisor.sweep(Instant::now());
        }
        assert_eq!(session.state(), SessionState::Established);
        tokio::time::advance(Duration::from_secs(5)).await;
        supervisor.sweep(Instant::now());
        assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rekey_not_reposted_while_pending() {
        let mut config = Config::for_tests();
        config.groups[0].rekey_interval = Some(60);
        let pools = PoolSet::from_config(&config).unwrap();
        let (supervisor, _sink, _shutdown) = supervisor(&config);

        let id = crate::session::SessionId::generate().unwrap();
        let pool = pools.get("staff").unwrap();
        let address = pool.allocate("alice", id).unwrap();
        let (session, _commands) = crate::session::Session::new(crate::session::SessionInit {
            id,
            identity: crate::auth::Identity {
                username: "alice".into(),
                group: "staff".into(),
            },
            policy: crate::policy::GroupPolicy::from_config(&config.groups[0], &config),
            leases: vec![crate::session::Lease { pool, address }],
            mtu: 1400,
            hostname: None,
            remote: "198.51.100.7:50000".parse().unwrap(),
            master_secret: None,
            outbound_capacity: 4,
        });
        session.transition(SessionState::Established).unwrap();
        supervisor.registry.insert(session.clone()).unwrap();

        let mut rekeys = 0;
        for _ in 0..30 {
            tokio::time::advance(Duration::from_secs(5)).await;
            session.touch(true);
            rekeys += supervisor.sweep(Instant::now()).rekeys;
        }
        assert_eq!(rekeys, 1);

        session.rekey_finished();
        for _ in 0..12 {
            tokio::time::advance(Duration::from_secs(5)).await;
            session.touch(true);
            rekeys += supervisor.sweep(Instant::now()).rekeys;
        }
        assert_eq!(rekeys, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_snapshots_submitted() {
        let mut config = Config::for_tests();
        config.timers.snapshot_interval = 1;
        let pools = PoolSet::from_config(&config).unwrap();
        let (supervisor, sink, shutdown) = supervisor(&config);
        let (session, _commands) = test_session(&pools, "alice");
        session.transition(SessionState::Established).unwrap();
        session.touch(true);
        supervisor.registry.insert(session.clone()).unwrap();

        let task = tokio::spawn(supervisor.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let snapshots = sink
            .events()
            .into_iter()
            .filter(|e| e.kind() == "traffic")
            .count();
        assert!(snapshots >= 2, "got {snapshots}");
    }
}
