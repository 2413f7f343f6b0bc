//! Tunnel router: moves packets between the shared device and sessions
//!
//! Device → client: one reader task pulls frames off the device and hashes
//! each packet by destination onto a fixed pool of workers. A worker looks
//! the destination up in the registry and appends the packet to that
//! session's outbound queue. Misses and full worker queues are dropped and
//! counted, never buffered.
//!
//! Client → device: session ingress tasks call [`Router::deliver_inbound`],
//! which checks the source address and the group ACL and then hands the
//! packet to the single device writer task through a bounded channel.

use crate::audit::{AuditEvent, AuditHandle};
use crate::config::{Config, LinkMode};
use crate::device::{ethernet, DeviceReader, DeviceWriter};
use crate::error::{GatewayError, Result};
use crate::policy::acl_permits;
use crate::protocol::ip;
use crate::session::{Session, SessionRegistry};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Data-plane counters. Per-packet events are counted here, not logged.
#[derive(Debug, Default)]
pub struct RouterStats {
    /// Frames read from the device
    pub device_frames: AtomicU64,
    /// Packets handed to a session's outbound queue
    pub delivered: AtomicU64,
    /// Destination not bound to a session
    pub no_route: AtomicU64,
    /// Not IP, truncated, or otherwise unusable
    pub unparsable: AtomicU64,
    /// Worker dispatch queue full
    pub dispatch_dropped: AtomicU64,
    /// Client packets written to the device
    pub from_clients: AtomicU64,
    /// Client packets with a source address the session does not own
    pub spoofed: AtomicU64,
    /// Client packets refused by the group ACL
    pub acl_denied: AtomicU64,
    pub arp_replies: AtomicU64,
}

/// Snapshot of [`RouterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterCounters {
    pub device_frames: u64,
    pub delivered: u64,
    pub no_route: u64,
    pub unparsable: u64,
    pub dispatch_dropped: u64,
    pub from_clients: u64,
    pub spoofed: u64,
    pub acl_denied: u64,
    pub arp_replies: u64,
}

impl RouterStats {
    pub fn counters(&self) -> RouterCounters {
        RouterCounters {
            device_frames: self.device_frames.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            unparsable: self.unparsable.load(Ordering::Relaxed),
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            from_clients: self.from_clients.load(Ordering::Relaxed),
            spoofed: self.spoofed.load(Ordering::Relaxed),
            acl_denied: self.acl_denied.load(Ordering::Relaxed),
            arp_replies: self.arp_replies.load(Ordering::Relaxed),
        }
    }
}

/// First fatal error raised by a device task
#[derive(Debug, Clone, Default)]
pub struct FatalSignal {
    token: CancellationToken,
    error: Arc<Mutex<Option<GatewayError>>>,
}

impl FatalSignal {
    pub fn raise(&self, error: GatewayError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            log::error!("Fatal data-plane error: {error}");
            *slot = Some(error);
        }
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for a fatal error and take it
    pub async fn wait(&self) -> GatewayError {
        self.token.cancelled().await;
        self.error
            .lock()
            .take()
            .unwrap_or_else(|| GatewayError::DeviceIo("device task stopped".into()))
    }
}

/// Reloadable router knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    pub access_audit_interval: Option<Duration>,
    pub drain_on_close: bool,
    pub drain_timeout: Duration,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            access_audit_interval: crate::config::secs_or_none(config.audit.access_audit_interval),
            drain_on_close: config.router.drain_on_close,
            drain_timeout: Duration::from_millis(config.router.drain_timeout_ms),
        }
    }
}

pub struct Router {
    registry: Arc<SessionRegistry>,
    audit: AuditHandle,
    link_mode: LinkMode,
    device_tx: mpsc::Sender<Bytes>,
    /// MAC of the host side of a layer-2 device, learned from its frames
    host_mac: Mutex<[u8; 6]>,
    settings: RwLock<RouterSettings>,
    fatal: FatalSignal,
    pub stats: RouterStats,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("link_mode", &self.link_mode)
            .field("stats", &self.stats.counters())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create the router and the receiving end of the device write queue
    pub fn new(
        registry: Arc<SessionRegistry>,
        audit: AuditHandle,
        config: &Config,
        fatal: FatalSignal,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (device_tx, device_rx) = mpsc::channel(config.router.device_queue.max(1));
        let router = Arc::new(Self {
            registry,
            audit,
            link_mode: config.device.mode,
            device_tx,
            host_mac: Mutex::new(ethernet::BROADCAST),
            settings: RwLock::new(RouterSettings::from_config(config)),
            fatal,
            stats: RouterStats::default(),
        });
        (router, device_rx)
    }

    pub fn settings(&self) -> RouterSettings {
        *self.settings.read()
    }

    pub fn reload(&self, config: &Config) {
        *self.settings.write() = RouterSettings::from_config(config);
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &AuditHandle {
        &self.audit
    }

    pub fn fatal(&self) -> &FatalSignal {
        &self.fatal
    }

    /// Start the device reader, worker pool and device writer
    pub fn spawn_device_tasks(
        self: &Arc<Self>,
        reader: Box<dyn DeviceReader>,
        writer: Box<dyn DeviceWriter>,
        device_rx: mpsc::Receiver<Bytes>,
        workers: usize,
        worker_queue: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers + 2);
        let mut senders = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel(worker_queue.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(self.clone().run_worker(index, rx)));
        }
        handles.push(tokio::spawn(
            self.clone().run_device_reader(reader, senders, shutdown.clone()),
        ));
        handles.push(tokio::spawn(
            self.clone().run_device_writer(writer, device_rx, shutdown),
        ));
        log::info!("Router started with {workers} workers");
        handles
    }

    async fn run_device_reader(
        self: Arc<Self>,
        mut reader: Box<dyn DeviceReader>,
        workers: Vec<mpsc::Sender<(IpAddr, Bytes)>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = reader.read_packet() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.fatal.raise(e);
                    break;
                }
            };
            self.stats.device_frames.fetch_add(1, Ordering::Relaxed);

            let Some(packet) = self.strip_link_header(frame) else {
                continue;
            };
            let Some(dst) = ip::destination(&packet) else {
                self.stats.unparsable.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let worker = &workers[worker_index(&dst, workers.len())];
            if worker.try_send((dst, packet)).is_err() {
                self.stats.dispatch_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        log::debug!("Device reader stopped");
    }

    /// Remove the Ethernet header in layer-2 modes; answers ARP inline
    fn strip_link_header(&self, frame: Bytes) -> Option<Bytes> {
        if !self.link_mode.is_ethernet() {
            return Some(frame);
        }
        match ethernet::classify(&frame) {
            ethernet::Inbound::Ip { packet, src_mac } => {
                *self.host_mac.lock() = src_mac;
                Some(packet)
            }
            ethernet::Inbound::ArpRequest(request) => {
                self.answer_arp(&request);
                None
            }
            ethernet::Inbound::Other => {
                self.stats.unparsable.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn answer_arp(&self, request: &ethernet::ArpRequest) {
        *self.host_mac.lock() = request.sender_mac;
        let Some(session) = self
            .registry
            .lookup_addr(&IpAddr::V4(request.target_ip))
            .filter(|s| s.state().forwards_traffic())
        else {
            return;
        };
        let reply = ethernet::arp_reply(request, session.mac());
        if self.device_tx.try_send(reply).is_ok() {
            self.stats.arp_replies.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn run_worker(self: Arc<Self>, index: usize, mut rx: mpsc::Receiver<(IpAddr, Bytes)>) {
        while let Some((dst, packet)) = rx.recv().await {
            self.route_outbound(dst, packet);
        }
        log::trace!("Router worker {index} stopped");
    }

    /// Hand one device packet to the session owning `dst`
    pub fn route_outbound(&self, dst: IpAddr, packet: Bytes) {
        match self.registry.lookup_addr(&dst) {
            Some(session) if session.state().forwards_traffic() => {
                session.enqueue(packet);
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.no_route.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn run_device_writer(
        self: Arc<Self>,
        mut writer: Box<dyn DeviceWriter>,
        mut rx: mpsc::Receiver<Bytes>,
        shutdown: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = writer.write_packet(&frame).await {
                self.fatal.raise(e);
                break;
            }
        }
        log::debug!("Device writer stopped");
    }

    /// Forward a packet received from `session` to the device.
    ///
    /// Packets with a foreign source address or denied by the ACL are
    /// dropped and counted. Awaiting the device queue preserves the
    /// session's receive order.
    pub async fn deliver_inbound(&self, session: &Session, packet: Bytes) -> Result<()> {
        let info = match ip::inspect(&packet) {
            Ok(info) => info,
            Err(_) => {
                self.stats.unparsable.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        if !session.owns_address(&info.src) {
            session.stats.dropped_spoofed.fetch_add(1, Ordering::Relaxed);
            self.stats.spoofed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if !acl_permits(&session.policy().acl, &info) {
            session.stats.dropped_acl.fetch_add(1, Ordering::Relaxed);
            self.stats.acl_denied.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        session.stats.record_in(packet.len());

        if let Some(interval) = self.settings.read().access_audit_interval {
            let port = info.dst_port.unwrap_or(0);
            let key = (info.protocol, info.dst, port);
            if session.should_audit_access(key, interval, Instant::now()) {
                self.audit.submit(AuditEvent::Access {
                    session_id: session.id(),
                    username: session.username().to_string(),
                    protocol: info.protocol,
                    destination: info.dst,
                    port,
                    at: SystemTime::now(),
                });
            }
        }

        let frame = if self.link_mode.is_ethernet() {
            ethernet::wrap(&packet, *self.host_mac.lock(), session.mac())
        } else {
            packet
        };
        self.device_tx
            .send(frame)
            .await
            .map_err(|_| GatewayError::DeviceIo("device writer stopped".into()))?;
        self.stats.from_clients.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn worker_index(dst: &IpAddr, workers: usize) -> usize {
    match dst {
        // Cheap and stable for the common case
        IpAddr::V4(v4) => (u32::from(*v4) as usize) % workers,
        IpAddr::V6(_) => {
            let mut hasher = DefaultHasher::new();
            dst.hash(&mut hasher);
            (hasher.finish() as usize) % workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::spawn_batcher;
    use crate::audit::tests::MemorySink;
    use crate::device::memory_device;
    use crate::pool::PoolSet;
    use crate::protocol::ip::{build_ipv4, PROTO_TCP};
    use crate::session::tests::test_session;
    use crate::session::SessionState;
    use std::net::Ipv4Addr;

    struct Fixture {
        router: Arc<Router>,
        pools: PoolSet,
        device: crate::device::MemoryDeviceHandle,
        shutdown: CancellationToken,
        sink: Arc<MemorySink>,
    }

    fn fixture(mutate: impl FnOnce(&mut Config)) -> Fixture {
        let mut config = Config::for_tests();
        mutate(&mut config);
        let registry = Arc::new(SessionRegistry::new());
        let sink = Arc::new(MemorySink::default());
        let shutdown = CancellationToken::new();
        let (audit, _task) = spawn_batcher(&config.audit, sink.clone(), shutdown.clone());
        let (router, device_rx) = Router::new(registry, audit, &config, FatalSignal::default());
        let (reader, writer, device) = memory_device(64);
        router.spawn_device_tasks(
            Box::new(reader),
            Box::new(writer),
            device_rx,
            2,
            16,
            shutdown.clone(),
        );
        Fixture {
            router,
            pools: PoolSet::from_config(&config).unwrap(),
            device,
            shutdown,
            sink,
        }
    }

    fn v4(addr: IpAddr) -> Ipv4Addr {
        match addr {
            IpAddr::V4(a) => a,
            IpAddr::V6(_) => panic!("expected IPv4"),
        }
    }

    #[tokio::test]
    async fn test_device_packet_reaches_only_owner() {
        let fx = fixture(|_| {});
        let (a, _rx_a) = test_session(&fx.pools, "alice");
        let (b, _rx_b) = test_session(&fx.pools, "bob");
        for s in [&a, &b] {
            s.transition(SessionState::Established).unwrap();
            fx.router.registry().insert(s.clone()).unwrap();
        }

        let to_a = build_ipv4(
            Ipv4Addr::new(10, 0, 0, 9),
            v4(a.addresses()[0]),
            PROTO_TCP,
            22,
            b"hello",
        );
        let unassigned = build_ipv4(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(10, 8, 0, 250),
            PROTO_TCP,
            22,
            b"nobody",
        );
        fx.device.inject.send(Bytes::from(to_a.clone())).await.unwrap();
        fx.device.inject.send(Bytes::from(unassigned)).await.unwrap();
        fx.device.inject.send(Bytes::from_static(b"\x00junk")).await.unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(1), a.outbound().next())
            .await
            .unwrap();
        assert_eq!(&packet[..], &to_a[..]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.outbound().is_empty());

        let counters = fx.router.stats.counters();
        assert_eq!(counters.delivered, 1);
        assert_eq!(counters.no_route, 1);
        assert_eq!(counters.unparsable, 1);
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_inbound_checks_source_and_acl() {
        let mut fx = fixture(|_| {});
        let (s, _rx) = test_session(&fx.pools, "alice");
        s.transition(SessionState::Established).unwrap();
        let src = v4(s.addresses()[0]);

        let good = build_ipv4(src, Ipv4Addr::new(10, 0, 0, 1), PROTO_TCP, 80, b"ok");
        fx.router.deliver_inbound(&s, Bytes::from(good.clone())).await.unwrap();
        let written = fx.device.written.recv().await.unwrap();
        assert_eq!(&written[..], &good[..]);

        let spoofed = build_ipv4(
            Ipv4Addr::new(10, 8, 0, 99),
            Ipv4Addr::new(10, 0, 0, 1),
            PROTO_TCP,
            80,
            b"",
        );
        fx.router.deliver_inbound(&s, Bytes::from(spoofed)).await.unwrap();
        assert_eq!(s.stats.counters().dropped_spoofed, 1);
        assert_eq!(s.stats.counters().packets_in, 1);
        assert!(fx.device.written.try_recv().is_err());
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_acl_denied_is_counted() {
        let mut fx = fixture(|_| {});
        let config = Config::for_tests();
        let policy = crate::policy::GroupPolicy::from_config(&config.groups[1], &config);
        let pool = fx.pools.get("tiny").unwrap();
        let id = crate::session::SessionId::generate().unwrap();
        let address = pool.allocate("eve", id).unwrap();
        let (s, _rx) = Session::new(crate::session::SessionInit {
            id,
            identity: crate::auth::Identity {
                username: "eve".into(),
                group: "contractors".into(),
            },
            policy,
            leases: vec![crate::session::Lease { pool, address }],
            mtu: 1400,
            hostname: None,
            remote: "198.51.100.1:1".parse().unwrap(),
            master_secret: None,
            outbound_capacity: 4,
        });
        let src = v4(address);
        let denied = build_ipv4(src, Ipv4Addr::new(10, 0, 1, 5), PROTO_TCP, 22, b"");
        let allowed = build_ipv4(src, Ipv4Addr::new(10, 0, 1, 5), PROTO_TCP, 443, b"");
        fx.router.deliver_inbound(&s, Bytes::from(denied)).await.unwrap();
        fx.router.deliver_inbound(&s, Bytes::from(allowed.clone())).await.unwrap();

        assert_eq!(s.stats.counters().dropped_acl, 1);
        assert_eq!(&fx.device.written.recv().await.unwrap()[..], &allowed[..]);
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_audit_deduplicated() {
        let mut fx = fixture(|c| c.audit.access_audit_interval = 60);
        let (s, _rx) = test_session(&fx.pools, "alice");
        let src = v4(s.addresses()[0]);
        let packet = Bytes::from(build_ipv4(src, Ipv4Addr::new(10, 0, 0, 1), PROTO_TCP, 443, b""));
        for _ in 0..3 {
            fx.router.deliver_inbound(&s, packet.clone()).await.unwrap();
            fx.device.written.recv().await.unwrap();
        }
        fx.shutdown.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let access: Vec<_> = fx
            .sink
            .events()
            .into_iter()
            .filter(|e| e.kind() == "access")
            .collect();
        assert_eq!(access.len(), 1);
    }

    #[tokio::test]
    async fn test_device_failure_is_fatal() {
        let fx = fixture(|_| {});
        let fatal = fx.router.fatal().clone();
        drop(fx.device);
        let err = tokio::time::timeout(Duration::from_secs(1), fatal.wait())
            .await
            .unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_tap_mode_answers_arp_and_wraps_frames() {
        let mut fx = fixture(|c| c.device.mode = LinkMode::Tap);
        let (s, _rx) = test_session(&fx.pools, "alice");
        s.transition(SessionState::Established).unwrap();
        fx.router.registry().insert(s.clone()).unwrap();
        let addr = v4(s.addresses()[0]);

        let host_mac = [0x52, 0x54, 0, 0, 0, 1];
        let mut arp = Vec::new();
        arp.extend_from_slice(&ethernet::BROADCAST);
        arp.extend_from_slice(&host_mac);
        arp.extend_from_slice(&ethernet::ETHERTYPE_ARP.to_be_bytes());
        arp.extend_from_slice(&[0, 1, 8, 0, 6, 4, 0, 1]);
        arp.extend_from_slice(&host_mac);
        arp.extend_from_slice(&[10, 8, 0, 1]);
        arp.extend_from_slice(&[0; 6]);
        arp.extend_from_slice(&addr.octets());
        fx.device.inject.send(Bytes::from(arp)).await.unwrap();

        let reply = fx.device.written.recv().await.unwrap();
        assert_eq!(&reply[..6], &host_mac);
        assert_eq!(&reply[22..28], &s.mac());

        let packet = build_ipv4(addr, Ipv4Addr::new(10, 0, 0, 1), PROTO_TCP, 80, b"x");
        fx.router.deliver_inbound(&s, Bytes::from(packet.clone())).await.unwrap();
        let frame = fx.device.written.recv().await.unwrap();
        assert_eq!(&frame[..6], &host_mac);
        assert_eq!(&frame[ethernet::HEADER_LEN..], &packet[..]);
        fx.shutdown.cancel();
    }
}
