//! Tunnel sessions and their lifecycle state machine

pub mod liveness;
pub mod queue;
pub mod registry;

pub use liveness::{LivenessAction, LivenessTracker};
pub use queue::OutboundQueue;
pub use registry::SessionRegistry;

use crate::auth::Identity;
use crate::crypto::{random_array, SECRET_LEN};
use crate::datagram::DataChannel;
use crate::error::{GatewayError, Result};
use crate::policy::GroupPolicy;
use crate::pool::AddressPool;
use crate::protocol::FrameType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Commands queued for a session's egress task
const COMMAND_QUEUE: usize = 16;

/// Opaque 32-byte session identifier, hex encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SECRET_LEN]);

impl SessionId {
    pub fn generate() -> Result<Self> {
        Ok(Self(random_array()?))
    }

    pub const fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to correlate log lines
        write!(f, "SessionId({}..)", &self.to_hex()[..12])
    }
}

impl FromStr for SessionId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| GatewayError::Protocol("Session id is not hex".into()))?;
        let bytes: [u8; SECRET_LEN] = bytes
            .try_into()
            .map_err(|_| GatewayError::Protocol("Session id must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Negotiating = 0,
    Established = 1,
    Rekeying = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Negotiating,
            1 => SessionState::Established,
            2 => SessionState::Rekeying,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Transition table; everything not listed is illegal
    pub const fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Negotiating, Established)
                | (Negotiating, Closing)
                | (Negotiating, Closed)
                | (Established, Rekeying)
                | (Established, Closing)
                | (Rekeying, Established)
                | (Rekeying, Closing)
                | (Closing, Closed)
        )
    }

    /// States in which the session owns its address
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Negotiating | SessionState::Established | SessionState::Rekeying
        )
    }

    /// States in which packets are forwarded
    pub const fn forwards_traffic(self) -> bool {
        matches!(self, SessionState::Established | SessionState::Rekeying)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Established => "established",
            SessionState::Rekeying => "rekeying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    AdminKick,
    IdleTimeout,
    DeadPeer,
    ProtocolError(String),
    SendFailure,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnect => f.write_str("client disconnect"),
            CloseReason::AdminKick => f.write_str("admin kick"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::DeadPeer => f.write_str("dead peer"),
            CloseReason::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
            CloseReason::SendFailure => f.write_str("send failure"),
            CloseReason::Shutdown => f.write_str("gateway shutdown"),
        }
    }
}

/// Work the supervisor or ingress side hands to the egress task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a payload-less control frame (DPD request/response, keepalive)
    Control(FrameType),
    Rekey,
}

/// An address held by a session and the pool it came from
#[derive(Debug, Clone)]
pub struct Lease {
    pub pool: Arc<AddressPool>,
    pub address: IpAddr,
}

/// Traffic counters
#[derive(Debug, Default)]
pub struct SessionStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    /// Oldest packets evicted from the outbound queue
    pub dropped_overflow: AtomicU64,
    pub dropped_acl: AtomicU64,
    pub dropped_spoofed: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub dropped_overflow: u64,
    pub dropped_acl: u64,
    pub dropped_spoofed: u64,
}

impl SessionStats {
    pub fn record_in(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn counters(&self) -> TrafficCounters {
        TrafficCounters {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_acl: self.dropped_acl.load(Ordering::Relaxed),
            dropped_spoofed: self.dropped_spoofed.load(Ordering::Relaxed),
        }
    }
}

/// Everything the negotiator decided for a new session
#[derive(Debug)]
pub struct SessionInit {
    pub id: SessionId,
    pub identity: Identity,
    pub policy: GroupPolicy,
    pub leases: Vec<Lease>,
    pub mtu: u16,
    pub hostname: Option<String>,
    pub remote: SocketAddr,
    pub master_secret: Option<[u8; SECRET_LEN]>,
    pub outbound_capacity: usize,
}

/// Access records already written, keyed by (protocol, destination, port)
type AccessKey = (u8, IpAddr, u16);

/// A tunnel endpoint
pub struct Session {
    id: SessionId,
    identity: Identity,
    policy: GroupPolicy,
    leases: Vec<Lease>,
    mtu: u16,
    hostname: Option<String>,
    remote: SocketAddr,
    master_secret: Option<[u8; SECRET_LEN]>,
    started_at: SystemTime,
    created: Instant,
    established_at: Mutex<Option<Instant>>,

    state: AtomicU8,
    epoch: AtomicU32,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,

    data_channel: Mutex<Option<Arc<DataChannel>>>,
    outbound: OutboundQueue,
    commands: mpsc::Sender<SessionCommand>,
    liveness: Mutex<LivenessTracker>,
    access_seen: Mutex<HashMap<AccessKey, Instant>>,
    pub stats: SessionStats,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.identity.username)
            .field("state", &self.state())
            .field("addresses", &self.addresses())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in `Negotiating` together with its command receiver
    pub fn new(init: SessionInit) -> (Arc<Self>, mpsc::Receiver<SessionCommand>) {
        let now = Instant::now();
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let session = Arc::new(Self {
            id: init.id,
            liveness: Mutex::new(LivenessTracker::new(init.policy.timers, now)),
            identity: init.identity,
            policy: init.policy,
            leases: init.leases,
            mtu: init.mtu,
            hostname: init.hostname,
            remote: init.remote,
            master_secret: init.master_secret,
            started_at: SystemTime::now(),
            created: now,
            established_at: Mutex::new(None),
            state: AtomicU8::new(SessionState::Negotiating as u8),
            epoch: AtomicU32::new(1),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            data_channel: Mutex::new(None),
            outbound: OutboundQueue::new(init.outbound_capacity),
            commands,
            access_seen: Mutex::new(HashMap::new()),
            stats: SessionStats::default(),
        });
        (session, command_rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    pub fn policy(&self) -> &GroupPolicy {
        &self.policy
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.leases.iter().map(|l| l.address).collect()
    }

    pub fn owns_address(&self, addr: &IpAddr) -> bool {
        self.leases.iter().any(|l| l.address == *addr)
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn master_secret(&self) -> Option<&[u8; SECRET_LEN]> {
        self.master_secret.as_ref()
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn established_at(&self) -> Option<Instant> {
        *self.established_at.lock()
    }

    /// Locally administered MAC used when answering ARP for this session.
    ///
    /// Built from the first leased address, which the registry keeps unique
    /// among live sessions: `02:00` plus the IPv4 octets, or `06` plus the
    /// low five bytes of an IPv6 address.
    pub fn mac(&self) -> [u8; 6] {
        let v4 = self.leases.iter().find_map(|l| match l.address {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        });
        match (v4, self.leases.first()) {
            (Some(v4), _) => {
                let o = v4.octets();
                [0x02, 0x00, o[0], o[1], o[2], o[3]]
            }
            (None, Some(Lease { address: IpAddr::V6(v6), .. })) => {
                let o = v6.octets();
                [0x06, o[11], o[12], o[13], o[14], o[15]]
            }
            _ => {
                let b = &self.id.0;
                [0x0A, b[0], b[1], b[2], b[3], b[4]]
            }
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if the transition table allows it
    pub fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut current = self.state();
        loop {
            if !current.can_transition_to(next) {
                return Err(GatewayError::InvalidState(format!(
                    "session {}: {current} -> {next}",
                    self.id
                )));
            }
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = SessionState::from_u8(actual),
            }
        }
        if next == SessionState::Established {
            let mut established = self.established_at.lock();
            if established.is_none() {
                *established = Some(Instant::now());
            }
        }
        Ok(current)
    }

    /// Start closing. Only the first caller wins; later triggers are no-ops.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        let mut current = self.state();
        loop {
            if !current.is_live() {
                return false;
            }
            match self.state.compare_exchange(
                current as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = SessionState::from_u8(actual),
            }
        }
        log::info!(
            "Session {} ({}) closing: {reason}",
            self.id,
            self.identity.username
        );
        *self.close_reason.lock() = Some(reason);
        self.cancel.cancel();
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Advance the shared cipher epoch; returns the new value
    pub fn bump_epoch(&self) -> u32 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn data_channel(&self) -> Option<Arc<DataChannel>> {
        self.data_channel.lock().clone()
    }

    pub fn attach_data_channel(&self, channel: Arc<DataChannel>) -> Result<()> {
        let mut slot = self.data_channel.lock();
        if slot.is_some() {
            return Err(GatewayError::InvalidState(format!(
                "session {} already has a data channel",
                self.id
            )));
        }
        *slot = Some(channel);
        Ok(())
    }

    /// Drop the data channel; the session continues control-only
    pub fn detach_data_channel(&self) -> Option<Arc<DataChannel>> {
        self.data_channel.lock().take()
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Queue a packet for the client, counting an overflow drop
    pub fn enqueue(&self, packet: bytes::Bytes) {
        if self.outbound.push(packet) {
            self.stats.dropped_overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Post a command without waiting; returns false if the queue is full
    pub fn post(&self, command: SessionCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    pub fn touch(&self, data: bool) {
        self.liveness.lock().on_activity(Instant::now(), data);
    }

    pub fn evaluate_liveness(&self, now: Instant) -> LivenessAction {
        self.liveness.lock().evaluate(now)
    }

    pub fn rekey_finished(&self) {
        self.liveness.lock().on_rekeyed(Instant::now());
    }

    /// Whether an access record for this flow should be written now
    pub fn should_audit_access(&self, key: AccessKey, interval: Duration, now: Instant) -> bool {
        let mut seen = self.access_seen.lock();
        match seen.get(&key) {
            Some(last) if now.saturating_duration_since(*last) < interval => false,
            _ => {
                seen.insert(key, now);
                if seen.len() > 4096 {
                    seen.retain(|_, t| now.saturating_duration_since(*t) < interval);
                }
                true
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            username: self.identity.username.clone(),
            group: self.identity.group.clone(),
            addresses: self.addresses(),
            state: self.state(),
            remote: self.remote,
            hostname: self.hostname.clone(),
            mtu: self.mtu,
            epoch: self.epoch(),
            data_channel: self.data_channel().is_some(),
            queued: self.outbound.len(),
            connected_for: self.created.elapsed(),
            counters: self.stats.counters(),
        }
    }
}

/// Read-only view of a session for administration
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub username: String,
    pub group: String,
    pub addresses: Vec<IpAddr>,
    pub state: SessionState,
    pub remote: SocketAddr,
    pub hostname: Option<String>,
    pub mtu: u16,
    pub epoch: u32,
    pub data_channel: bool,
    pub queued: usize,
    pub connected_for: Duration,
    pub counters: TrafficCounters,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pool::PoolSet;

    /// Build a session holding `address` from the `staff` test pool
    pub(crate) fn test_session(
        pools: &PoolSet,
        user: &str,
    ) -> (Arc<Session>, mpsc::Receiver<SessionCommand>) {
        let config = Config::for_tests();
        let policy = GroupPolicy::from_config(&config.groups[0], &config);
        let id = SessionId::generate().unwrap();
        let pool = pools.get("staff").unwrap();
        let address = pool.allocate(user, id).unwrap();
        Session::new(SessionInit {
            id,
            identity: Identity {
                username: user.to_string(),
                group: "staff".to_string(),
            },
            policy,
            leases: vec![Lease { pool, address }],
            mtu: 1400,
            hostname: None,
            remote: "198.51.100.7:50000".parse().unwrap(),
            master_secret: Some([4u8; 32]),
            outbound_capacity: 4,
        })
    }

    #[test]
    fn test_session_id_hex() {
        let id = SessionId::from_bytes([0xAB; 32]);
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert!("abcd".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Negotiating.can_transition_to(Established));
        assert!(Established.can_transition_to(Rekeying));
        assert!(Rekeying.can_transition_to(Established));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Established));
        assert!(!Closing.can_transition_to(Established));
        assert!(!Negotiating.can_transition_to(Rekeying));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let pools = PoolSet::from_config(&Config::for_tests()).unwrap();
        let (session, _rx) = test_session(&pools, "alice");
        let err = session.transition(SessionState::Rekeying).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState(_)));
        assert_eq!(session.state(), SessionState::Negotiating);

        session.transition(SessionState::Established).unwrap();
        assert!(session.established_at().is_some());
    }

    #[test]
    fn test_mac_follows_leased_address() {
        let pools = PoolSet::from_config(&Config::for_tests()).unwrap();
        let sessions: Vec<_> = (0..50)
            .map(|n| test_session(&pools, &format!("user-{n}")))
            .collect();

        let mut seen = std::collections::HashSet::new();
        for (session, _rx) in &sessions {
            let mac = session.mac();
            let IpAddr::V4(v4) = session.addresses()[0] else {
                panic!("staff pool is IPv4");
            };
            assert_eq!(&mac[..2], &[0x02, 0x00]);
            assert_eq!(&mac[2..], &v4.octets());
            assert!(seen.insert(mac), "MAC {mac:02x?} shared by two sessions");
        }
    }

    #[test]
    fn test_begin_close_only_once() {
        let pools = PoolSet::from_config(&Config::for_tests()).unwrap();
        let (session, _rx) = test_session(&pools, "alice");
        session.transition(SessionState::Established).unwrap();

        assert!(session.begin_close(CloseReason::IdleTimeout));
        assert!(!session.begin_close(CloseReason::AdminKick));
        assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));
        assert!(session.cancel_token().is_cancelled());
        assert!(session.transition(SessionState::Established).is_err());
        session.transition(SessionState::Closed).unwrap();
        assert!(!session.begin_close(CloseReason::DeadPeer));
    }

    #[test]
    fn test_overflow_counted_per_session() {
        let pools = PoolSet::from_config(&Config::for_tests()).unwrap();
        let (a, _rx_a) = test_session(&pools, "alice");
        let (b, _rx_b) = test_session(&pools, "bob");
        for i in 0..6u8 {
            a.enqueue(bytes::Bytes::from(vec![i]));
        }
        b.enqueue(bytes::Bytes::from_static(b"b"));
        assert_eq!(a.stats.counters().dropped_overflow, 2);
        assert_eq!(b.stats.counters().dropped_overflow, 0);
        assert_eq!(a.outbound().pop().unwrap()[0], 2);
    }

    #[test]
    fn test_access_dedupe() {
        let pools = PoolSet::from_config(&Config::for_tests()).unwrap();
        let (s, _rx) = test_session(&pools, "alice");
        let key = (6, "10.0.0.1".parse().unwrap(), 443);
        let now = Instant::now();
        let interval = Duration::from_secs(60);
        assert!(s.should_audit_access(key, interval, now));
        assert!(!s.should_audit_access(key, interval, now + Duration::from_secs(30)));
        assert!(s.should_audit_access(key, interval, now + Duration::from_secs(61)));
    }
}
