//! Configuration module for the SSL-VPN gateway
//!
//! This module provides TOML-based configuration parsing and validation.
//! Durations are expressed in whole seconds unless the field name says
//! otherwise (`*_ms`).

use crate::error::{GatewayError, Result};
use crate::policy::AclRule;
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Operating mode of the shared virtual interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Layer-3 point-to-point device carrying raw IP packets
    #[default]
    Tun,
    /// Layer-2 bridged device carrying Ethernet frames
    Tap,
    /// MAC-VLAN tap device (Ethernet framing, same as `Tap` for the router)
    Macvtap,
}

impl LinkMode {
    /// Whether packets on the device carry an Ethernet header
    pub fn is_ethernet(&self) -> bool {
        !matches!(self, LinkMode::Tun)
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP address for the TLS control channel
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Public hostname announced to clients
    pub hostname: String,
    /// Time allowed for TLS + control handshake in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u32,
    /// Concurrent sessions allowed per user (0 = unlimited)
    #[serde(default)]
    pub max_sessions_per_user: u32,
}

/// Certificate used for the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM certificate chain
    pub cert_path: String,
    /// PEM private key
    pub key_path: String,
}

/// Datagram channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtlsConfig {
    /// Offer the datagram channel to clients
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// UDP address (defaults to the control listen address)
    pub listen: Option<SocketAddr>,
    /// Seconds after establishment during which a datagram channel may attach
    #[serde(default = "default_attach_grace")]
    pub attach_grace: u32,
}

impl Default for DtlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: None,
            attach_grace: default_attach_grace(),
        }
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub mode: LinkMode,
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Address of the gateway side of the device (defaults to the first pool's gateway)
    pub address: Option<Ipv4Net>,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Tun,
            name: default_device_name(),
            address: None,
            mtu: default_mtu(),
        }
    }
}

/// Liveness and rekey timers (defaults for groups that do not override them)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Keepalive interval announced to clients
    #[serde(default = "default_keepalive")]
    pub keepalive: u32,
    /// Dead-peer-detection probe interval
    #[serde(default = "default_dpd_interval")]
    pub dpd_interval: u32,
    /// Consecutive silent DPD intervals before the session is closed
    #[serde(default = "default_dpd_max_missed")]
    pub dpd_max_missed: u32,
    /// Close sessions without data traffic for this long (0 = never)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u32,
    /// Lifetime of a cipher epoch (0 = never rekey)
    #[serde(default = "default_rekey_interval")]
    pub rekey_interval: u32,
    /// Supervisor scan period in milliseconds
    #[serde(default = "default_supervisor_tick_ms")]
    pub supervisor_tick_ms: u64,
    /// Traffic snapshot period (0 = disabled)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            keepalive: default_keepalive(),
            dpd_interval: default_dpd_interval(),
            dpd_max_missed: default_dpd_max_missed(),
            idle_timeout: default_idle_timeout(),
            rekey_interval: default_rekey_interval(),
            supervisor_tick_ms: default_supervisor_tick_ms(),
            snapshot_interval: default_snapshot_interval(),
        }
    }
}

impl TimerConfig {
    pub fn supervisor_tick(&self) -> Duration {
        Duration::from_millis(self.supervisor_tick_ms)
    }

    pub fn snapshot_every(&self) -> Option<Duration> {
        secs_or_none(self.snapshot_interval)
    }
}

/// Data-plane sizing and shutdown policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Classification workers (0 = available parallelism)
    #[serde(default)]
    pub workers: usize,
    /// Per-worker dispatch queue
    #[serde(default = "default_worker_queue")]
    pub worker_queue: usize,
    /// Per-session outbound queue bound
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Shared device write queue
    #[serde(default = "default_device_queue")]
    pub device_queue: usize,
    /// Flush queued packets to the client when a session closes
    #[serde(default = "default_true")]
    pub drain_on_close: bool,
    /// Upper bound on the drain
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Seconds to wait for sessions to close on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            worker_queue: default_worker_queue(),
            outbound_queue: default_outbound_queue(),
            device_queue: default_device_queue(),
            drain_on_close: true,
            drain_timeout_ms: default_drain_timeout_ms(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl RouterConfig {
    /// Worker count with the `0 = auto` rule applied
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Audit batching thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between time-triggered flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u32,
    /// Delivery attempts per batch before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial retry backoff in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Pending events buffered before new ones are dropped
    #[serde(default = "default_audit_buffer")]
    pub buffer: usize,
    /// De-duplication window for access records (0 = access auditing off)
    #[serde(default)]
    pub access_audit_interval: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            buffer: default_audit_buffer(),
            access_audit_interval: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Address fixed to a user inside a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub user: String,
    pub address: IpAddr,
}

/// A named address pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub network: IpNet,
    /// Gateway address inside the network (defaults to the first host)
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
}

/// A policy group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Pool providing the IPv4 (or sole) address
    pub pool: String,
    /// Optional second pool for an IPv6 address
    pub ipv6_pool: Option<String>,
    /// Split-include routes (empty = full tunnel)
    #[serde(default)]
    pub route_include: Vec<IpNet>,
    #[serde(default)]
    pub route_exclude: Vec<IpNet>,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Let clients reach their local LAN directly
    #[serde(default)]
    pub allow_lan: bool,
    /// Split-tunnel ACL (empty = allow everything)
    #[serde(default)]
    pub acl: Vec<AclRule>,
    pub mtu: Option<u16>,
    pub idle_timeout: Option<u32>,
    pub rekey_interval: Option<u32>,
    pub dpd_interval: Option<u32>,
}

/// A locally defined user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>`
    pub password_hash: String,
    pub group: String,
    #[serde(default)]
    pub disabled: bool,
    /// Unix timestamp after which logins are refused
    pub expires_at: Option<u64>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsSettings,
    #[serde(default)]
    pub dtls: DtlsConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GatewayError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.hostname.is_empty() {
            return Err(GatewayError::Config(
                "Server hostname cannot be empty".to_string(),
            ));
        }

        if self.server.handshake_timeout == 0 {
            return Err(GatewayError::Config(
                "Handshake timeout cannot be zero".to_string(),
            ));
        }

        if self.device.mtu < 576 || self.device.mtu > 9000 {
            return Err(GatewayError::Config(
                "MTU must be between 576 and 9000".to_string(),
            ));
        }

        if self.timers.dpd_interval == 0 || self.timers.dpd_max_missed == 0 {
            return Err(GatewayError::Config(
                "DPD interval and missed-probe count must be positive".to_string(),
            ));
        }

        if self.timers.supervisor_tick_ms == 0 {
            return Err(GatewayError::Config(
                "Supervisor tick cannot be zero".to_string(),
            ));
        }

        if self.router.outbound_queue == 0
            || self.router.worker_queue == 0
            || self.router.device_queue == 0
        {
            return Err(GatewayError::Config(
                "Router queue sizes must be positive".to_string(),
            ));
        }

        if self.audit.batch_size == 0 || self.audit.max_attempts == 0 || self.audit.buffer == 0 {
            return Err(GatewayError::Config(
                "Audit batch size, buffer and attempts must be positive".to_string(),
            ));
        }

        let mut pool_names = HashSet::new();
        for pool in &self.pools {
            if !pool_names.insert(pool.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate pool name: {}",
                    pool.name
                )));
            }
            if let Some(gateway) = pool.gateway {
                if !pool.network.contains(&gateway) {
                    return Err(GatewayError::Config(format!(
                        "Gateway {gateway} is outside pool {} ({})",
                        pool.name, pool.network
                    )));
                }
            }
            for reservation in &pool.reservations {
                if !pool.network.contains(&reservation.address) {
                    return Err(GatewayError::Config(format!(
                        "Reservation {} for {} is outside pool {}",
                        reservation.address, reservation.user, pool.name
                    )));
                }
            }
        }

        let mut group_names = HashSet::new();
        for group in &self.groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate group name: {}",
                    group.name
                )));
            }
            if !pool_names.contains(group.pool.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Group {} references unknown pool {}",
                    group.name, group.pool
                )));
            }
            if let Some(ref v6) = group.ipv6_pool {
                if !pool_names.contains(v6.as_str()) {
                    return Err(GatewayError::Config(format!(
                        "Group {} references unknown pool {v6}",
                        group.name
                    )));
                }
            }
            if let Some(mtu) = group.mtu {
                if !(576..=9000).contains(&mtu) {
                    return Err(GatewayError::Config(format!(
                        "Group {} MTU must be between 576 and 9000",
                        group.name
                    )));
                }
            }
        }

        for user in &self.users {
            if !group_names.contains(user.group.as_str()) {
                return Err(GatewayError::Config(format!(
                    "User {} references unknown group {}",
                    user.username, user.group
                )));
            }
        }

        Ok(())
    }

    /// Address of the gateway side of the virtual device
    pub fn device_address(&self) -> Result<Ipv4Net> {
        if let Some(address) = self.device.address {
            return Ok(address);
        }
        for pool in &self.pools {
            if let IpNet::V4(net) = pool.network {
                let gateway = match pool.gateway {
                    Some(IpAddr::V4(gw)) => gw,
                    _ => net.hosts().next().ok_or_else(|| {
                        GatewayError::Config(format!("Pool {} has no usable hosts", pool.name))
                    })?,
                };
                return Ipv4Net::new(gateway, net.prefix_len())
                    .map_err(|e| GatewayError::Config(format!("Invalid device address: {e}")));
            }
        }
        Err(GatewayError::Config(
            "No IPv4 pool to derive the device address from".to_string(),
        ))
    }

    /// UDP address for the datagram channel
    pub fn dtls_listen(&self) -> SocketAddr {
        self.dtls.listen.unwrap_or(self.server.listen)
    }
}

impl FromStr for Config {
    type Err = GatewayError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse TOML: {e}")))
    }
}

pub(crate) fn secs_or_none(secs: u32) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(u64::from(secs)))
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_handshake_timeout() -> u32 {
    10
}

fn default_attach_grace() -> u32 {
    15
}

fn default_device_name() -> String {
    "rvpngw0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

fn default_keepalive() -> u32 {
    20
}

fn default_dpd_interval() -> u32 {
    30
}

fn default_dpd_max_missed() -> u32 {
    3
}

fn default_idle_timeout() -> u32 {
    1800
}

fn default_rekey_interval() -> u32 {
    3600
}

fn default_supervisor_tick_ms() -> u64 {
    500
}

fn default_snapshot_interval() -> u32 {
    300
}

fn default_worker_queue() -> usize {
    1024
}

fn default_outbound_queue() -> usize {
    512
}

fn default_device_queue() -> usize {
    4096
}

fn default_drain_timeout_ms() -> u64 {
    500
}

fn default_shutdown_grace() -> u32 {
    10
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_audit_buffer() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
impl Config {
    /// Small configuration used by unit tests across the crate
    pub(crate) fn for_tests() -> Self {
        SAMPLE_CONFIG
            .parse()
            .expect("sample configuration must parse")
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[server]
listen = "127.0.0.1:8443"
hostname = "vpn.example.com"
max_sessions_per_user = 2

[tls]
cert_path = "/etc/rvpngw/cert.pem"
key_path = "/etc/rvpngw/key.pem"

[timers]
dpd_interval = 10
dpd_max_missed = 3
idle_timeout = 600
rekey_interval = 3600
supervisor_tick_ms = 100
snapshot_interval = 0

[router]
workers = 2
outbound_queue = 8

[[pools]]
name = "staff"
network = "10.8.0.0/24"
reservations = [{ user = "carol", address = "10.8.0.200" }]

[[pools]]
name = "tiny"
network = "10.9.0.0/30"

[[groups]]
name = "staff"
pool = "staff"
route_include = ["10.0.0.0/8", "192.168.50.0/24"]
dns = ["10.0.0.53"]

[[groups]]
name = "contractors"
pool = "tiny"
idle_timeout = 60
acl = [
  { action = "allow", network = "10.0.1.0/24", protocol = "tcp", ports = [443] },
  { action = "deny", network = "0.0.0.0/0" },
]
"#;
