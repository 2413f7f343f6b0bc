//! Group policy: routes, DNS, timers and the split-tunnel ACL

use crate::config::{secs_or_none, Config, GroupConfig, TimerConfig};
use crate::protocol::ip::{PacketInfo, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP, PROTO_UDP};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AclProtocol {
    #[default]
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl AclProtocol {
    fn matches(&self, protocol: u8) -> bool {
        match self {
            AclProtocol::Any => true,
            AclProtocol::Tcp => protocol == PROTO_TCP,
            AclProtocol::Udp => protocol == PROTO_UDP,
            AclProtocol::Icmp => protocol == PROTO_ICMP || protocol == PROTO_ICMPV6,
        }
    }
}

/// One split-tunnel ACL rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub action: AclAction,
    pub network: IpNet,
    #[serde(default)]
    pub protocol: AclProtocol,
    /// Destination ports (empty = any)
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl AclRule {
    pub fn matches(&self, info: &PacketInfo) -> bool {
        if !self.network.contains(&info.dst) || !self.protocol.matches(info.protocol) {
            return false;
        }
        if self.ports.is_empty() {
            return true;
        }
        info.dst_port.is_some_and(|port| self.ports.contains(&port))
    }
}

/// Evaluate an ACL: an empty list allows everything, otherwise the first
/// matching rule decides and unmatched traffic is denied.
pub fn acl_permits(rules: &[AclRule], info: &PacketInfo) -> bool {
    if rules.is_empty() {
        return true;
    }
    rules
        .iter()
        .find(|rule| rule.matches(info))
        .is_some_and(|rule| rule.action == AclAction::Allow)
}

/// Liveness and rekey timers resolved for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimers {
    pub keepalive: Duration,
    pub dpd_interval: Duration,
    pub dpd_max_missed: u32,
    pub idle_timeout: Option<Duration>,
    pub rekey_interval: Option<Duration>,
}

impl SessionTimers {
    pub fn from_config(timers: &TimerConfig) -> Self {
        Self {
            keepalive: Duration::from_secs(u64::from(timers.keepalive)),
            dpd_interval: Duration::from_secs(u64::from(timers.dpd_interval)),
            dpd_max_missed: timers.dpd_max_missed,
            idle_timeout: secs_or_none(timers.idle_timeout),
            rekey_interval: secs_or_none(timers.rekey_interval),
        }
    }
}

/// Everything a group grants its members
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPolicy {
    pub name: String,
    pub pool: String,
    pub ipv6_pool: Option<String>,
    pub route_include: Vec<IpNet>,
    pub route_exclude: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub allow_lan: bool,
    pub acl: Vec<AclRule>,
    pub mtu: u16,
    pub timers: SessionTimers,
}

impl GroupPolicy {
    /// Resolve a group against the gateway-wide defaults
    pub fn from_config(group: &GroupConfig, config: &Config) -> Self {
        let mut timers = SessionTimers::from_config(&config.timers);
        if let Some(idle) = group.idle_timeout {
            timers.idle_timeout = secs_or_none(idle);
        }
        if let Some(rekey) = group.rekey_interval {
            timers.rekey_interval = secs_or_none(rekey);
        }
        if let Some(dpd) = group.dpd_interval.filter(|d| *d > 0) {
            timers.dpd_interval = Duration::from_secs(u64::from(dpd));
        }
        Self {
            name: group.name.clone(),
            pool: group.pool.clone(),
            ipv6_pool: group.ipv6_pool.clone(),
            route_include: group.route_include.clone(),
            route_exclude: group.route_exclude.clone(),
            dns: group.dns.clone(),
            allow_lan: group.allow_lan,
            acl: group.acl.clone(),
            mtu: group.mtu.unwrap_or(config.device.mtu).min(config.device.mtu),
            timers,
        }
    }
}
