//! Per-group virtual address pools
//!
//! Allocation is a test-and-set under the pool's own lock, so two
//! concurrent negotiations can never receive the same address. An address
//! returns to the pool only through [`AddressPool::release`] with the
//! owning session id, which the registry calls after the session has been
//! unlinked from the address index.

use crate::config::{Config, PoolConfig};
use crate::error::{GatewayError, Result};
use crate::session::SessionId;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Upper bound on host slots scanned in very large (IPv6) networks
const MAX_HOSTS: u128 = 1 << 20;

#[derive(Debug, Default)]
struct PoolState {
    leases: HashMap<IpAddr, SessionId>,
    /// Last address each user held, reused when still free. Kept as a
    /// bijection with `last_holder`, so neither outgrows the pool.
    last_by_user: HashMap<String, IpAddr>,
    last_holder: HashMap<IpAddr, String>,
    next_hint: u128,
}

impl PoolState {
    fn remember(&mut self, user: &str, addr: IpAddr) {
        if let Some(old) = self.last_by_user.insert(user.to_string(), addr) {
            if old != addr && self.last_holder.get(&old).is_some_and(|u| u == user) {
                self.last_holder.remove(&old);
            }
        }
        if let Some(previous) = self.last_holder.insert(addr, user.to_string()) {
            if previous != user {
                self.last_by_user.remove(&previous);
            }
        }
    }
}

/// Assignable addresses of one network
#[derive(Debug)]
pub struct AddressPool {
    name: String,
    network: IpNet,
    gateway: IpAddr,
    first_offset: u128,
    host_count: u128,
    reservations: HashMap<String, IpAddr>,
    reserved: HashSet<IpAddr>,
    /// Slots taken out of dynamic allocation (gateway and reservations)
    excluded: usize,
    state: Mutex<PoolState>,
}

impl AddressPool {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let network = config.network.trunc();
        let (first_offset, last_offset) = usable_range(&network);
        if last_offset < first_offset {
            return Err(GatewayError::Config(format!(
                "Pool {} has no usable addresses",
                config.name
            )));
        }
        let gateway = match config.gateway {
            Some(gw) => gw,
            None => address_at(&network, first_offset),
        };
        let host_count = (last_offset - first_offset + 1).min(MAX_HOSTS);

        let mut reservations = HashMap::new();
        let mut reserved = HashSet::new();
        for r in &config.reservations {
            if r.address == gateway {
                return Err(GatewayError::Config(format!(
                    "Reservation for {} collides with the gateway address {gateway}",
                    r.user
                )));
            }
            reservations.insert(r.user.clone(), r.address);
            reserved.insert(r.address);
        }

        let in_range = |addr: &IpAddr| {
            offset_of(&network, addr)
                .is_some_and(|o| o >= first_offset && o < first_offset + host_count)
        };
        let excluded =
            reserved.iter().filter(|a| in_range(*a)).count() + usize::from(in_range(&gateway));

        Ok(Self {
            name: config.name.clone(),
            network,
            gateway,
            first_offset,
            host_count,
            reservations,
            reserved,
            excluded,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> IpNet {
        self.network
    }

    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// Allocate an address for `user` owned by `owner`.
    ///
    /// A user with a static reservation always gets that address (or an
    /// error if it is held). Otherwise the user's previous address is
    /// preferred, then the next free slot after the last allocation.
    pub fn allocate(&self, user: &str, owner: SessionId) -> Result<IpAddr> {
        let mut state = self.state.lock();

        if let Some(&fixed) = self.reservations.get(user) {
            if state.leases.contains_key(&fixed) {
                return Err(GatewayError::AddressInUse(format!(
                    "reserved address {fixed} for {user} is held by another session"
                )));
            }
            state.leases.insert(fixed, owner);
            return Ok(fixed);
        }

        if let Some(&previous) = state.last_by_user.get(user) {
            if self.is_assignable(&state, previous) {
                state.leases.insert(previous, owner);
                return Ok(previous);
            }
        }

        for step in 0..self.host_count {
            let slot = (state.next_hint + step) % self.host_count;
            let candidate = address_at(&self.network, self.first_offset + slot);
            if self.is_assignable(&state, candidate) {
                state.leases.insert(candidate, owner);
                state.remember(user, candidate);
                state.next_hint = (slot + 1) % self.host_count;
                return Ok(candidate);
            }
        }

        Err(GatewayError::PoolExhausted(format!("pool {}", self.name)))
    }

    fn is_assignable(&self, state: &PoolState, addr: IpAddr) -> bool {
        addr != self.gateway
            && !self.reserved.contains(&addr)
            && !state.leases.contains_key(&addr)
    }

    /// Return `addr` to the pool if `owner` still holds it
    pub fn release(&self, addr: IpAddr, owner: SessionId) -> bool {
        let mut state = self.state.lock();
        match state.leases.get(&addr) {
            Some(holder) if *holder == owner => {
                state.leases.remove(&addr);
                true
            }
            _ => false,
        }
    }

    pub fn owner_of(&self, addr: IpAddr) -> Option<SessionId> {
        self.state.lock().leases.get(&addr).copied()
    }

    pub fn leased(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Dynamic slots (gateway and reservations excluded)
    pub fn capacity(&self) -> usize {
        usize::try_from(self.host_count)
            .unwrap_or(usize::MAX)
            .saturating_sub(self.excluded)
    }
}

fn usable_range(network: &IpNet) -> (u128, u128) {
    let host_bits = u32::from(network.max_prefix_len() - network.prefix_len());
    let size: u128 = if host_bits >= 128 {
        u128::MAX
    } else {
        1u128 << host_bits
    };
    match network {
        // Network and broadcast excluded except on point-to-point prefixes
        IpNet::V4(_) if size > 2 => (1, size - 2),
        IpNet::V4(_) => (0, size - 1),
        // Subnet-router anycast excluded
        IpNet::V6(_) if size > 1 => (1, size - 1),
        IpNet::V6(_) => (0, 0),
    }
}

fn address_at(network: &IpNet, offset: u128) -> IpAddr {
    match network {
        IpNet::V4(net) => {
            let base = u32::from(net.network());
            IpAddr::V4(Ipv4Addr::from(base.wrapping_add(offset as u32)))
        }
        IpNet::V6(net) => {
            let base = u128::from(net.network());
            IpAddr::V6(Ipv6Addr::from(base.wrapping_add(offset)))
        }
    }
}

fn offset_of(network: &IpNet, addr: &IpAddr) -> Option<u128> {
    match (network, addr) {
        (IpNet::V4(net), IpAddr::V4(a)) => {
            Some(u128::from(u32::from(*a).checked_sub(u32::from(net.network()))?))
        }
        (IpNet::V6(net), IpAddr::V6(a)) => u128::from(*a).checked_sub(u128::from(net.network())),
        _ => None,
    }
}

/// All pools by name
#[derive(Debug, Default)]
pub struct PoolSet {
    pools: HashMap<String, Arc<AddressPool>>,
}

impl PoolSet {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut pools = HashMap::new();
        for pool in &config.pools {
            let built = AddressPool::new(pool)?;
            log::info!(
                "Address pool {} {} ({} dynamic addresses)",
                pool.name,
                built.network(),
                built.capacity()
            );
            pools.insert(pool.name.clone(), Arc::new(built));
        }
        Ok(Self { pools })
    }

    pub fn get(&self, name: &str) -> Option<Arc<AddressPool>> {
        self.pools.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AddressPool>> {
        self.pools.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Reservation;
    use std::thread;

    fn pool(network: &str) -> AddressPool {
        AddressPool::new(&PoolConfig {
            name: "test".into(),
            network: network.parse().unwrap(),
            gateway: None,
            reservations: vec![],
        })
        .unwrap()
    }

    fn sid(n: u8) -> SessionId {
        SessionId::from_bytes([n; 32])
    }

    #[test]
    fn test_gateway_never_assigned() {
        // /30 has two hosts: .1 is the gateway, so one address is assignable
        let pool = pool("10.9.0.0/30");
        assert_eq!(pool.capacity(), 1);
        let addr = pool.allocate("a", sid(1)).unwrap();
        assert_eq!(addr, "10.9.0.2".parse::<IpAddr>().unwrap());
        assert!(matches!(
            pool.allocate("b", sid(2)),
            Err(GatewayError::PoolExhausted(_))
        ));
    }

    #[test]
    fn test_gateway_outside_host_range() {
        let pool = AddressPool::new(&PoolConfig {
            name: "pair".into(),
            network: "10.9.0.0/30".parse().unwrap(),
            gateway: Some("10.9.0.0".parse().unwrap()),
            reservations: vec![],
        })
        .unwrap();
        assert_eq!(pool.capacity(), 2);
        assert!(pool.allocate("a", sid(1)).is_ok());
        assert!(pool.allocate("b", sid(2)).is_ok());
        assert!(pool.allocate("c", sid(3)).is_err());
    }

    #[test]
    fn test_release_requires_owner() {
        let pool = pool("10.9.0.0/29");
        let addr = pool.allocate("a", sid(1)).unwrap();
        assert!(!pool.release(addr, sid(2)));
        assert_eq!(pool.owner_of(addr), Some(sid(1)));
        assert!(pool.release(addr, sid(1)));
        assert!(!pool.release(addr, sid(1)));
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn test_user_gets_previous_address_back() {
        let pool = pool("10.9.0.0/28");
        let first = pool.allocate("alice", sid(1)).unwrap();
        let _other = pool.allocate("bob", sid(2)).unwrap();
        pool.release(first, sid(1));
        assert_eq!(pool.allocate("alice", sid(3)).unwrap(), first);
    }

    #[test]
    fn test_previous_addresses_bounded_by_pool() {
        let pool = pool("10.9.0.0/29");
        let first = pool.allocate("alice", sid(0)).unwrap();
        pool.release(first, sid(0));

        for n in 1..=100u8 {
            let user = format!("user-{n}");
            let addr = pool.allocate(&user, sid(n)).unwrap();
            assert!(pool.release(addr, sid(n)));
        }
        let state = pool.state.lock();
        assert!(state.last_by_user.len() <= pool.capacity());
        assert_eq!(state.last_by_user.len(), state.last_holder.len());
        assert!(!state.last_by_user.contains_key("alice"));
        let last = state.last_by_user["user-100"];
        assert_eq!(state.last_holder[&last], "user-100");
    }

    #[test]
    fn test_second_session_moves_previous_address() {
        let pool = pool("10.9.0.0/29");
        let first = pool.allocate("alice", sid(1)).unwrap();
        let second = pool.allocate("alice", sid(2)).unwrap();
        assert_ne!(first, second);
        pool.release(first, sid(1));

        // Hand alice's first address to someone else
        for (n, user) in [(3, "dave"), (4, "erin"), (5, "frank")] {
            pool.allocate(user, sid(n)).unwrap();
        }
        assert_eq!(pool.allocate("carol", sid(6)).unwrap(), first);

        let state = pool.state.lock();
        assert_eq!(state.last_by_user.get("alice"), Some(&second));
        assert_eq!(state.last_by_user.get("carol"), Some(&first));
    }

    #[test]
    fn test_reservations() {
        let pool = AddressPool::new(&PoolConfig {
            name: "r".into(),
            network: "10.9.0.0/29".parse().unwrap(),
            gateway: None,
            reservations: vec![Reservation {
                user: "carol".into(),
                address: "10.9.0.2".parse().unwrap(),
            }],
        })
        .unwrap();
        // Dynamic users skip the reserved address
        assert_eq!(
            pool.allocate("dave", sid(1)).unwrap(),
            "10.9.0.3".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            pool.allocate("carol", sid(2)).unwrap(),
            "10.9.0.2".parse::<IpAddr>().unwrap()
        );
        assert!(matches!(
            pool.allocate("carol", sid(3)),
            Err(GatewayError::AddressInUse(_))
        ));
    }

    #[test]
    fn test_ipv6_pool() {
        let pool = pool("fd00::/120");
        let addr = pool.allocate("a", sid(1)).unwrap();
        assert_eq!(addr, "fd00::2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let pool = Arc::new(pool("10.9.0.0/24"));
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    (0..40u8)
                        .filter_map(|i| {
                            let owner = sid(t.wrapping_mul(40).wrapping_add(i));
                            pool.allocate(&format!("user-{t}-{i}"), owner).ok()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for addr in handle.join().unwrap() {
                assert!(seen.insert(addr), "address {addr} handed out twice");
            }
        }
        assert_eq!(seen.len(), pool.capacity());
    }
}
