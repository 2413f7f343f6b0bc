//! Concurrent index of live sessions by id and by virtual address

use super::{Session, SessionId, SessionSnapshot};
use crate::error::{GatewayError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Sharded session index.
///
/// An address maps to at most one session. Removal unlinks the address
/// index before the pool lease is released, so a lookup never observes an
/// address that has already been handed to somebody else.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_id: DashMap<SessionId, Arc<Session>>,
    by_addr: DashMap<IpAddr, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a session under its id and every leased address.
    ///
    /// Fails without side effects if any address is already bound.
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        let mut bound: Vec<IpAddr> = Vec::with_capacity(session.leases().len());
        for lease in session.leases() {
            match self.by_addr.entry(lease.address) {
                Entry::Occupied(existing) => {
                    let holder = existing.get().id();
                    drop(existing);
                    for addr in &bound {
                        self.by_addr.remove(addr);
                    }
                    return Err(GatewayError::AddressInUse(format!(
                        "{} is bound to session {holder}",
                        lease.address
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(session.clone());
                    bound.push(lease.address);
                }
            }
        }
        self.by_id.insert(session.id(), session);
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.by_id.get(id).map(|s| s.value().clone())
    }

    /// Hot-path lookup used by the router workers
    pub fn lookup_addr(&self, addr: &IpAddr) -> Option<Arc<Session>> {
        self.by_addr.get(addr).map(|s| s.value().clone())
    }

    /// Unlink a session and release its addresses. Idempotent.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.by_id.remove(id)?;
        for lease in session.leases() {
            self.by_addr
                .remove_if(&lease.address, |_, bound| bound.id() == *id);
        }
        for lease in session.leases() {
            if !lease.pool.release(lease.address, *id) {
                log::warn!(
                    "Address {} of session {id} was not held in pool {}",
                    lease.address,
                    lease.pool.name()
                );
            }
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Live sessions belonging to `username`
    pub fn count_for_user(&self, username: &str) -> usize {
        self.by_id
            .iter()
            .filter(|s| s.username() == username && s.state().is_live())
            .count()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.by_id.iter().map(|s| s.value().clone()).collect()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.by_id.iter().map(|s| s.snapshot()).collect()
    }
}
