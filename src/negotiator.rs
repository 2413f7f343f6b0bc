//! Session negotiation over an established control stream
//!
//! Reads the tunnel request, authenticates the user, resolves the group
//! policy, leases addresses and registers the session. Any failure is
//! answered with a status line before the stream is closed, and leaves no
//! session, lease or registry entry behind.

use crate::auth::{AuthRejection, Authenticator, PolicyProvider};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::policy::GroupPolicy;
use crate::pool::PoolSet;
use crate::protocol::handshake::{read_request_head, HandshakeRequest};
use crate::protocol::{NegotiatedParams, Rejection};
use crate::session::{
    CloseReason, Lease, Session, SessionCommand, SessionId, SessionInit, SessionRegistry,
    SessionState,
};
use bytes::BytesMut;
use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Reloadable negotiation knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatorSettings {
    pub handshake_timeout: Duration,
    pub max_sessions_per_user: u32,
    pub outbound_capacity: usize,
    /// Datagram port offered to clients, if the datagram channel is enabled
    pub dtls_port: Option<u16>,
    pub keepalive: u32,
}

impl NegotiatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(u64::from(config.server.handshake_timeout)),
            max_sessions_per_user: config.server.max_sessions_per_user,
            outbound_capacity: config.router.outbound_queue,
            dtls_port: config.dtls.enabled.then(|| config.dtls_listen().port()),
            keepalive: config.timers.keepalive,
        }
    }
}

/// A freshly established session and what its tasks need
#[derive(Debug)]
pub struct Negotiated {
    pub session: Arc<Session>,
    pub commands: mpsc::Receiver<SessionCommand>,
    /// Bytes the client sent after the request head
    pub leftover: BytesMut,
}

/// Refusal sent to the client, paired with the error returned locally
type Refusal = (Rejection, GatewayError);

pub struct Negotiator {
    authenticator: Arc<dyn Authenticator>,
    policies: Arc<dyn PolicyProvider>,
    pools: Arc<PoolSet>,
    registry: Arc<SessionRegistry>,
    settings: RwLock<NegotiatorSettings>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("settings", &self.settings())
            .finish_non_exhaustive()
    }
}

impl Negotiator {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        policies: Arc<dyn PolicyProvider>,
        pools: Arc<PoolSet>,
        registry: Arc<SessionRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            authenticator,
            policies,
            pools,
            registry,
            settings: RwLock::new(NegotiatorSettings::from_config(config)),
        }
    }

    pub fn settings(&self) -> NegotiatorSettings {
        *self.settings.read()
    }

    pub fn reload(&self, config: &Config) {
        *self.settings.write() = NegotiatorSettings::from_config(config);
    }

    /// Run the handshake on `stream`.
    ///
    /// On success the session is registered and `Established`. A request
    /// that never completes within the handshake timeout is dropped without
    /// a response.
    pub async fn negotiate<S>(&self, stream: &mut S, remote: SocketAddr) -> Result<Negotiated>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let settings = self.settings();
        let (head, leftover) = read_request_head(stream, settings.handshake_timeout).await?;

        let (session, commands, params) = match self.admit(&head, remote, &settings).await {
            Ok(admitted) => admitted,
            Err((rejection, error)) => {
                log::info!(
                    "Rejected tunnel request from {remote}: {} {}",
                    rejection.status().0,
                    rejection.reason()
                );
                let _ = stream.write_all(rejection.render().as_bytes()).await;
                let _ = stream.shutdown().await;
                return Err(error);
            }
        };

        let sent = async {
            stream.write_all(params.render().as_bytes()).await?;
            stream.flush().await
        };
        if let Err(e) = sent.await {
            session.begin_close(CloseReason::SendFailure);
            self.registry.remove(&session.id());
            let _ = session.transition(SessionState::Closed);
            return Err(e.into());
        }
        // A shutdown may have closed the session while the reply was in flight
        if let Err(e) = session.transition(SessionState::Established) {
            self.registry.remove(&session.id());
            let _ = session.transition(SessionState::Closed);
            return Err(e);
        }
        log::info!(
            "Session {} established for {} ({:?}) from {remote}",
            session.id(),
            session.username(),
            session.addresses()
        );

        Ok(Negotiated {
            session,
            commands,
            leftover,
        })
    }

    async fn admit(
        &self,
        head: &str,
        remote: SocketAddr,
        settings: &NegotiatorSettings,
    ) -> std::result::Result<
        (Arc<Session>, mpsc::Receiver<SessionCommand>, NegotiatedParams),
        Refusal,
    > {
        let request = HandshakeRequest::parse(head)
            .map_err(|e| (Rejection::BadRequest(e.to_string()), e))?;

        let identity = self
            .authenticator
            .authenticate(&request.credential)
            .await
            .map_err(|rejection| {
                let error = GatewayError::Authentication(format!(
                    "{}: {rejection}",
                    request.credential.username()
                ));
                match rejection {
                    AuthRejection::Unavailable(_) => {
                        (Rejection::Unavailable(rejection.to_string()), error)
                    }
                    _ => (Rejection::Unauthorized(rejection.to_string()), error),
                }
            })?;

        let policy = self.policies.group_policy(&identity.group).await.ok_or_else(|| {
            let msg = format!("no policy for group {}", identity.group);
            (
                Rejection::Forbidden(msg.clone()),
                GatewayError::NotFound(msg),
            )
        })?;

        if settings.max_sessions_per_user > 0 {
            let live = self.registry.count_for_user(&identity.username);
            if live >= settings.max_sessions_per_user as usize {
                let msg = format!("{} already has {live} sessions", identity.username);
                return Err((
                    Rejection::Forbidden("too many sessions".into()),
                    GatewayError::SessionLimit(msg),
                ));
            }
        }

        let id = SessionId::generate()
            .map_err(|e| (Rejection::Unavailable("internal error".into()), e))?;
        let leases = self
            .lease_addresses(&policy, &request, &identity.username, id)
            .map_err(|e| (Rejection::Unavailable("no address available".into()), e))?;

        let mtu = request.negotiate_mtu(policy.mtu);
        let master_secret = request.master_secret.filter(|_| settings.dtls_port.is_some());
        let params = NegotiatedParams {
            session_id: id.to_hex(),
            address_v4: leases.iter().find_map(|l| match l.address {
                IpAddr::V4(addr) => Ipv4Net::new(addr, l.pool.prefix_len()).ok(),
                IpAddr::V6(_) => None,
            }),
            address_v6: leases.iter().find_map(|l| match l.address {
                IpAddr::V6(addr) => Ipv6Net::new(addr, l.pool.prefix_len()).ok(),
                IpAddr::V4(_) => None,
            }),
            dns: policy.dns.clone(),
            split_include: policy.route_include.clone(),
            split_exclude: policy.route_exclude.clone(),
            allow_lan: policy.allow_lan,
            mtu,
            keepalive: settings.keepalive,
            dpd: secs(Some(policy.timers.dpd_interval)),
            idle_timeout: secs(policy.timers.idle_timeout),
            rekey_interval: secs(policy.timers.rekey_interval),
            dtls_port: master_secret.and(settings.dtls_port),
        };

        let (session, commands) = Session::new(SessionInit {
            id,
            identity,
            policy,
            leases,
            mtu,
            hostname: request.hostname,
            remote,
            master_secret,
            outbound_capacity: settings.outbound_capacity,
        });
        if let Err(e) = self.registry.insert(session.clone()) {
            release_leases(session.leases(), id);
            return Err((Rejection::Unavailable("address conflict".into()), e));
        }
        Ok((session, commands, params))
    }

    /// Lease the group's IPv4 address, plus IPv6 when both sides want it
    fn lease_addresses(
        &self,
        policy: &GroupPolicy,
        request: &HandshakeRequest,
        username: &str,
        id: SessionId,
    ) -> Result<Vec<Lease>> {
        let mut leases = Vec::with_capacity(2);
        let mut wanted = vec![policy.pool.as_str()];
        if request.address_families.ipv6 {
            wanted.extend(policy.ipv6_pool.as_deref());
        }
        for name in wanted {
            let Some(pool) = self.pools.get(name) else {
                release_leases(&leases, id);
                return Err(GatewayError::Config(format!("unknown pool {name}")));
            };
            match pool.allocate(username, id) {
                Ok(address) => leases.push(Lease { pool, address }),
                Err(e) => {
                    release_leases(&leases, id);
                    return Err(e);
                }
            }
        }
        Ok(leases)
    }
}

fn release_leases(leases: &[Lease], owner: SessionId) {
    for lease in leases {
        lease.pool.release(lease.address, owner);
    }
}

fn secs(duration: Option<Duration>) -> u32 {
    duration
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
