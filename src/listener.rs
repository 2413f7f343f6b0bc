//! Network listeners
//!
//! [`ControlListener`] accepts TCP connections and runs the TLS handshake
//! for each on its own task. [`DatagramListener`] owns the shared UDP
//! socket: datagrams from known peers are handed to that session's data
//! ingress task, anything else is treated as an attach request.

use crate::channel::run_data_ingress;
use crate::config::Config;
use crate::crypto::{attached_proof, verify_attach_proof, SECRET_LEN};
use crate::datagram::{DataChannel, DatagramTransport, UdpPeer};
use crate::error::{GatewayError, Result};
use crate::protocol::packets::{attach_reply, AttachRequest};
use crate::router::Router;
use crate::session::{Session, SessionId, SessionRegistry, SessionState};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Datagrams buffered per peer before new ones are dropped
const PEER_QUEUE: usize = 256;
/// Largest datagram read off the socket
const MAX_DATAGRAM: usize = 65_535;

pub struct ControlListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl ControlListener {
    pub async fn bind(
        addr: SocketAddr,
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Control channel listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            acceptor,
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown`, calling `handler` for each TLS stream.
    ///
    /// A failed or slow TLS handshake only affects its own connection.
    pub async fn run<F, Fut>(self, shutdown: CancellationToken, handler: F)
    where
        F: Fn(TlsStream<TcpStream>, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let (tcp, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                },
            };
            let acceptor = self.acceptor.clone();
            let handler = handler.clone();
            let timeout = self.handshake_timeout;
            tokio::spawn(async move {
                let _ = tcp.set_nodelay(true);
                match tokio::time::timeout(timeout, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => handler(stream, peer).await,
                    Ok(Err(e)) => log::warn!("TLS handshake with {peer} failed: {e}"),
                    Err(_) => log::warn!("TLS handshake with {peer} timed out"),
                }
            });
        }
        log::info!("Control listener stopped");
    }
}

/// Validates attach requests and binds data channels to sessions
#[derive(Debug)]
pub struct DatagramAttacher {
    registry: Arc<SessionRegistry>,
    grace: RwLock<Duration>,
}

impl DatagramAttacher {
    pub fn new(registry: Arc<SessionRegistry>, config: &Config) -> Self {
        Self {
            registry,
            grace: RwLock::new(Self::grace_from(config)),
        }
    }

    fn grace_from(config: &Config) -> Duration {
        Duration::from_secs(u64::from(config.dtls.attach_grace))
    }

    pub fn reload(&self, config: &Config) {
        *self.grace.write() = Self::grace_from(config);
    }

    /// Check an attach request against the session it names
    pub fn verify(&self, datagram: &[u8]) -> Result<(Arc<Session>, [u8; SECRET_LEN])> {
        let request = AttachRequest::parse(datagram)?;
        let id = SessionId::from_bytes(request.session_id);
        let session = self
            .registry
            .get(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {id}")))?;
        if session.state() != SessionState::Established || session.epoch() != 1 {
            return Err(GatewayError::InvalidState(format!(
                "session {id} cannot attach in {} (epoch {})",
                session.state(),
                session.epoch()
            )));
        }
        let master = *session.master_secret().ok_or_else(|| {
            GatewayError::Handshake(format!("session {id} did not request a datagram channel"))
        })?;
        if attach_window_left(&session, *self.grace.read()).is_none() {
            return Err(GatewayError::Handshake(format!(
                "attach window of session {id} has passed"
            )));
        }
        if session.data_channel().is_some() {
            return Err(GatewayError::InvalidState(format!(
                "session {id} already has a data channel"
            )));
        }
        if !verify_attach_proof(&master, &request.session_id, &request.proof) {
            return Err(GatewayError::Handshake(format!("bad attach proof for session {id}")));
        }
        Ok((session, master))
    }

    /// Verify, bind a data channel over `transport` and confirm to the peer
    pub async fn attach(
        &self,
        datagram: &[u8],
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<(Arc<Session>, Arc<DataChannel>)> {
        let (session, master) = self.verify(datagram)?;
        let sid = *session.id().as_bytes();
        let channel = Arc::new(DataChannel::new(sid, &master, session.epoch(), transport.clone())?);
        session.attach_data_channel(channel.clone())?;

        if let Err(e) = transport.send(attach_reply(&sid, &attached_proof(&master, &sid))).await {
            session.detach_data_channel();
            channel.close();
            return Err(e);
        }
        log::info!(
            "Session {} attached data channel from {}",
            session.id(),
            channel.peer()
        );
        Ok((session, channel))
    }
}

/// Datagram listener counters
#[derive(Debug, Default)]
pub struct DatagramStats {
    pub attached: AtomicU64,
    pub rejected: AtomicU64,
    /// Peer queue full
    pub dropped: AtomicU64,
}

pub struct DatagramListener {
    socket: Arc<UdpSocket>,
    router: Arc<Router>,
    attacher: Arc<DatagramAttacher>,
    peers: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    pub stats: Arc<DatagramStats>,
}

impl DatagramListener {
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        attacher: Arc<DatagramAttacher>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        log::info!("Datagram channel listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            router,
            attacher,
            peers: Arc::new(DashMap::new()),
            stats: Arc::new(DatagramStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        log::debug!("Datagram receive failed: {e}");
                        continue;
                    }
                },
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);

            let known = self.peers.get(&peer).map(|tx| tx.value().clone());
            if let Some(tx) = known {
                match tx.try_send(datagram) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Closed(_)) => {
                        self.peers.remove(&peer);
                    }
                }
                continue;
            }
            self.try_attach(peer, &datagram).await;
        }
        log::info!("Datagram listener stopped");
    }

    async fn try_attach(&self, peer: SocketAddr, datagram: &[u8]) {
        let transport = Arc::new(UdpPeer::new(self.socket.clone(), peer));
        let (session, channel) = match self.attacher.attach(datagram, transport).await {
            Ok(attached) => attached,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Ignoring datagram from {peer}: {e}");
                return;
            }
        };
        self.stats.attached.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        self.peers.insert(peer, tx);
        let peers = self.peers.clone();
        let router = self.router.clone();
        tokio::spawn(async move {
            run_data_ingress(router, session, channel, rx).await;
            peers.remove(&peer);
        });
    }
}

/// Time left to attach a data channel after establishment
fn attach_window_left(session: &Session, grace: Duration) -> Option<Duration> {
    let established = session.established_at()?;
    grace.checked_sub(Instant::now().saturating_duration_since(established))
}
