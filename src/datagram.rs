//! Datagram (data) channel: sealed packets over an unreliable transport

use crate::crypto::{peek_epoch, EpochCipher, SECRET_LEN};
use crate::error::{GatewayError, Result};
use crate::protocol::FrameType;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Outbound half of a datagram transport
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send(&self, datagram: Bytes) -> Result<()>;

    fn peer(&self) -> SocketAddr;
}

/// One client peer on the gateway's shared UDP socket
#[derive(Debug)]
pub struct UdpPeer {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpPeer {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

#[async_trait]
impl DatagramTransport for UdpPeer {
    async fn send(&self, datagram: Bytes) -> Result<()> {
        self.socket.send_to(&datagram, self.peer).await?;
        Ok(())
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

struct Ciphers {
    current: EpochCipher,
    previous: Option<EpochCipher>,
}

/// Attached datagram channel of a session.
///
/// Sends always use the current epoch; receives accept the current and the
/// immediately preceding epoch so datagrams in flight across a rekey are
/// not lost.
pub struct DataChannel {
    session_id: [u8; SECRET_LEN],
    transport: Arc<dyn DatagramTransport>,
    ciphers: RwLock<Ciphers>,
    healthy: AtomicBool,
    closed: CancellationToken,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("peer", &self.transport.peer())
            .field("epoch", &self.epoch())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl DataChannel {
    /// Create a channel keyed for `epoch` from `secret`
    pub fn new(
        session_id: [u8; SECRET_LEN],
        secret: &[u8; SECRET_LEN],
        epoch: u32,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Self> {
        let current = EpochCipher::derive(&session_id, secret, epoch)?;
        Ok(Self {
            session_id,
            transport,
            ciphers: RwLock::new(Ciphers {
                current,
                previous: None,
            }),
            healthy: AtomicBool::new(true),
            closed: CancellationToken::new(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.transport.peer()
    }

    pub fn epoch(&self) -> u32 {
        self.ciphers.read().current.epoch()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    /// Stop the channel; its ingress task exits and the peer is forgotten
    pub fn close(&self) {
        self.mark_unhealthy();
        self.closed.cancel();
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Seal and send one message
    pub async fn send(&self, kind: FrameType, payload: &[u8]) -> Result<()> {
        let sealed = self.ciphers.read().current.seal(kind as u8, payload)?;
        self.transport.send(sealed).await
    }

    /// Open a received datagram under the current or previous epoch
    pub fn open(&self, datagram: &[u8]) -> Result<(FrameType, Bytes)> {
        let epoch = peek_epoch(datagram)
            .ok_or_else(|| GatewayError::Protocol("Datagram too short".into()))?;
        let ciphers = self.ciphers.read();
        let cipher = if epoch == ciphers.current.epoch() {
            &ciphers.current
        } else {
            ciphers
                .previous
                .as_ref()
                .filter(|c| c.epoch() == epoch)
                .ok_or_else(|| {
                    GatewayError::Crypto(format!("Datagram for unknown epoch {epoch}"))
                })?
        };
        let (kind, payload) = cipher.open(datagram)?;
        Ok((FrameType::try_from(kind)?, payload))
    }

    /// Switch to a new epoch.
    ///
    /// A REKEY notice naming the new epoch is sealed under the old key and
    /// sent first; if that send fails the channel is left untouched and the
    /// error returned, so the caller can fall back to control-only.
    pub async fn rekey(&self, epoch: u32, secret: &[u8; SECRET_LEN]) -> Result<()> {
        let next = EpochCipher::derive(&self.session_id, secret, epoch)?;
        self.send(FrameType::Rekey, &epoch.to_be_bytes()).await?;
        let mut ciphers = self.ciphers.write();
        let old = std::mem::replace(&mut ciphers.current, next);
        ciphers.previous = Some(old);
        Ok(())
    }
}
