//! Gateway - owns the session core and the data plane
//!
//! The [`Gateway`] ties the pieces together: it negotiates sessions on
//! incoming control streams, runs their tunnel tasks, and cleans up after
//! them. It also exposes the administrative surface (list, kick, reload,
//! shutdown).

use crate::audit::{spawn_batcher, AuditEvent, AuditHandle, AuditSink, AuditStats, LogAuditSink};
use crate::auth::{Authenticator, LocalAuthenticator, PolicyProvider, StaticPolicyProvider};
use crate::channel::{run_control_ingress, run_egress};
use crate::config::Config;
use crate::device::{DeviceReader, DeviceWriter};
use crate::error::{GatewayError, Result};
use crate::listener::{ControlListener, DatagramAttacher, DatagramListener};
use crate::negotiator::Negotiator;
use crate::pool::PoolSet;
use crate::protocol::{FrameReader, Rejection};
use crate::router::{FatalSignal, Router, RouterCounters};
use crate::session::{
    CloseReason, Session, SessionCommand, SessionId, SessionRegistry, SessionSnapshot,
    SessionState,
};
use crate::supervisor::Supervisor;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Extra time granted to a closing session's egress task beyond the drain
const EGRESS_GRACE: Duration = Duration::from_secs(5);

/// External collaborators the gateway depends on
#[derive(Clone)]
pub struct Collaborators {
    pub authenticator: Arc<dyn Authenticator>,
    pub policies: Arc<dyn PolicyProvider>,
    pub audit_sink: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// Users and groups from the config file, audit records to the log
    pub fn local(config: &Config) -> (Self, LocalHandles) {
        let users = Arc::new(LocalAuthenticator::from_config(config));
        let groups = Arc::new(StaticPolicyProvider::from_config(config));
        let collaborators = Self {
            authenticator: users.clone(),
            policies: groups.clone(),
            audit_sink: Arc::new(LogAuditSink),
        };
        (collaborators, LocalHandles { users, groups })
    }
}

/// Handles for reloading the config-backed collaborators
#[derive(Debug, Clone)]
pub struct LocalHandles {
    pub users: Arc<LocalAuthenticator>,
    pub groups: Arc<StaticPolicyProvider>,
}

impl LocalHandles {
    pub fn reload(&self, config: &Config) {
        self.users.reload(config);
        self.groups.reload(config);
    }
}

/// The running gateway
pub struct Gateway {
    config: RwLock<Arc<Config>>,
    registry: Arc<SessionRegistry>,
    pools: Arc<PoolSet>,
    negotiator: Negotiator,
    router: Arc<Router>,
    supervisor: Arc<Supervisor>,
    attacher: Arc<DatagramAttacher>,
    audit: AuditHandle,

    /// Stops listeners and the supervisor
    shutdown: CancellationToken,
    /// Stops the device tasks once sessions are gone
    data_plane: CancellationToken,
    /// Stops the audit batcher last
    audit_shutdown: CancellationToken,
    sessions: TaskTracker,
    background: Mutex<Vec<JoinHandle<()>>>,
    audit_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("sessions", &self.registry.len())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Validate `config` and start the data plane on the given device.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a pool cannot be built
    pub fn start(
        config: Config,
        collaborators: Collaborators,
        reader: Box<dyn DeviceReader>,
        writer: Box<dyn DeviceWriter>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let pools = Arc::new(PoolSet::from_config(&config)?);
        let registry = Arc::new(SessionRegistry::new());

        let audit_shutdown = CancellationToken::new();
        let (audit, audit_task) =
            spawn_batcher(&config.audit, collaborators.audit_sink, audit_shutdown.clone());

        let shutdown = CancellationToken::new();
        let data_plane = CancellationToken::new();
        let (router, device_rx) =
            Router::new(registry.clone(), audit.clone(), &config, FatalSignal::default());
        let mut background = router.spawn_device_tasks(
            reader,
            writer,
            device_rx,
            config.router.effective_workers(),
            config.router.worker_queue,
            data_plane.clone(),
        );

        let supervisor = Arc::new(Supervisor::new(registry.clone(), audit.clone(), &config));
        background.push(tokio::spawn(supervisor.clone().run(shutdown.clone())));

        let negotiator = Negotiator::new(
            collaborators.authenticator,
            collaborators.policies,
            pools.clone(),
            registry.clone(),
            &config,
        );
        let attacher = Arc::new(DatagramAttacher::new(registry.clone(), &config));

        log::info!(
            "Gateway {} started with {} pools and {} groups",
            config.server.hostname,
            config.pools.len(),
            config.groups.len()
        );
        Ok(Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            registry,
            pools,
            negotiator,
            router,
            supervisor,
            attacher,
            audit,
            shutdown,
            data_plane,
            audit_shutdown,
            sessions: TaskTracker::new(),
            background: Mutex::new(background),
            audit_task: Mutex::new(Some(audit_task)),
        }))
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn router_counters(&self) -> RouterCounters {
        self.router.stats.counters()
    }

    pub fn audit_stats(&self) -> &AuditStats {
        self.audit.stats()
    }

    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// First fatal data-plane error, shared with the device tasks
    pub fn fatal(&self) -> &FatalSignal {
        self.router.fatal()
    }

    pub fn attacher(&self) -> &Arc<DatagramAttacher> {
        &self.attacher
    }

    /// Negotiate a session on an established control stream and start its
    /// tunnel tasks.
    ///
    /// # Errors
    /// Returns the negotiation failure; the client has already been told
    pub async fn accept<S>(self: &Arc<Self>, mut stream: S, remote: SocketAddr) -> Result<SessionId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            let refusal = Rejection::Unavailable("gateway is shutting down".into());
            let _ = stream.write_all(refusal.render().as_bytes()).await;
            let _ = stream.shutdown().await;
            return Err(GatewayError::InvalidState("gateway is shutting down".into()));
        }

        let negotiated = self.negotiator.negotiate(&mut stream, remote).await?;
        let session = negotiated.session;
        self.audit.submit(AuditEvent::SessionStart {
            session_id: session.id(),
            username: session.username().to_string(),
            group: session.identity().group.clone(),
            addresses: session.addresses(),
            remote,
            hostname: session.hostname().map(str::to_string),
            at: SystemTime::now(),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FrameReader::with_buffer(read_half, negotiated.leftover);
        let id = session.id();
        self.sessions.spawn(self.clone().run_session(
            session,
            negotiated.commands,
            reader,
            write_half,
        ));
        Ok(id)
    }

    async fn run_session<R, W>(
        self: Arc<Self>,
        session: Arc<Session>,
        commands: mpsc::Receiver<SessionCommand>,
        reader: FrameReader<R>,
        writer: W,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ingress = tokio::spawn(run_control_ingress(
            self.router.clone(),
            session.clone(),
            reader,
        ));
        let mut egress = tokio::spawn(run_egress(
            self.router.clone(),
            session.clone(),
            writer,
            commands,
        ));

        session.cancel_token().cancelled().await;

        let allowance = self.router.settings().drain_timeout + EGRESS_GRACE;
        if tokio::time::timeout(allowance, &mut egress).await.is_err() {
            log::warn!("Egress of session {} did not finish, aborting", session.id());
            egress.abort();
        }
        ingress.abort();
        let _ = ingress.await;

        self.finish_session(&session);
    }

    /// Release everything a closed session held and record its end. Only the
    /// caller that takes the session out of the registry does the work.
    fn finish_session(&self, session: &Session) {
        if self.registry.remove(&session.id()).is_none() {
            return;
        }
        if let Some(channel) = session.detach_data_channel() {
            channel.close();
        }
        let _ = session.transition(SessionState::Closed);

        let reason = session
            .close_reason()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let counters = session.stats.counters();
        let duration = session.started_at().elapsed().unwrap_or_default();
        log::info!(
            "Session {} ({}) ended: {reason}, {} bytes in, {} bytes out",
            session.id(),
            session.username(),
            counters.bytes_in,
            counters.bytes_out
        );
        self.audit.submit(AuditEvent::SessionEnd {
            session_id: session.id(),
            username: session.username().to_string(),
            reason,
            counters,
            duration,
            at: SystemTime::now(),
        });
    }

    /// Bind the listeners and serve until shutdown or a fatal device error.
    ///
    /// # Errors
    /// Returns a bind failure, or the fatal data-plane error after the
    /// gateway has shut itself down
    pub async fn serve(self: &Arc<Self>, acceptor: TlsAcceptor) -> Result<()> {
        let config = self.config();
        let control = ControlListener::bind(
            config.server.listen,
            acceptor,
            Duration::from_secs(u64::from(config.server.handshake_timeout)),
        )
        .await?;

        if config.dtls.enabled {
            let datagrams = DatagramListener::bind(
                config.dtls_listen(),
                self.router.clone(),
                self.attacher.clone(),
            )
            .await?;
            self.background
                .lock()
                .push(tokio::spawn(datagrams.run(self.shutdown.clone())));
        }

        let gateway = self.clone();
        self.background.lock().push(tokio::spawn(control.run(
            self.shutdown.clone(),
            move |stream, peer| {
                let gateway = gateway.clone();
                async move {
                    if let Err(e) = gateway.accept(stream, peer).await {
                        log::debug!("Connection from {peer} ended during negotiation: {e}");
                    }
                }
            },
        )));

        let fatal = self.fatal().clone();
        tokio::select! {
            error = fatal.wait() => {
                let grace = Duration::from_secs(u64::from(config.router.shutdown_grace));
                self.shutdown(grace).await;
                Err(error)
            }
            _ = self.shutdown.cancelled() => Ok(()),
        }
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.registry.snapshots()
    }

    pub fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.registry.get(id).map(|s| s.snapshot())
    }

    /// Close one session
    ///
    /// # Errors
    /// Returns `NotFound` if no such session is live
    pub fn kick(&self, id: &SessionId) -> Result<()> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {id}")))?;
        if !session.begin_close(CloseReason::AdminKick) {
            return Err(GatewayError::NotFound(format!("session {id} is already closing")));
        }
        Ok(())
    }

    /// Close every session of `username`; returns how many were closed
    pub fn kick_user(&self, username: &str) -> usize {
        self.registry
            .sessions()
            .into_iter()
            .filter(|s| s.username() == username)
            .filter(|s| s.begin_close(CloseReason::AdminKick))
            .count()
    }

    /// Apply a new configuration.
    ///
    /// Timers, queue limits and negotiation settings apply to new sessions
    /// (and to the supervisor immediately). Address pools cannot change
    /// while sessions hold leases; a config with different pools is
    /// rejected.
    ///
    /// # Errors
    /// Returns an error if the new configuration is invalid
    pub fn reload(&self, config: Config) -> Result<()> {
        config.validate()?;
        let current = self.config();
        if current.pools != config.pools {
            return Err(GatewayError::Config(
                "address pools cannot be changed at runtime".into(),
            ));
        }
        if current.server.listen != config.server.listen
            || current.dtls_listen() != config.dtls_listen()
        {
            log::warn!("Listen address changes take effect after a restart");
        }
        self.negotiator.reload(&config);
        self.router.reload(&config);
        self.supervisor.reload(&config);
        self.attacher.reload(&config);
        *self.config.write() = Arc::new(config);
        log::info!("Configuration reloaded");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting, close every session, then stop the data plane and
    /// flush the audit log. Sessions still running after `grace` are
    /// cleaned up forcibly.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutdown.is_cancelled() && self.sessions.is_closed() {
            return;
        }
        log::info!("Shutting down, closing {} sessions", self.registry.len());
        self.shutdown.cancel();

        for session in self.registry.sessions() {
            session.begin_close(CloseReason::Shutdown);
        }
        self.sessions.close();
        if tokio::time::timeout(grace, self.sessions.wait()).await.is_err() {
            log::warn!("Sessions still open after {}s, forcing cleanup", grace.as_secs());
            for session in self.registry.sessions() {
                session.begin_close(CloseReason::Shutdown);
                self.finish_session(&session);
            }
        }

        self.data_plane.cancel();
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for task in &background {
            task.abort();
        }
        join_all(background).await;

        self.audit_shutdown.cancel();
        let audit_task = self.audit_task.lock().take();
        if let Some(task) = audit_task {
            if tokio::time::timeout(grace, task).await.is_err() {
                log::warn!("Audit batcher did not finish flushing");
            }
        }
        log::info!("Gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::tests::MemorySink;
    use crate::config::UserConfig;
    use crate::crypto::hash_password;
    use crate::device::{memory_device, MemoryDeviceHandle};
    use crate::protocol::ip::{build_ipv4, PROTO_UDP};
    use crate::protocol::packets::write_frame;
    use crate::protocol::{Frame, FrameType};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn start() -> (Arc<Gateway>, MemoryDeviceHandle, Arc<MemorySink>, LocalHandles) {
        let mut config = Config::for_tests();
        config.users.push(UserConfig {
            username: "alice".into(),
            password_hash: hash_password("secret", 1000).unwrap(),
            group: "staff".into(),
            disabled: false,
            expires_at: None,
        });
        let (mut collaborators, handles) = Collaborators::local(&config);
        let sink = Arc::new(MemorySink::default());
        collaborators.audit_sink = sink.clone();
        let (reader, writer, device) = memory_device(64);
        let gateway =
            Gateway::start(config, collaborators, Box::new(reader), Box::new(writer)).unwrap();
        (gateway, device, sink, handles)
    }

    async fn login(gateway: &Arc<Gateway>) -> (SessionId, DuplexStream) {
        login_with_buffer(gateway, 64 * 1024).await
    }

    async fn login_with_buffer(
        gateway: &Arc<Gateway>,
        buffer: usize,
    ) -> (SessionId, DuplexStream) {
        let (mut client, server) = tokio::io::duplex(buffer);
        let auth = STANDARD.encode("alice:secret");
        let head = format!(
            "CONNECT /CSCOSSLC/tunnel HTTP/1.1\r\nAuthorization: Basic {auth}\r\nX-CSTP-Version: 1\r\n\r\n"
        );
        client.write_all(head.as_bytes()).await.unwrap();
        let id = gateway
            .accept(server, "198.51.100.30:5555".parse().unwrap())
            .await
            .unwrap();
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            assert_eq!(client.read(&mut byte).await.unwrap(), 1);
            response.push(byte[0]);
        }
        assert!(response.starts_with(b"HTTP/1.1 200 CONNECTED"));
        (id, client)
    }

    async fn wait_gone(gateway: &Gateway, id: &SessionId) {
        for _ in 0..200 {
            if gateway.session(id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} still registered");
    }

    #[tokio::test]
    async fn test_kick_releases_address() {
        let (gateway, _device, sink, _handles) = start();
        let (id, _client) = login(&gateway).await;
        let address = gateway.session(&id).unwrap().addresses[0];

        gateway.kick(&id).unwrap();
        wait_gone(&gateway, &id).await;
        assert!(gateway.kick(&id).is_err());
        assert_eq!(gateway.pools().get("staff").unwrap().owner_of(address), None);

        gateway.shutdown(Duration::from_secs(1)).await;
        let kinds: Vec<_> = sink.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["session_start", "session_end"]);
    }

    #[tokio::test]
    async fn test_client_disconnect_cleans_up() {
        let (gateway, _device, _sink, _handles) = start();
        let (id, mut client) = login(&gateway).await;
        write_frame(&mut client, &Frame::control(FrameType::Disconnect))
            .await
            .unwrap();
        wait_gone(&gateway, &id).await;
        assert!(gateway.sessions().is_empty());
        gateway.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_refuses_new_ones() {
        let (gateway, _device, sink, _handles) = start();
        let (_first, mut client) = login(&gateway).await;
        gateway.shutdown(Duration::from_secs(2)).await;
        assert!(gateway.sessions().is_empty());

        // The client was told
        let mut reader = FrameReader::new(&mut client);
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Terminate);

        let (_c, server) = tokio::io::duplex(1024);
        let refused = gateway.accept(server, "198.51.100.31:1".parse().unwrap()).await;
        assert!(refused.is_err());

        let ends = sink
            .events()
            .into_iter()
            .filter(|e| {
                matches!(e, AuditEvent::SessionEnd { reason, .. } if reason == "gateway shutdown")
            })
            .count();
        assert_eq!(ends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_shutdown_ends_stuck_session_once() {
        let (gateway, device, sink, _handles) = start();
        // The client never reads, so egress blocks once the pipe is full
        let (id, _client) = login_with_buffer(&gateway, 2048).await;
        let IpAddr::V4(address) = gateway.session(&id).unwrap().addresses[0] else {
            panic!("staff pool is IPv4");
        };
        let server = Ipv4Addr::new(10, 0, 0, 5);
        for _ in 0..20 {
            let packet = build_ipv4(server, address, PROTO_UDP, 5353, &[7u8; 400]);
            device.inject.send(Bytes::from(packet)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        gateway.shutdown(Duration::from_millis(200)).await;
        assert!(gateway.sessions().is_empty());
        let allowance = gateway.router.settings().drain_timeout + EGRESS_GRACE;
        tokio::time::sleep(allowance + Duration::from_secs(1)).await;

        let ends = sink
            .events()
            .iter()
            .filter(|e| e.kind() == "session_end")
            .count();
        assert_eq!(ends, 1);
        assert_eq!(gateway.audit_stats().submit_dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_reload_rejects_pool_changes() {
        let (gateway, _device, _sink, handles) = start();
        let mut config = (*gateway.config()).clone();
        config.timers.dpd_interval = 45;
        gateway.reload(config.clone()).unwrap();
        handles.reload(&config);
        assert_eq!(gateway.config().timers.dpd_interval, 45);

        config.pools[0].network = "10.20.0.0/24".parse().unwrap();
        assert!(matches!(
            gateway.reload(config),
            Err(GatewayError::Config(_))
        ));
        gateway.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_device_loss_is_fatal() {
        let (gateway, device, _sink, _handles) = start();
        drop(device);
        let error = tokio::time::timeout(Duration::from_secs(1), gateway.fatal().wait())
            .await
            .unwrap();
        assert!(error.is_fatal());
        gateway.shutdown(Duration::from_secs(1)).await;
    }
}
