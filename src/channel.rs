//! Per-session tunnel tasks
//!
//! Every established session runs a control ingress task reading CSTP
//! frames, an egress task that owns the control writer, and, once a
//! datagram channel is attached, a data ingress task. All of them stop
//! when the session's cancellation token fires.

use crate::crypto::{random_array, SECRET_LEN};
use crate::datagram::DataChannel;
use crate::error::{GatewayError, Result};
use crate::protocol::{Frame, FrameReader, FrameType};
use crate::protocol::packets::write_frame;
use crate::router::Router;
use crate::session::{CloseReason, Session, SessionCommand, SessionState};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Bound on the goodbye frame and stream shutdown
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(2);

/// Channel a frame arrived on
enum Origin {
    Control,
    Data(Arc<DataChannel>),
}

/// Read frames from the control channel until it ends or the session closes
pub async fn run_control_ingress<R>(
    router: Arc<Router>,
    session: Arc<Session>,
    mut reader: FrameReader<R>,
) where
    R: AsyncRead + Unpin + Send,
{
    let cancel = session.cancel_token().clone();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = reader.next_frame() => frame,
        };
        let outcome = match frame {
            Ok(Some(frame)) => {
                handle_frame(&router, &session, frame.frame_type, frame.payload, &Origin::Control)
                    .await
            }
            Ok(None) => Err(CloseReason::ClientDisconnect),
            Err(GatewayError::Io(e)) => {
                log::debug!("Control read for session {} failed: {e}", session.id());
                Err(CloseReason::ClientDisconnect)
            }
            Err(e) => Err(CloseReason::ProtocolError(e.to_string())),
        };
        if let Err(reason) = outcome {
            session.begin_close(reason);
            return;
        }
    }
}

/// Open and dispatch datagrams demultiplexed to this session
pub async fn run_data_ingress(
    router: Arc<Router>,
    session: Arc<Session>,
    channel: Arc<DataChannel>,
    mut datagrams: mpsc::Receiver<Bytes>,
) {
    let cancel = session.cancel_token().clone();
    let closed = channel.closed().clone();
    let origin = Origin::Data(channel.clone());
    loop {
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = closed.cancelled() => break,
            datagram = datagrams.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };
        let (kind, payload) = match channel.open(&datagram) {
            Ok(opened) => opened,
            Err(e) => {
                log::trace!("Dropping datagram for session {}: {e}", session.id());
                continue;
            }
        };
        if let Err(reason) = handle_frame(&router, &session, kind, payload, &origin).await {
            session.begin_close(reason);
            break;
        }
    }
    log::debug!("Data channel of session {} stopped", session.id());
}

async fn handle_frame(
    router: &Router,
    session: &Session,
    kind: FrameType,
    payload: Bytes,
    origin: &Origin,
) -> std::result::Result<(), CloseReason> {
    match kind {
        FrameType::Data => {
            session.touch(true);
            if router.deliver_inbound(session, payload).await.is_err() {
                return Err(CloseReason::Shutdown);
            }
        }
        FrameType::DpdRequest => {
            session.touch(false);
            match origin {
                Origin::Control => {
                    if !session.post(SessionCommand::Control(FrameType::DpdResponse)) {
                        log::debug!("Command queue of session {} full", session.id());
                    }
                }
                Origin::Data(channel) => {
                    if channel.send(FrameType::DpdResponse, &[]).await.is_err() {
                        channel.mark_unhealthy();
                    }
                }
            }
        }
        FrameType::DpdResponse | FrameType::Keepalive => session.touch(false),
        FrameType::Disconnect | FrameType::Terminate => {
            return Err(CloseReason::ClientDisconnect);
        }
        FrameType::Compressed => {
            return Err(CloseReason::ProtocolError(
                "compressed frames are not supported".into(),
            ));
        }
        FrameType::Rekey => match origin {
            // Client acknowledgement of the new epoch
            Origin::Data(_) => session.touch(false),
            Origin::Control => {
                return Err(CloseReason::ProtocolError(
                    "unexpected REKEY from client".into(),
                ));
            }
        },
    }
    Ok(())
}

/// Own the control writer: forward queued packets and commands, then say
/// goodbye once the session starts closing
pub async fn run_egress<W>(
    router: Arc<Router>,
    session: Arc<Session>,
    mut writer: W,
    mut commands: mpsc::Receiver<SessionCommand>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let cancel = session.cancel_token().clone();
    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(command) = commands.recv() => run_command(&session, &mut writer, command).await,
            packet = session.outbound().next() => send_packet(&session, &mut writer, packet).await,
        };
        if let Err(e) = step {
            log::debug!("Control write for session {} failed: {e}", session.id());
            session.begin_close(CloseReason::SendFailure);
            break;
        }
    }
    finish(&router, &session, &mut writer).await;
}

async fn run_command<W>(session: &Session, writer: &mut W, command: SessionCommand) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    match command {
        SessionCommand::Control(frame_type) => {
            write_frame(writer, &Frame::control(frame_type)).await
        }
        SessionCommand::Rekey => rekey(session, writer).await,
    }
}

/// Send one packet, preferring a healthy data channel
async fn send_packet<W>(session: &Session, writer: &mut W, packet: Bytes) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let len = packet.len();
    if let Some(channel) = session.data_channel().filter(|c| c.is_healthy()) {
        match channel.send(FrameType::Data, &packet).await {
            Ok(()) => {
                session.stats.record_out(len);
                return Ok(());
            }
            Err(e) => {
                log::warn!(
                    "Data channel of session {} failed ({e}), continuing on control channel",
                    session.id()
                );
                drop_data_channel(session);
            }
        }
    }
    write_frame(writer, &Frame::data(packet)).await?;
    session.stats.record_out(len);
    Ok(())
}

/// Move both channels to a fresh epoch.
///
/// The control channel carries the new secret. A data channel that cannot
/// take the notice is detached and the session carries on control-only.
async fn rekey<W>(session: &Session, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if session.transition(SessionState::Rekeying).is_err() {
        return Ok(());
    }
    let epoch = session.epoch() + 1;
    let secret: [u8; SECRET_LEN] = random_array()?;
    write_frame(writer, &Frame::rekey(epoch, &secret)).await?;

    if let Some(channel) = session.data_channel() {
        if let Err(e) = channel.rekey(epoch, &secret).await {
            log::warn!(
                "Rekey of data channel for session {} failed ({e}), continuing control-only",
                session.id()
            );
            drop_data_channel(session);
        }
    }
    session.bump_epoch();
    // A close may have started while the frame was in flight
    let _ = session.transition(SessionState::Established);
    session.rekey_finished();
    log::info!("Session {} moved to epoch {epoch}", session.id());
    Ok(())
}

fn drop_data_channel(session: &Session) {
    if let Some(channel) = session.detach_data_channel() {
        channel.close();
    }
}

async fn finish<W>(router: &Router, session: &Session, writer: &mut W)
where
    W: AsyncWrite + Unpin + Send,
{
    let settings = router.settings();
    let reachable = !matches!(
        session.close_reason(),
        Some(CloseReason::ClientDisconnect | CloseReason::SendFailure)
    );

    if reachable && settings.drain_on_close {
        let drain = async {
            while let Some(packet) = session.outbound().pop() {
                if send_packet(session, writer, packet).await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(settings.drain_timeout, drain).await.is_err() {
            log::debug!("Drain of session {} timed out", session.id());
        }
    }
    let dropped = session.outbound().clear();
    if dropped > 0 {
        log::debug!("Discarded {dropped} queued packets of session {}", session.id());
    }

    drop_data_channel(session);
    if reachable {
        let terminate = Frame::control(FrameType::Terminate);
        let goodbye = write_frame(writer, &terminate);
        let _ = tokio::time::timeout(GOODBYE_TIMEOUT, goodbye).await;
    }
    let _ = tokio::time::timeout(GOODBYE_TIMEOUT, writer.shutdown()).await;
}
