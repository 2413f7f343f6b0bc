//! CSTP frame encoding for the control channel and attach messages for
//! the datagram channel

use crate::crypto::SECRET_LEN;
use crate::error::{GatewayError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic: `'S' 'T' 'F' 0x01`
pub const FRAME_MAGIC: [u8; 4] = [b'S', b'T', b'F', 0x01];
/// Fixed CSTP header length
pub const HEADER_LEN: usize = 8;
/// Largest payload a frame can carry
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Frame types shared by both channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x00,
    DpdRequest = 0x03,
    DpdResponse = 0x04,
    Disconnect = 0x05,
    Keepalive = 0x07,
    Compressed = 0x08,
    Terminate = 0x09,
    Rekey = 0x0A,
}

impl TryFrom<u8> for FrameType {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::DpdRequest),
            0x04 => Ok(FrameType::DpdResponse),
            0x05 => Ok(FrameType::Disconnect),
            0x07 => Ok(FrameType::Keepalive),
            0x08 => Ok(FrameType::Compressed),
            0x09 => Ok(FrameType::Terminate),
            0x0A => Ok(FrameType::Rekey),
            _ => Err(GatewayError::Protocol(format!(
                "Unknown frame type: {value:#x}"
            ))),
        }
    }
}

/// One control or data message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    pub fn data(packet: Bytes) -> Self {
        Self::new(FrameType::Data, packet)
    }

    pub fn control(frame_type: FrameType) -> Self {
        Self::new(frame_type, Bytes::new())
    }

    /// REKEY frame announcing the secret of a new cipher epoch
    pub fn rekey(epoch: u32, secret: &[u8; SECRET_LEN]) -> Self {
        let mut payload = BytesMut::with_capacity(4 + SECRET_LEN);
        payload.put_u32(epoch);
        payload.put_slice(secret);
        Self::new(FrameType::Rekey, payload.freeze())
    }

    /// Split a REKEY payload into epoch and secret
    pub fn rekey_material(&self) -> Result<(u32, [u8; SECRET_LEN])> {
        if self.frame_type != FrameType::Rekey || self.payload.len() != 4 + SECRET_LEN {
            return Err(GatewayError::Protocol("Malformed rekey frame".into()));
        }
        let mut payload = self.payload.clone();
        let epoch = payload.get_u32();
        let mut secret = [0u8; SECRET_LEN];
        payload.copy_to_slice(&mut secret);
        Ok((epoch, secret))
    }

    /// Encode with the 8-byte CSTP header
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let len = u16::try_from(self.payload.len()).map_err(|_| {
            GatewayError::Protocol(format!("Frame payload too large: {}", self.payload.len()))
        })?;
        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u16(len);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(0);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Take one complete frame off the front of `buf`, if present
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        if buf[..4] != FRAME_MAGIC {
            return Err(GatewayError::Protocol(format!(
                "Invalid frame magic: {:02x?}",
                &buf[..4]
            )));
        }
        let len = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let frame_type = FrameType::try_from(buf[6])?;
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Frame::new(frame_type, payload)))
    }
}

/// Reads CSTP frames off a byte stream
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_buffer(inner, BytesMut::with_capacity(4096))
    }

    /// Start from bytes already read past the handshake
    pub fn with_buffer(inner: R, buf: BytesMut) -> Self {
        Self { inner, buf }
    }

    /// Next frame, or `None` on a clean end of stream
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            if self.buf.capacity() - self.buf.len() < 2048 {
                self.buf.reserve(HEADER_LEN + MAX_PAYLOAD);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(GatewayError::Protocol(
                    "Stream closed inside a frame".into(),
                ));
            }
        }
    }
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// First byte of a datagram attach request
pub const ATTACH_REQUEST: u8 = 0x41;
/// First byte of the attach reply
pub const ATTACH_REPLY: u8 = 0x61;
/// Attach message length: marker, session id, proof
pub const ATTACH_LEN: usize = 1 + SECRET_LEN + 32;

/// Parsed datagram attach request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub session_id: [u8; SECRET_LEN],
    pub proof: [u8; 32],
}

impl AttachRequest {
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        if datagram.len() != ATTACH_LEN || datagram[0] != ATTACH_REQUEST {
            return Err(GatewayError::Protocol("Not an attach request".into()));
        }
        let mut session_id = [0u8; SECRET_LEN];
        session_id.copy_from_slice(&datagram[1..1 + SECRET_LEN]);
        let mut proof = [0u8; 32];
        proof.copy_from_slice(&datagram[1 + SECRET_LEN..]);
        Ok(Self { session_id, proof })
    }

    pub fn encode(&self) -> Bytes {
        attach_message(ATTACH_REQUEST, &self.session_id, &self.proof)
    }
}

/// Encode an attach reply
pub fn attach_reply(session_id: &[u8; SECRET_LEN], proof: &[u8; 32]) -> Bytes {
    attach_message(ATTACH_REPLY, session_id, proof)
}

fn attach_message(marker: u8, session_id: &[u8; SECRET_LEN], proof: &[u8; 32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ATTACH_LEN);
    buf.put_u8(marker);
    buf.put_slice(session_id);
    buf.put_slice(proof);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_layout() {
        let frame = Frame::data(Bytes::from_static(b"abc"));
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..], b"STF\x01\x00\x03\x00\x00abc");

        let dpd = Frame::control(FrameType::DpdRequest).encode().unwrap();
        assert_eq!(&dpd[..], b"STF\x01\x00\x00\x03\x00");
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let bytes = Frame::data(Bytes::from_static(b"hello")).encode().unwrap();
        let mut buf = BytesMut::from(&bytes[..6]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[6..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_type() {
        let mut buf = BytesMut::from(&b"XTF\x01\x00\x00\x00\x00"[..]);
        assert!(Frame::decode(&mut buf).is_err());
        let mut buf = BytesMut::from(&b"STF\x01\x00\x00\x42\x00"[..]);
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::data(Bytes::from(vec![0u8; MAX_PAYLOAD + 1]));
        assert!(frame.encode().is_err());
    }

    #[test]
    fn test_rekey_material() {
        let frame = Frame::rekey(7, &[0xAB; 32]);
        let (epoch, secret) = frame.rekey_material().unwrap();
        assert_eq!(epoch, 7);
        assert_eq!(secret, [0xAB; 32]);
        assert!(Frame::data(Bytes::new()).rekey_material().is_err());
    }

    #[test]
    fn test_attach_parse() {
        let req = AttachRequest {
            session_id: [1; 32],
            proof: [2; 32],
        };
        let parsed = AttachRequest::parse(&req.encode()).unwrap();
        assert_eq!(parsed, req);
        assert!(AttachRequest::parse(&[ATTACH_REQUEST; 10]).is_err());
        assert_eq!(attach_reply(&[1; 32], &[3; 32])[0], ATTACH_REPLY);
    }

    #[tokio::test]
    async fn test_frame_reader_over_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        tokio::spawn(async move {
            write_frame(&mut client, &Frame::data(Bytes::from_static(b"one")))
                .await
                .unwrap();
            write_frame(&mut client, &Frame::control(FrameType::Keepalive))
                .await
                .unwrap();
        });

        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Keepalive);
        assert!(reader.next_frame().await.unwrap().is_none());
    }
}
