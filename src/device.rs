//! Virtual interface adapter
//!
//! The router only needs packet-in / packet-out. [`open_tun`] provides the
//! production device on top of the `tun` crate; [`memory_device`] is an
//! in-process device for embedding and tests. For TAP and MAC-VLAN-tap
//! modes the [`ethernet`] helpers add and strip Ethernet II headers and
//! build ARP replies.

use crate::config::DeviceConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use ipnet::Ipv4Net;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// Source of frames read from the device
#[async_trait]
pub trait DeviceReader: Send {
    async fn read_packet(&mut self) -> Result<Bytes>;
}

/// Sink for frames written to the device
#[async_trait]
pub trait DeviceWriter: Send {
    async fn write_packet(&mut self, packet: &[u8]) -> Result<()>;
}

pub struct TunReader {
    inner: ReadHalf<tun::AsyncDevice>,
    buf: Vec<u8>,
}

#[async_trait]
impl DeviceReader for TunReader {
    async fn read_packet(&mut self) -> Result<Bytes> {
        let n = self
            .inner
            .read(&mut self.buf)
            .await
            .map_err(|e| GatewayError::DeviceIo(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(GatewayError::DeviceIo("device closed".into()));
        }
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }
}

pub struct TunWriter {
    inner: WriteHalf<tun::AsyncDevice>,
}

#[async_trait]
impl DeviceWriter for TunWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.inner
            .write_all(packet)
            .await
            .map_err(|e| GatewayError::DeviceIo(format!("write failed: {e}")))
    }
}

/// Create and bring up the shared device
pub fn open_tun(
    config: &DeviceConfig,
    address: Ipv4Net,
) -> Result<(Box<dyn DeviceReader>, Box<dyn DeviceWriter>)> {
    let mut tun_config = tun::Configuration::default();
    tun_config
        .name(&config.name)
        .address(address.addr())
        .netmask(address.netmask())
        .mtu(i32::from(config.mtu))
        .layer(if config.mode.is_ethernet() {
            tun::Layer::L2
        } else {
            tun::Layer::L3
        })
        .up();

    #[cfg(target_os = "linux")]
    tun_config.platform(|platform| {
        platform.packet_information(false);
    });

    let device = tun::create_as_async(&tun_config)
        .map_err(|e| GatewayError::DeviceIo(format!("failed to create {}: {e}", config.name)))?;
    log::info!(
        "Created {:?} device {} with address {address} (mtu {})",
        config.mode,
        config.name,
        config.mtu
    );

    let (reader, writer) = tokio::io::split(device);
    let frame_max = usize::from(config.mtu) + ethernet::HEADER_LEN + 4;
    Ok((
        Box::new(TunReader {
            inner: reader,
            buf: vec![0u8; frame_max],
        }),
        Box::new(TunWriter { inner: writer }),
    ))
}

/// In-memory device reader
pub struct MemoryReader {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl DeviceReader for MemoryReader {
    async fn read_packet(&mut self) -> Result<Bytes> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| GatewayError::DeviceIo("device closed".into()))
    }
}

/// In-memory device writer
pub struct MemoryWriter {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl DeviceWriter for MemoryWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| GatewayError::DeviceIo("device closed".into()))
    }
}

/// The "network side" of an in-memory device
pub struct MemoryDeviceHandle {
    /// Frames to deliver as if read from the device
    pub inject: mpsc::Sender<Bytes>,
    /// Frames the gateway wrote to the device
    pub written: mpsc::Receiver<Bytes>,
}

/// Build an in-memory device. Dropping `inject` makes reads fail, which
/// the gateway treats like a lost interface.
pub fn memory_device(capacity: usize) -> (MemoryReader, MemoryWriter, MemoryDeviceHandle) {
    let (inject, rx) = mpsc::channel(capacity);
    let (tx, written) = mpsc::channel(capacity);
    (
        MemoryReader { rx },
        MemoryWriter { tx },
        MemoryDeviceHandle { inject, written },
    )
}

/// Ethernet II and ARP handling for layer-2 modes
pub mod ethernet {
    use bytes::{BufMut, Bytes, BytesMut};
    use std::net::Ipv4Addr;

    pub const HEADER_LEN: usize = 14;
    pub const ETHERTYPE_IPV4: u16 = 0x0800;
    pub const ETHERTYPE_ARP: u16 = 0x0806;
    pub const ETHERTYPE_IPV6: u16 = 0x86DD;
    pub const BROADCAST: [u8; 6] = [0xff; 6];

    /// What a frame read from a layer-2 device carries
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Inbound {
        /// IP packet with the Ethernet header removed, plus the sender MAC
        Ip { packet: Bytes, src_mac: [u8; 6] },
        ArpRequest(ArpRequest),
        Other,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArpRequest {
        pub sender_mac: [u8; 6],
        pub sender_ip: Ipv4Addr,
        pub target_ip: Ipv4Addr,
    }

    pub fn classify(frame: &Bytes) -> Inbound {
        if frame.len() < HEADER_LEN {
            return Inbound::Other;
        }
        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&frame[6..12]);
        match u16::from_be_bytes([frame[12], frame[13]]) {
            ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => Inbound::Ip {
                packet: frame.slice(HEADER_LEN..),
                src_mac,
            },
            ETHERTYPE_ARP => parse_arp_request(&frame[HEADER_LEN..])
                .map(Inbound::ArpRequest)
                .unwrap_or(Inbound::Other),
            _ => Inbound::Other,
        }
    }

    fn parse_arp_request(arp: &[u8]) -> Option<ArpRequest> {
        // Ethernet/IPv4 ARP only: htype 1, ptype 0x0800, hlen 6, plen 4, op 1
        if arp.len() < 28 || arp[..8] != [0, 1, 8, 0, 6, 4, 0, 1] {
            return None;
        }
        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&arp[8..14]);
        Some(ArpRequest {
            sender_mac,
            sender_ip: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
            target_ip: Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]),
        })
    }

    /// ARP reply announcing `mac` for the request's target address
    pub fn arp_reply(request: &ArpRequest, mac: [u8; 6]) -> Bytes {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + 28);
        frame.put_slice(&request.sender_mac);
        frame.put_slice(&mac);
        frame.put_u16(ETHERTYPE_ARP);
        frame.put_slice(&[0, 1, 8, 0, 6, 4, 0, 2]);
        frame.put_slice(&mac);
        frame.put_slice(&request.target_ip.octets());
        frame.put_slice(&request.sender_mac);
        frame.put_slice(&request.sender_ip.octets());
        frame.freeze()
    }

    /// Prepend an Ethernet header to an IP packet
    pub fn wrap(packet: &[u8], dst: [u8; 6], src: [u8; 6]) -> Bytes {
        let ethertype = if packet.first().map(|b| b >> 4) == Some(6) {
            ETHERTYPE_IPV6
        } else {
            ETHERTYPE_IPV4
        };
        let mut frame = BytesMut::with_capacity(HEADER_LEN + packet.len());
        frame.put_slice(&dst);
        frame.put_slice(&src);
        frame.put_u16(ethertype);
        frame.put_slice(packet);
        frame.freeze()
    }
}
