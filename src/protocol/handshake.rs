//! Control handshake: the `CONNECT /CSCOSSLC/tunnel` request head and
//! the `200 CONNECTED` / rejection responses

use crate::crypto::SECRET_LEN;
use crate::error::{GatewayError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::BytesMut;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest accepted request head
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;
/// Only path the gateway tunnels on
pub const TUNNEL_PATH: &str = "/CSCOSSLC/tunnel";
/// Smallest MTU the gateway will negotiate
pub const MIN_MTU: u16 = 576;

/// Credential presented by the client
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password { username: String, password: String },
}

impl Credential {
    pub fn username(&self) -> &str {
        match self {
            Credential::Password { username, .. } => username,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Address families the client can configure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFamilies {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl Default for AddressFamilies {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: false,
        }
    }
}

/// Validated handshake request
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub credential: Credential,
    pub hostname: Option<String>,
    pub user_agent: Option<String>,
    pub mtu: Option<u16>,
    pub base_mtu: Option<u16>,
    pub address_families: AddressFamilies,
    /// Present only when the client wants a datagram channel
    pub master_secret: Option<[u8; SECRET_LEN]>,
    pub local_address: Option<Ipv4Addr>,
}

impl HandshakeRequest {
    /// Parse a request head (everything before the blank line)
    pub fn parse(head: &str) -> Result<Self> {
        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| protocol("Empty request"))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(protocol("Malformed request line"));
        };
        if method != "CONNECT" {
            return Err(protocol(&format!("Unsupported method {method}")));
        }
        if path != TUNNEL_PATH {
            return Err(protocol(&format!("Unsupported path {path}")));
        }
        if !version.starts_with("HTTP/1.") {
            return Err(protocol(&format!("Unsupported version {version}")));
        }

        let mut credential = None;
        let mut cstp_version = None;
        let mut request = HandshakeRequest {
            credential: Credential::Password {
                username: String::new(),
                password: String::new(),
            },
            hostname: None,
            user_agent: None,
            mtu: None,
            base_mtu: None,
            address_families: AddressFamilies::default(),
            master_secret: None,
            local_address: None,
        };

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| protocol("Malformed header line"))?;
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "authorization" => credential = Some(parse_basic(value)?),
                "x-cstp-version" => cstp_version = Some(value.to_string()),
                "x-cstp-hostname" => request.hostname = Some(value.to_string()),
                "user-agent" => request.user_agent = Some(value.to_string()),
                "x-cstp-mtu" => request.mtu = Some(parse_mtu(value)?),
                "x-cstp-base-mtu" => request.base_mtu = Some(parse_mtu(value)?),
                "x-cstp-address-type" => {
                    request.address_families = parse_address_types(value)?
                }
                "x-dtls-master-secret" => request.master_secret = Some(parse_secret(value)?),
                "x-cstp-local-address-ip4" => {
                    request.local_address = Some(
                        value
                            .parse()
                            .map_err(|_| protocol("Invalid X-CSTP-Local-Address-IP4"))?,
                    )
                }
                _ => {}
            }
        }

        match cstp_version.as_deref() {
            Some("1") => {}
            Some(other) => return Err(protocol(&format!("Unsupported CSTP version {other}"))),
            None => return Err(protocol("Missing X-CSTP-Version")),
        }
        request.credential = credential.ok_or_else(|| protocol("Missing Authorization"))?;
        Ok(request)
    }

    /// Tunnel MTU: the client's request capped by policy and the base MTU
    pub fn negotiate_mtu(&self, policy_mtu: u16) -> u16 {
        let mut mtu = self.mtu.unwrap_or(policy_mtu).min(policy_mtu);
        if let Some(base) = self.base_mtu {
            mtu = mtu.min(base);
        }
        mtu.max(MIN_MTU)
    }
}

fn protocol(msg: &str) -> GatewayError {
    GatewayError::Protocol(msg.to_string())
}

fn parse_basic(value: &str) -> Result<Credential> {
    let (scheme, encoded) = value
        .split_once(' ')
        .ok_or_else(|| protocol("Malformed Authorization"))?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(protocol("Only Basic authorization is supported"));
    }
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| protocol("Invalid Basic credential encoding"))?;
    let text = String::from_utf8(decoded).map_err(|_| protocol("Credential is not UTF-8"))?;
    let (username, password) = text
        .split_once(':')
        .ok_or_else(|| protocol("Basic credential lacks a password"))?;
    if username.is_empty() {
        return Err(protocol("Empty username"));
    }
    Ok(Credential::Password {
        username: username.to_string(),
        password: password.to_string(),
    })
}

fn parse_mtu(value: &str) -> Result<u16> {
    let mtu: u16 = value.parse().map_err(|_| protocol("Invalid MTU"))?;
    if !(MIN_MTU..=9000).contains(&mtu) {
        return Err(protocol(&format!("MTU {mtu} out of range")));
    }
    Ok(mtu)
}

fn parse_address_types(value: &str) -> Result<AddressFamilies> {
    let mut families = AddressFamilies {
        ipv4: false,
        ipv6: false,
    };
    for item in value.split(',') {
        match item.trim().to_ascii_lowercase().as_str() {
            "ipv4" => families.ipv4 = true,
            "ipv6" => families.ipv6 = true,
            "" => {}
            other => return Err(protocol(&format!("Unknown address type {other}"))),
        }
    }
    if !families.ipv4 && !families.ipv6 {
        return Err(protocol("No address type requested"));
    }
    Ok(families)
}

fn parse_secret(value: &str) -> Result<[u8; SECRET_LEN]> {
    let bytes = hex::decode(value).map_err(|_| protocol("Master secret is not hex"))?;
    bytes
        .try_into()
        .map_err(|_| protocol("Master secret must be 32 bytes"))
}

/// Read a request head terminated by an empty line.
///
/// Returns the head and any bytes the client sent after it.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<(String, BytesMut)> {
    let read = async {
        let mut buf = BytesMut::with_capacity(2048);
        loop {
            if let Some(end) = find_head_end(&buf) {
                let head = buf.split_to(end + 4);
                let text = std::str::from_utf8(&head[..end])
                    .map_err(|_| protocol("Request head is not UTF-8"))?
                    .to_string();
                return Ok((text, buf));
            }
            if buf.len() >= MAX_REQUEST_HEAD {
                return Err(protocol("Request head too large"));
            }
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(protocol("Connection closed during handshake"));
            }
        }
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| GatewayError::Timeout("handshake request".into()))?
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parameters returned to the client on success
#[derive(Debug, Clone)]
pub struct NegotiatedParams {
    pub session_id: String,
    pub address_v4: Option<Ipv4Net>,
    pub address_v6: Option<Ipv6Net>,
    pub dns: Vec<IpAddr>,
    pub split_include: Vec<IpNet>,
    pub split_exclude: Vec<IpNet>,
    pub allow_lan: bool,
    pub mtu: u16,
    pub keepalive: u32,
    pub dpd: u32,
    pub idle_timeout: u32,
    pub rekey_interval: u32,
    /// Datagram port, when a datagram channel is offered
    pub dtls_port: Option<u16>,
}

impl NegotiatedParams {
    /// Render the `200 CONNECTED` response head
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str("HTTP/1.1 200 CONNECTED\r\n");
        header(&mut out, "Server", &format!("rvpngw/{}", crate::VERSION));
        header(&mut out, "X-CSTP-Version", "1");
        header(&mut out, "X-CSTP-Protocol", "Copyright (c) 2004 Cisco Systems, Inc.");
        if let Some(v4) = self.address_v4 {
            header(&mut out, "X-CSTP-Address", &v4.addr().to_string());
            header(&mut out, "X-CSTP-Netmask", &v4.netmask().to_string());
        }
        if let Some(v6) = self.address_v6 {
            header(&mut out, "X-CSTP-Address-IP6", &v6.to_string());
        }
        for dns in &self.dns {
            header(&mut out, "X-CSTP-DNS", &dns.to_string());
        }
        for route in &self.split_include {
            split_header(&mut out, "X-CSTP-Split-Include", route);
        }
        if self.allow_lan {
            header(&mut out, "X-CSTP-Split-Exclude", "0.0.0.0/255.255.255.255");
        }
        for route in &self.split_exclude {
            split_header(&mut out, "X-CSTP-Split-Exclude", route);
        }
        header(&mut out, "X-CSTP-MTU", &self.mtu.to_string());
        header(&mut out, "X-CSTP-Keepalive", &self.keepalive.to_string());
        header(&mut out, "X-CSTP-DPD", &self.dpd.to_string());
        header(&mut out, "X-CSTP-Idle-Timeout", &timer_value(self.idle_timeout));
        header(&mut out, "X-CSTP-Rekey-Time", &timer_value(self.rekey_interval));
        header(&mut out, "X-CSTP-Rekey-Method", "ssl");
        header(&mut out, "X-CSTP-Session-Timeout", "none");
        header(&mut out, "X-DTLS-Session-ID", &self.session_id);
        if let Some(port) = self.dtls_port {
            header(&mut out, "X-DTLS-Port", &port.to_string());
            header(&mut out, "X-DTLS-DPD", &self.dpd.to_string());
            header(&mut out, "X-DTLS-Keepalive", &self.keepalive.to_string());
            header(&mut out, "X-DTLS-Rekey-Time", &timer_value(self.rekey_interval));
            header(
                &mut out,
                "X-DTLS-MTU",
                &self.mtu.saturating_sub(crate::crypto::SEAL_OVERHEAD as u16).to_string(),
            );
        }
        out.push_str("\r\n");
        out
    }
}

fn header(out: &mut String, name: &str, value: &str) {
    let _ = write!(out, "{name}: {value}\r\n");
}

fn split_header(out: &mut String, name: &str, route: &IpNet) {
    match route {
        IpNet::V4(net) => header(out, name, &format!("{}/{}", net.network(), net.netmask())),
        IpNet::V6(net) => header(out, &format!("{name}-IP6"), &net.trunc().to_string()),
    }
}

fn timer_value(secs: u32) -> String {
    if secs == 0 {
        "none".to_string()
    } else {
        secs.to_string()
    }
}

/// Handshake rejection sent before the connection is closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Unavailable(String),
}

impl Rejection {
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Rejection::BadRequest(_) => (400, "Bad Request"),
            Rejection::Unauthorized(_) => (401, "Unauthorized"),
            Rejection::Forbidden(_) => (403, "Forbidden"),
            Rejection::Unavailable(_) => (503, "Service Unavailable"),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Rejection::BadRequest(r)
            | Rejection::Unauthorized(r)
            | Rejection::Forbidden(r)
            | Rejection::Unavailable(r) => r,
        }
    }

    pub fn render(&self) -> String {
        let (code, text) = self.status();
        // Header values must stay on one line
        let reason: String = self
            .reason()
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        format!(
            "HTTP/1.1 {code} {text}\r\nServer: rvpngw/{}\r\nX-Reason: {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            crate::VERSION
        )
    }
}
