//! rvpngw - session core and tunnel data plane for an SSL-VPN gateway
//!
//! Speaks the AnyConnect-compatible tunnel protocol: clients authenticate on
//! a TLS control stream, receive an address from their group's pool and then
//! exchange IP packets over the stream (CSTP framing) or over an encrypted
//! datagram channel. Packets from the virtual device are routed back to the
//! owning session.
//!
//! ## What This Crate Provides
//! - Configuration parsing and validation (TOML format)
//! - Handshake negotiation with local users and group policies
//! - Address pools with reservations and sticky reassignment
//! - Session lifecycle: dead-peer detection, idle timeouts, rekeying
//! - Packet routing between sessions and the TUN/TAP device, with ACLs
//! - Batched audit records for session start/end, traffic and access
//!
//! ## What It Leaves Out
//! - Web portal, RADIUS/LDAP/OTP authentication and a management API
//! - Host routing and firewall setup (beyond bringing the device up)

pub mod audit;
pub mod auth;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod datagram;
pub mod device;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod negotiator;
pub mod policy;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod session;
pub mod supervisor;

// Re-export core types
pub use audit::{AuditEvent, AuditSink};
pub use auth::{Authenticator, Identity, PolicyProvider};
pub use config::Config;
pub use error::{GatewayError, Result};
pub use gateway::{Collaborators, Gateway};
pub use session::{CloseReason, SessionId, SessionSnapshot, SessionState};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
