//! AnyConnect-compatible wire formats
//!
//! `handshake` covers the HTTP-like request/response that opens a tunnel,
//! `packets` the CSTP framing used on the control stream and the datagram
//! attach messages, and `ip` the header inspection the router needs.

pub mod handshake;
pub mod ip;
pub mod packets;

pub use handshake::{Credential, HandshakeRequest, NegotiatedParams, Rejection};
pub use packets::{Frame, FrameReader, FrameType};

