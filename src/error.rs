//! Error types and handling for the gateway core

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport encryption handshake failures (before any session exists)
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Credential rejected by the authentication collaborator
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// No free address in the group's pool
    #[error("Address pool exhausted: {0}")]
    PoolExhausted(String),

    /// Address already bound to a live session
    #[error("Address in use: {0}")]
    AddressInUse(String),

    /// Per-user session limit reached
    #[error("Session limit reached: {0}")]
    SessionLimit(String),

    /// Malformed control or data message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Virtual interface failures (fatal for the process)
    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    /// Audit persistence failures (never reach the data plane)
    #[error("Audit sink error: {0}")]
    AuditSink(String),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// Illegal session state transitions
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown session or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether this error must bring the whole gateway down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::DeviceIo(_))
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<rustls::Error> for GatewayError {
    fn from(err: rustls::Error) -> Self {
        GatewayError::Tls(format!("TLS error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::PoolExhausted("group staff".to_string());
        assert_eq!(err.to_string(), "Address pool exhausted: group staff");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GatewayError = io_err.into();
        assert!(matches!(err, GatewayError::Io(_)));
    }

    #[test]
    fn test_only_device_errors_are_fatal() {
        assert!(GatewayError::DeviceIo("tun0 gone".into()).is_fatal());
        assert!(!GatewayError::Protocol("bad frame".into()).is_fatal());
        assert!(!GatewayError::AuditSink("db down".into()).is_fatal());
    }

    #[test]
    fn test_toml_errors_are_config_errors() {
        let err: GatewayError = toml::from_str::<toml::Value>("listen = ").unwrap_err().into();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
