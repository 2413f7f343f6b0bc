//! TLS acceptor for the control channel

use crate::config::TlsSettings;
use crate::error::{GatewayError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::sync::{Arc, OnceLock};
use tokio_rustls::TlsAcceptor;

/// Install the ring provider as the process default once
fn install_provider() {
    static CRYPTO_INIT: OnceLock<()> = OnceLock::new();
    CRYPTO_INIT.get_or_init(|| {
        // Another component may have installed a provider already
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build an acceptor from the certificate and key files in the config
pub fn load_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(&settings.cert_path).map_err(|e| {
        GatewayError::Tls(format!(
            "Failed to read certificate {}: {e}",
            settings.cert_path
        ))
    })?;
    let key_pem = std::fs::read(&settings.key_path).map_err(|e| {
        GatewayError::Tls(format!(
            "Failed to read private key {}: {e}",
            settings.key_path
        ))
    })?;
    acceptor_from_pem(&cert_pem, &key_pem)
}

/// Build an acceptor from PEM encoded certificate chain and private key
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor> {
    install_provider();

    let certs = parse_certs(cert_pem)?;
    let key = parse_key(key_pem)?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    log::debug!("TLS acceptor ready");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("Invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls("No certificates found in PEM".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatewayError::Tls(format!("Invalid private key PEM: {e}")))?
        .ok_or_else(|| GatewayError::Tls("No private key found in PEM".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pem_rejected() {
        let err = acceptor_from_pem(b"", b"").err().unwrap();
        assert!(matches!(err, GatewayError::Tls(_)));
    }

    #[test]
    fn test_missing_files_rejected() {
        let settings = TlsSettings {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        let err = load_acceptor(&settings).err().unwrap();
        assert!(err.to_string().contains("certificate"));
    }

    #[test]
    fn test_key_without_cert_block() {
        let pem = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(parse_key(pem).is_err());
    }
}
