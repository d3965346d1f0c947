//! TLS wrapping for stream strategies
//!
//! Servers load a PEM certificate chain and key from the configuration.
//! Clients trust the web PKI roots plus an optional extra CA, and send the
//! configured SNI (or the server host) in the ClientHello.

use super::TransportError;
use crate::config::Config;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

/// ALPN offered and accepted by HTTP-shaped transports
const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Build the server-side acceptor from `tls_cert` / `tls_key`
pub(crate) fn build_acceptor(config: &Config) -> Result<TlsAcceptor, TransportError> {
    let cert_path = config
        .tls_cert
        .as_deref()
        .ok_or_else(|| TransportError::Tls("tls_cert not configured".to_string()))?;
    let key_path = config
        .tls_key
        .as_deref()
        .ok_or_else(|| TransportError::Tls("tls_key not configured".to_string()))?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("Failed to build TLS server config: {}", e)))?;
    tls_config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    info!("TLS enabled with cert: {}", cert_path);
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Build the client-side connector and the name to present
pub(crate) fn build_connector(
    config: &Config,
) -> Result<(TlsConnector, ServerName<'static>), TransportError> {
    let mut root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    if let Some(ca_path) = &config.tls_ca {
        for cert in load_certs(ca_path)? {
            root_store
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("Invalid CA certificate: {}", e)))?;
        }
    }

    let mut tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    let sni = match &config.tls_sni {
        Some(sni) => sni.clone(),
        None => server_host(&config.server_addr).to_string(),
    };
    let server_name = ServerName::try_from(sni)
        .map_err(|e| TransportError::Tls(format!("Invalid SNI: {}", e)))?;

    Ok((TlsConnector::from(Arc::new(tls_config)), server_name))
}

/// Host part of `host:port` (brackets stripped for IPv6)
fn server_host(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Load TLS certificate chain from PEM file
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut file = BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| TransportError::Tls(format!("Failed to open cert file {}: {}", path, e)))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("No certificates found in {}", path)));
    }
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut file = BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| TransportError::Tls(format!("Failed to open key file {}: {}", path, e)))?,
    );
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| TransportError::Tls(format!("No private key found in {}", path)))
}
