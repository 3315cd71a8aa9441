//! TLS acceptor construction
//!
//! The DoT and DoH servers are the TCP and HTTP servers with their
//! listeners TLS-wrapped; everything TLS-specific is the acceptor built
//! here from the configured PEM material.  ALPN defaults depend on the
//! consumer: DoH prefers HTTP/2 over HTTP/1.1, DoT advertises `dot`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsFilesConfig;
use crate::error::{DnsError, DnsResult};

/// Default ALPN for DNS-over-HTTPS; HTTP/2 is prioritized
pub const ALPN_DOH: &[&str] = &["h2", "http/1.1"];

/// Default ALPN for DNS-over-TLS
pub const ALPN_DOT: &[&str] = &["dot"];

/// Build a TLS acceptor from PEM files
///
/// `default_alpn` applies when the configuration lists no ALPN
/// protocols.
///
/// # Errors
///
/// Returns `DnsError::ConfigError` for unreadable files, PEM without a
/// certificate or key, or material rustls rejects.
pub fn tls_acceptor(conf: &TlsFilesConfig, default_alpn: &[&str]) -> DnsResult<TlsAcceptor> {
    let certs = load_certs(&conf.certificate_path)?;
    let key = load_key(&conf.key_path)?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DnsError::config(format!("bad tls material: {e}")))?;

    let alpn: Vec<Vec<u8>> = if conf.alpn.is_empty() {
        default_alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
    } else {
        conf.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
    };
    server_config.alpn_protocols = alpn;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Load the certificate chain from a PEM file
fn load_certs(path: &Path) -> DnsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| DnsError::config(format!("opening certificate {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| DnsError::config(format!("reading certificate {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(DnsError::config(format!(
            "no certificates in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the private key from a PEM file
fn load_key(path: &Path) -> DnsResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| DnsError::config(format!("opening key {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| DnsError::config(format!("reading key {}: {e}", path.display())))?
        .ok_or_else(|| DnsError::config(format!("no private key in {}", path.display())))
}
