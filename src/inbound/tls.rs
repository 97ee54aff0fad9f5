//! rustls acceptor construction from PEM files

use crate::{Error, Result};
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// ALPN protocols offered to TLS clients, h2 preferred.
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Build an acceptor for the certificate chain and key at the given paths.
pub fn build_acceptor(cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Result<TlsAcceptor> {
    let certs = load_certs(cert.as_ref())?;
    let key = load_private_key(key.as_ref())?;
    Ok(TlsAcceptor::from(Arc::new(server_config(certs, key)?)))
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("open certificate {}: {}", path.display(), e)))?;
    parse_certs(&mut BufReader::new(file))
        .map_err(|e| Error::tls(format!("{} in {}", e, path.display())))
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("open private key {}: {}", path.display(), e)))?;
    parse_private_key(&mut BufReader::new(file))
        .map_err(|e| Error::tls(format!("{} in {}", e, path.display())))
}

fn parse_certs(reader: &mut dyn BufRead) -> std::result::Result<Vec<CertificateDer<'static>>, String> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid PEM: {}", e))?;
    if certs.is_empty() {
        return Err("no certificates found".to_string());
    }
    Ok(certs)
}

fn parse_private_key(reader: &mut dyn BufRead) -> std::result::Result<PrivateKeyDer<'static>, String> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| format!("invalid PEM: {}", e))?
        .ok_or_else(|| "no private key found".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_missing_files() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(matches!(
            build_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem"),
            Err(Error::Tls(_))
        ));
    }

    #[test]
    fn test_pem_without_items() {
        let mut empty = Cursor::new(b"not a pem file\n".to_vec());
        assert_eq!(parse_certs(&mut empty).unwrap_err(), "no certificates found");

        let mut empty = Cursor::new(Vec::new());
        assert_eq!(parse_private_key(&mut empty).unwrap_err(), "no private key found");
    }

    #[test]
    fn test_alpn_prefers_h2() {
        assert_eq!(ALPN_PROTOCOLS[0], b"h2");
        assert_eq!(ALPN_PROTOCOLS[1], b"http/1.1");
    }
}
