//! Client-side TLS configuration.
//!
//! Builds the rustls client config a bridge uses when `ssl=true`. The
//! handshake itself runs inside `tokio-rustls`; this module only shapes the
//! configuration: trust roots, minimum protocol version, and the server
//! name to validate against.

use crate::core::config::{Options, TlsVersionMin};
use crate::core::error::{BraidError, BraidResult};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Build a TLS connector from client options.
///
/// Trust is anchored at the webpki root set, plus any anchors loaded from
/// `sslCaFile`. Revocation checking (`checkCertificateRevocation`) is
/// honored by the platform verifier when one is installed; the bundled
/// verifier validates chains and expiry only.
pub fn connector(options: &Options) -> BraidResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = &options.ssl_ca_file {
        let anchors = load_ca_file(Path::new(path))
            .map_err(|e| BraidError::configuration(format!("{:#}", e)))?;
        for anchor in anchors {
            roots.add(anchor).map_err(|e| {
                BraidError::configuration(format!("bad CA certificate in '{}': {}", path, e))
            })?;
        }
    }

    let versions: &[&tokio_rustls::rustls::SupportedProtocolVersion] = match options.ssl_protocols
    {
        TlsVersionMin::Tls12 => &[
            &tokio_rustls::rustls::version::TLS13,
            &tokio_rustls::rustls::version::TLS12,
        ],
        TlsVersionMin::Tls13 => &[&tokio_rustls::rustls::version::TLS13],
    };

    let config = ClientConfig::builder_with_protocol_versions(versions)
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Read PEM trust anchors from disk.
fn load_ca_file(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("reading CA file '{}'", path.display()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .with_context(|| format!("parsing CA file '{}'", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in '{}'", path.display());
    Ok(certs)
}

/// The server name certificates are validated against: `sslHost` when set,
/// otherwise the endpoint's host part.
pub fn server_name(options: &Options, host: &str) -> BraidResult<ServerName<'static>> {
    let name = options.ssl_host.as_deref().unwrap_or(host);
    ServerName::try_from(name.to_string()).map_err(|_| {
        BraidError::configuration(format!("'{}' is not a valid TLS server name", name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_prefers_ssl_host() {
        let mut options = Options::single("10.0.0.1:6380");
        options.ssl_host = Some("cache.example.com".to_string());
        let name = server_name(&options, "10.0.0.1").unwrap();
        assert!(matches!(name, ServerName::DnsName(_)));
    }

    #[test]
    fn ip_host_is_accepted() {
        let options = Options::single("10.0.0.1:6380");
        let name = server_name(&options, "10.0.0.1").unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }

    #[test]
    fn connector_builds_for_both_minimums() {
        let mut options = Options::single("localhost:6380");
        options.ssl = true;
        assert!(connector(&options).is_ok());
        options.ssl_protocols = TlsVersionMin::Tls13;
        assert!(connector(&options).is_ok());
    }
}
