//! TCP establishment with failure classification.

use super::{tls, BridgeStream};
use crate::core::config::Options;
use crate::core::error::{BraidError, ConnectionFailureKind, ConnectionRole};
use tokio::net::TcpStream;

/// Establish the physical stream for one bridge.
///
/// Resolution, connect, and TLS failures are classified so the caller can
/// tell which stage failed; `connectTimeout` bounds the whole sequence.
pub async fn connect(
    endpoint: &str,
    options: &Options,
    role: ConnectionRole,
) -> Result<BridgeStream, BraidError> {
    let fail = |kind: ConnectionFailureKind, message: String| BraidError::ConnectionFailure {
        kind,
        endpoint: endpoint.to_string(),
        role,
        message,
    };

    let (host, _port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| fail(ConnectionFailureKind::UnableToResolve, "not host:port".into()))?;

    let attempt = async {
        let mut addrs = tokio::net::lookup_host(endpoint).await.map_err(|e| {
            fail(
                ConnectionFailureKind::UnableToResolve,
                format!("resolving '{}': {}", endpoint, e),
            )
        })?;
        let addr = addrs.next().ok_or_else(|| {
            fail(
                ConnectionFailureKind::UnableToResolve,
                format!("'{}' resolved to no addresses", endpoint),
            )
        })?;

        let stream = TcpStream::connect(addr).await.map_err(|e| {
            fail(
                ConnectionFailureKind::UnableToConnect,
                format!("connecting {}: {}", addr, e),
            )
        })?;
        let _ = stream.set_nodelay(true);

        if options.ssl {
            let connector = tls::connector(options)?;
            let name = tls::server_name(options, host)?;
            let upgraded = connector.connect(name, stream).await.map_err(|e| {
                fail(
                    ConnectionFailureKind::UnableToConnect,
                    format!("TLS handshake with {}: {}", endpoint, e),
                )
            })?;
            Ok(BridgeStream::Tls(Box::new(upgraded)))
        } else {
            Ok(BridgeStream::Tcp(stream))
        }
    };

    match tokio::time::timeout(options.connect_timeout(), attempt).await {
        Ok(result) => result,
        Err(_) => Err(fail(
            ConnectionFailureKind::UnableToConnect,
            format!("connect timed out after {:?}", options.connect_timeout()),
        )),
    }
}
