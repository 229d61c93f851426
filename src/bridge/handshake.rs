//! Per-bridge connection handshake.
//!
//! Sequence: `HELLO 3` (with inline AUTH/SETNAME) when RESP3 is wanted,
//! falling back to `AUTH` + `CLIENT SETNAME` on RESP2-only servers; then
//! best-effort `CLIENT SETINFO`, then `SELECT` for a non-zero default
//! database. Authentication rejections are terminal for the endpoint;
//! everything else is retryable.

use crate::core::config::{Options, ProtocolChoice};
use crate::core::error::{ConnectionFailureKind, ServerError, ServerErrorKind};
use crate::net::BridgeStream;
use crate::protocol::{encode_command, FrameDecoder, RawFrame, RespVersion};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Library name reported via `CLIENT SETINFO`.
const LIB_NAME: &str = "braid";

/// What the handshake learned.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Protocol the connection speaks from here on.
    pub resp: RespVersion,
    /// Server version from the `HELLO` reply, when available.
    pub server_version: Option<String>,
    /// Server role from the `HELLO` reply (`master`/`replica`).
    pub role_hint: Option<String>,
}

/// A failed handshake, classified.
#[derive(Debug, Clone)]
pub struct HandshakeFailure {
    /// Failure class; `AuthenticationFailure` is terminal for the endpoint.
    pub kind: ConnectionFailureKind,
    /// Cause, with any server reply preserved verbatim.
    pub message: String,
}

impl HandshakeFailure {
    fn new(kind: ConnectionFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Run the handshake on a fresh stream.
pub async fn run(
    options: &Options,
    stream: &mut BridgeStream,
    decoder: &mut FrameDecoder,
) -> Result<Negotiated, HandshakeFailure> {
    let mut negotiated = Negotiated {
        resp: RespVersion::Resp2,
        server_version: None,
        role_hint: None,
    };
    let mut authenticated = false;

    if options.protocol != ProtocolChoice::Resp2 {
        let mut parts: Vec<Bytes> = vec![Bytes::from_static(b"HELLO"), Bytes::from_static(b"3")];
        if let Some(password) = &options.password {
            parts.push(Bytes::from_static(b"AUTH"));
            parts.push(Bytes::from(
                options.user.clone().unwrap_or_else(|| "default".to_string()),
            ));
            parts.push(Bytes::from(password.clone()));
        }
        if let Some(name) = &options.client_name {
            parts.push(Bytes::from_static(b"SETNAME"));
            parts.push(Bytes::from(name.clone()));
        }

        // The acceptance reply is already RESP3-framed (a map); an error
        // reply parses identically in both modes.
        decoder.set_version(RespVersion::Resp3);
        let reply = exchange(stream, decoder, &parts).await?;
        match reply {
            RawFrame::Error(line) => {
                decoder.set_version(RespVersion::Resp2);
                let error = ServerError::from_wire(line);
                match error.kind {
                    ServerErrorKind::WrongPass | ServerErrorKind::NoAuth => {
                        return Err(HandshakeFailure::new(
                            ConnectionFailureKind::AuthenticationFailure,
                            error.message,
                        ));
                    }
                    _ if options.protocol == ProtocolChoice::Resp3 => {
                        return Err(HandshakeFailure::new(
                            ConnectionFailureKind::ProtocolFailure,
                            format!("HELLO 3 rejected: {}", error.message),
                        ));
                    }
                    // `Auto`: pre-6 server without HELLO; stay on RESP2.
                    _ => {}
                }
            }
            frame => {
                negotiated.resp = RespVersion::Resp3;
                authenticated = true;
                if let Some(pairs) = frame.into_pairs() {
                    for (key, value) in pairs {
                        match key.as_str() {
                            Some("version") => {
                                negotiated.server_version =
                                    value.as_str().map(str::to_string);
                            }
                            Some("role") => {
                                negotiated.role_hint = value.as_str().map(str::to_string);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    if !authenticated {
        if let Some(password) = &options.password {
            let mut parts: Vec<Bytes> = vec![Bytes::from_static(b"AUTH")];
            if let Some(user) = &options.user {
                parts.push(Bytes::from(user.clone()));
            }
            parts.push(Bytes::from(password.clone()));
            match exchange(stream, decoder, &parts).await? {
                RawFrame::Simple(_) => {}
                RawFrame::Error(line) => {
                    return Err(HandshakeFailure::new(
                        ConnectionFailureKind::AuthenticationFailure,
                        line,
                    ));
                }
                other => {
                    return Err(HandshakeFailure::new(
                        ConnectionFailureKind::ProtocolFailure,
                        format!("unexpected AUTH reply: {}", other.kind_name()),
                    ));
                }
            }
        }
        if let Some(name) = &options.client_name {
            let parts = [
                Bytes::from_static(b"CLIENT"),
                Bytes::from_static(b"SETNAME"),
                Bytes::from(name.clone()),
            ];
            // Best effort; older servers may reject the name.
            let _ = exchange(stream, decoder, &parts).await?;
        }
    }

    for (field, value) in [
        ("lib-name", LIB_NAME),
        ("lib-ver", env!("CARGO_PKG_VERSION")),
    ] {
        let parts = [
            Bytes::from_static(b"CLIENT"),
            Bytes::from_static(b"SETINFO"),
            Bytes::from_static(field.as_bytes()),
            Bytes::from_static(value.as_bytes()),
        ];
        // Best effort: pre-7.2 servers reply with an error.
        let _ = exchange(stream, decoder, &parts).await?;
    }

    if options.default_database != 0 {
        let parts = [
            Bytes::from_static(b"SELECT"),
            Bytes::from(options.default_database.to_string()),
        ];
        match exchange(stream, decoder, &parts).await? {
            RawFrame::Simple(_) => {}
            RawFrame::Error(line) => {
                return Err(HandshakeFailure::new(
                    ConnectionFailureKind::ProtocolFailure,
                    format!("SELECT {} rejected: {}", options.default_database, line),
                ));
            }
            other => {
                return Err(HandshakeFailure::new(
                    ConnectionFailureKind::ProtocolFailure,
                    format!("unexpected SELECT reply: {}", other.kind_name()),
                ));
            }
        }
    }

    Ok(negotiated)
}

/// Write one command and read exactly one reply frame.
async fn exchange(
    stream: &mut BridgeStream,
    decoder: &mut FrameDecoder,
    parts: &[Bytes],
) -> Result<RawFrame, HandshakeFailure> {
    let mut buf = BytesMut::with_capacity(128);
    encode_command(&mut buf, parts.iter());
    stream.write_all(&buf).await.map_err(|e| {
        HandshakeFailure::new(ConnectionFailureKind::SocketFailure, e.to_string())
    })?;
    stream.flush().await.map_err(|e| {
        HandshakeFailure::new(ConnectionFailureKind::SocketFailure, e.to_string())
    })?;

    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.next_frame().map_err(|e| {
            HandshakeFailure::new(ConnectionFailureKind::ProtocolFailure, e.to_string())
        })? {
            return Ok(frame);
        }
        let n = stream.read(&mut chunk).await.map_err(|e| {
            HandshakeFailure::new(ConnectionFailureKind::SocketFailure, e.to_string())
        })?;
        if n == 0 {
            return Err(HandshakeFailure::new(
                ConnectionFailureKind::SocketClosed,
                "connection closed during handshake",
            ));
        }
        decoder.feed(&chunk[..n]).map_err(|e| {
            HandshakeFailure::new(ConnectionFailureKind::ProtocolFailure, e.to_string())
        })?;
    }
}
