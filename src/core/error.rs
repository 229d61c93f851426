//! Error types and classification.
//!
//! Braid defines one error taxonomy for the whole client. Bridge-level
//! failures carry the endpoint and connection role they occurred on; timeouts
//! distinguish whether the command reached the server; server `-ERR` replies
//! are preserved verbatim with a prefix classification. No error silently
//! drops a result.

use crate::core::time::Tick;
use thiserror::Error;

/// The role a physical connection plays on its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Request/response traffic with strict pipelining.
    Interactive,
    /// Pub/sub streaming with independent flow control.
    Subscription,
}

impl std::fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::Subscription => write!(f, "subscription"),
        }
    }
}

/// How a connection-level failure came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailureKind {
    /// Hostname did not resolve.
    UnableToResolve,
    /// TCP (or TLS) establishment failed or timed out.
    UnableToConnect,
    /// The peer closed the socket.
    SocketClosed,
    /// A read or write on an established socket failed.
    SocketFailure,
    /// The server rejected our credentials. Terminal until reconfigured.
    AuthenticationFailure,
    /// The byte stream violated RESP framing. Terminal for the bridge.
    ProtocolFailure,
}

impl std::fmt::Display for ConnectionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnableToResolve => "UnableToResolve",
            Self::UnableToConnect => "UnableToConnect",
            Self::SocketClosed => "SocketClosed",
            Self::SocketFailure => "SocketFailure",
            Self::AuthenticationFailure => "AuthenticationFailure",
            Self::ProtocolFailure => "ProtocolFailure",
        };
        write!(f, "{}", s)
    }
}

/// Prefix classification of a server error reply.
///
/// The raw message is always preserved; the class drives retry and redirect
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// `-MOVED slot host:port`: permanent cluster redirect.
    Moved,
    /// `-ASK slot host:port`: transient cluster redirect.
    Ask,
    /// `-CROSSSLOT`: keys span hash slots.
    CrossSlot,
    /// `-LOADING`: dataset still loading; retryable.
    Loading,
    /// `-BUSY`: server busy running a script.
    Busy,
    /// `-NOAUTH`: authentication required.
    NoAuth,
    /// `-WRONGPASS`: bad credentials.
    WrongPass,
    /// `-READONLY`: write sent to a replica.
    ReadOnly,
    /// `-MASTERDOWN`: replica lost its primary.
    MasterDown,
    /// `-NOSCRIPT`: EVALSHA for an unloaded script.
    NoScript,
    /// `-CLUSTERDOWN`: cluster cannot serve; retryable.
    ClusterDown,
    /// `-TRYAGAIN`: transient multi-key condition; retryable.
    TryAgain,
    /// `-EXECABORT`: transaction discarded after queue errors.
    ExecAbort,
    /// Anything else (`-ERR`, `-WRONGTYPE`, ...).
    Generic,
}

impl ServerErrorKind {
    /// Classify a raw error line by its leading word.
    pub fn classify(message: &str) -> Self {
        let prefix = message.split([' ', '\r', '\n']).next().unwrap_or("");
        match prefix {
            "MOVED" => Self::Moved,
            "ASK" => Self::Ask,
            "CROSSSLOT" => Self::CrossSlot,
            "LOADING" => Self::Loading,
            "BUSY" => Self::Busy,
            "NOAUTH" => Self::NoAuth,
            "WRONGPASS" => Self::WrongPass,
            "READONLY" => Self::ReadOnly,
            "MASTERDOWN" => Self::MasterDown,
            "NOSCRIPT" => Self::NoScript,
            "CLUSTERDOWN" => Self::ClusterDown,
            "TRYAGAIN" => Self::TryAgain,
            "EXECABORT" => Self::ExecAbort,
            _ => Self::Generic,
        }
    }

    /// Whether this class is recovered locally with bounded retries.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Moved | Self::Ask | Self::Loading | Self::TryAgain | Self::ClusterDown
        )
    }
}

/// A server error reply, verbatim plus classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Prefix classification.
    pub kind: ServerErrorKind,
    /// The full error line as received, without the leading `-`.
    pub message: String,
}

impl ServerError {
    /// Build from a raw error line.
    pub fn from_wire(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ServerErrorKind::classify(&message),
            message,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Why a transaction was abandoned before producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAbortReason {
    /// A body or condition command was redirected mid-transaction.
    Redirected,
    /// A queued body command was rejected by the server.
    QueueRejected,
}

impl std::fmt::Display for TransactionAbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redirected => write!(f, "Redirected"),
            Self::QueueRejected => write!(f, "QueueRejected"),
        }
    }
}

/// Per-stage timing and queue-depth context attached to failures.
///
/// When `include_detail` is false (config `includeDetailInExceptions`), the
/// display collapses to the command name only; the error kind is always
/// preserved on the enclosing [`BraidError`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureDetail {
    /// Command name, if known.
    pub command: Option<&'static str>,
    /// Key the command addressed, if any (lossy UTF-8 for display).
    pub key: Option<String>,
    /// Endpoint the message was routed to.
    pub endpoint: Option<String>,
    /// Tick at message creation.
    pub created: Option<Tick>,
    /// Tick when the message entered a queue.
    pub enqueued: Option<Tick>,
    /// Tick when the frame was written to the socket.
    pub sent: Option<Tick>,
    /// Tick when a reply frame arrived.
    pub responded: Option<Tick>,
    /// Write-ready mailbox depth at failure.
    pub write_ready_depth: Option<usize>,
    /// In-flight queue depth at failure.
    pub in_flight_depth: Option<usize>,
    /// Backlog depth at failure.
    pub backlog_depth: Option<usize>,
    /// Whether counters and endpoint strings are rendered.
    pub include_detail: bool,
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(command) = self.command {
            write!(f, "command={}", command)?;
        } else {
            write!(f, "command=?")?;
        }
        if !self.include_detail {
            return Ok(());
        }
        if let Some(key) = &self.key {
            write!(f, " key={}", key)?;
        }
        if let Some(endpoint) = &self.endpoint {
            write!(f, " endpoint={}", endpoint)?;
        }
        if let (Some(created), Some(enqueued)) = (self.created, self.enqueued) {
            write!(f, " queue-wait={}ms", enqueued.since(created))?;
        }
        if let (Some(enqueued), Some(sent)) = (self.enqueued, self.sent) {
            write!(f, " write-wait={}ms", sent.since(enqueued))?;
        }
        if let (Some(sent), Some(responded)) = (self.sent, self.responded) {
            write!(f, " reply-wait={}ms", responded.since(sent))?;
        }
        if let Some(depth) = self.write_ready_depth {
            write!(f, " write-ready={}", depth)?;
        }
        if let Some(depth) = self.in_flight_depth {
            write!(f, " in-flight={}", depth)?;
        }
        if let Some(depth) = self.backlog_depth {
            write!(f, " backlog={}", depth)?;
        }
        Ok(())
    }
}

/// Braid's error type.
///
/// Cloneable so a single connection failure can be fanned out to every
/// in-flight message it strands; sources are folded into the message text
/// rather than chained.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BraidError {
    /// A configuration option failed to parse or validate.
    #[error("configuration error: {message}")]
    Configuration {
        /// What was wrong.
        message: String,
    },

    /// No bridge was ready and the backlog refused the message.
    #[error("connection unavailable ({detail})")]
    ConnectionUnavailable {
        /// Failure context.
        detail: FailureDetail,
    },

    /// A physical connection failed.
    #[error("connection failure: {kind} on {endpoint} ({role}): {message}")]
    ConnectionFailure {
        /// How the connection failed.
        kind: ConnectionFailureKind,
        /// The endpoint the connection targeted.
        endpoint: String,
        /// Which role the connection served.
        role: ConnectionRole,
        /// Underlying cause, rendered.
        message: String,
    },

    /// The deadline expired before the frame was written to the socket.
    #[error("timeout before write ({detail})")]
    TimeoutBeforeWrite {
        /// Failure context.
        detail: FailureDetail,
    },

    /// The deadline expired after the command reached the server.
    #[error("timeout awaiting reply ({detail})")]
    TimeoutAfterWrite {
        /// Failure context.
        detail: FailureDetail,
    },

    /// The server replied with an error.
    #[error("server error: {error}")]
    Server {
        /// The classified reply.
        error: ServerError,
    },

    /// `EXEC` was aborted because a body command failed to queue.
    #[error("transaction aborted by server (EXECABORT)")]
    ExecAborted,

    /// `EXEC` returned nil: a watched key changed.
    #[error("transaction not executed: watched key changed")]
    WatchFailed,

    /// The transaction could not be executed as a unit.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Why the transaction was abandoned.
        reason: TransactionAbortReason,
    },

    /// The reply frame's shape did not match the command's processor.
    #[error("unexpected reply for {command}: expected {expected}, got {got}")]
    UnexpectedReply {
        /// The command whose reply mismatched.
        command: &'static str,
        /// The shape the processor wanted.
        expected: &'static str,
        /// The wire shape that arrived.
        got: &'static str,
    },

    /// Inbound bytes violated RESP framing. Fatal to the bridge.
    #[error("protocol decode error at byte {offset}: expected {expected}: {message}")]
    ProtocolDecode {
        /// Byte offset into the connection's inbound stream position.
        offset: u64,
        /// The token class the decoder was expecting.
        expected: &'static str,
        /// Description of the violation.
        message: String,
    },

    /// A multi-key operation's keys do not share a hash slot.
    #[error("keys do not hash to the same slot (slots {first} and {second})")]
    CrossSlot {
        /// Slot of the first key.
        first: u16,
        /// The first differing slot.
        second: u16,
    },

    /// The multiplexer has been closed.
    #[error("multiplexer has been closed")]
    Disposed,
}

impl BraidError {
    /// Shorthand for a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for a server error from a raw reply line.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            error: ServerError::from_wire(message),
        }
    }

    /// The server error, if this is one.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Server { error } => Some(error),
            _ => None,
        }
    }

    /// Whether the bridge that produced this error must tear down.
    pub fn is_fatal_to_bridge(&self) -> bool {
        matches!(
            self,
            Self::ProtocolDecode { .. } | Self::ConnectionFailure { .. }
        )
    }
}

/// Result type using [`BraidError`].
pub type BraidResult<T> = Result<T, BraidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_prefixes() {
        assert_eq!(
            ServerErrorKind::classify("MOVED 16287 10.0.0.2:6379"),
            ServerErrorKind::Moved
        );
        assert_eq!(
            ServerErrorKind::classify("ASK 42 10.0.0.3:6379"),
            ServerErrorKind::Ask
        );
        assert_eq!(
            ServerErrorKind::classify("WRONGPASS invalid username-password pair"),
            ServerErrorKind::WrongPass
        );
        assert_eq!(
            ServerErrorKind::classify("ERR unknown command 'HELLO'"),
            ServerErrorKind::Generic
        );
        assert_eq!(
            ServerErrorKind::classify("WRONGTYPE Operation against a key"),
            ServerErrorKind::Generic
        );
    }

    #[test]
    fn recoverable_classes() {
        assert!(ServerErrorKind::Moved.is_locally_recoverable());
        assert!(ServerErrorKind::Loading.is_locally_recoverable());
        assert!(ServerErrorKind::TryAgain.is_locally_recoverable());
        assert!(!ServerErrorKind::WrongPass.is_locally_recoverable());
        assert!(!ServerErrorKind::Generic.is_locally_recoverable());
    }

    #[test]
    fn detail_display_respects_flag() {
        let mut detail = FailureDetail {
            command: Some("GET"),
            endpoint: Some("127.0.0.1:6379".to_string()),
            created: Some(Tick::new(0)),
            enqueued: Some(Tick::new(2)),
            sent: Some(Tick::new(5)),
            in_flight_depth: Some(3),
            include_detail: true,
            ..Default::default()
        };
        let full = detail.to_string();
        assert!(full.contains("endpoint=127.0.0.1:6379"));
        assert!(full.contains("write-wait=3ms"));
        assert!(full.contains("in-flight=3"));

        detail.include_detail = false;
        let terse = detail.to_string();
        assert_eq!(terse, "command=GET");
    }

    #[test]
    fn server_error_preserves_message() {
        let err = BraidError::server("LOADING Redis is loading the dataset in memory");
        let server = err.as_server_error().unwrap();
        assert_eq!(server.kind, ServerErrorKind::Loading);
        assert!(server.message.starts_with("LOADING"));
    }
}
