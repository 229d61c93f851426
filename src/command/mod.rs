//! Command model: keys, argument values, command identities and dispatch
//! hints.
//!
//! The high-level typed command surface lives outside this crate; what lives
//! here is the vocabulary the core needs to route, encode, and classify
//! commands.

pub mod message;
pub mod processors;

pub use message::{Message, MessageFlags, MessageShared, MessageState, MessageTicket};
pub use processors::{Processed, ResultProcessor, TypedReply};

use bytes::Bytes;

/// Largest key the server accepts.
pub const MAX_KEY_LEN: usize = 512 * 1024 * 1024;

/// An opaque key.
///
/// Route equivalence is decided by the hash tag: the bytes between the first
/// `{` and the first following `}` when that span is non-empty, otherwise the
/// whole key. Absence of a key is expressed as `Option<RedisKey>`, distinct
/// from an empty key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedisKey(Bytes);

impl RedisKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Byte length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is the empty byte string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the key fits the server's length limit.
    pub fn is_valid(&self) -> bool {
        self.0.len() <= MAX_KEY_LEN
    }

    /// The byte span that decides routing: the first non-empty `{...}` tag,
    /// or the whole key when no such tag exists. `{}` is ignored.
    pub fn routing_tag(&self) -> &[u8] {
        let key = self.as_bytes();
        if let Some(open) = key.iter().position(|&b| b == b'{') {
            if let Some(close_rel) = key[open + 1..].iter().position(|&b| b == b'}') {
                if close_rel > 0 {
                    return &key[open + 1..open + 1 + close_rel];
                }
            }
        }
        key
    }

    /// Clone of the underlying shared bytes.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl From<&str> for RedisKey {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for RedisKey {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&[u8]> for RedisKey {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for RedisKey {
    fn from(b: Vec<u8>) -> Self {
        Self(Bytes::from(b))
    }
}

impl From<Bytes> for RedisKey {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl std::fmt::Display for RedisKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// An outbound argument value.
///
/// Integers render in shortest decimal form and round-trip bitwise; byte
/// sequences are 8-bit clean. `Literal` covers the short ASCII tokens
/// (`EX`, `NX`, `MATCH`) that never need allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RedisValue {
    /// Absent value; renders as an empty bulk.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// IEEE-754 double, rendered shortest (`inf`, `-inf`, `nan` included).
    Double(f64),
    /// Boolean, rendered as `1`/`0`.
    Boolean(bool),
    /// Static ASCII token.
    Literal(&'static str),
    /// Owned byte sequence.
    Bytes(Bytes),
}

impl RedisValue {
    /// Render to wire bytes.
    pub fn to_arg(&self) -> Bytes {
        match self {
            Self::Null => Bytes::new(),
            Self::Integer(n) => Bytes::from(n.to_string()),
            Self::Double(d) => Bytes::from(render_double(*d)),
            Self::Boolean(b) => Bytes::from_static(if *b { b"1" } else { b"0" }),
            Self::Literal(s) => Bytes::from_static(s.as_bytes()),
            Self::Bytes(b) => b.clone(),
        }
    }
}

impl From<i64> for RedisValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for RedisValue {
    fn from(d: f64) -> Self {
        Self::Double(d)
    }
}

impl From<bool> for RedisValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<&'static str> for RedisValue {
    fn from(s: &'static str) -> Self {
        Self::Literal(s)
    }
}

impl From<Bytes> for RedisValue {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for RedisValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<String> for RedisValue {
    fn from(s: String) -> Self {
        Self::Bytes(Bytes::from(s))
    }
}

fn render_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d == f64::INFINITY {
        "inf".to_string()
    } else if d == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{}", d)
    }
}

/// Identity of a known command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CommandId {
    // connection / handshake
    Ping,
    Hello,
    Auth,
    Select,
    ClientSetName,
    ClientSetInfo,
    ClientInfo,
    Info,
    // cluster
    ClusterNodes,
    Asking,
    // transactions
    Watch,
    Unwatch,
    Multi,
    Exec,
    Discard,
    // pub/sub
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    SSubscribe,
    SUnsubscribe,
    Publish,
    SPublish,
    // strings / keys
    Get,
    Set,
    Del,
    Exists,
    Incr,
    IncrBy,
    Decr,
    Strlen,
    // hashes
    HGet,
    HSet,
    HExists,
    HLen,
    HGetAll,
    // lists
    LIndex,
    LLen,
    LPush,
    RPush,
    // sorted sets
    ZAdd,
    ZScore,
    ZCard,
    ZCount,
    ZRangeByLex,
    ZRangeWithScores,
    // geo
    GeoPos,
    // streams
    XAdd,
    XRange,
    // scripting
    Eval,
    EvalSha,
    ScriptLoad,
    // sentinel
    Sentinel,
    /// A command this client has no table entry for.
    Raw,
}

/// Client-side dispatch hints for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHints {
    /// Minimum argument count, command words excluded.
    pub min_args: usize,
    /// Maximum argument count, when bounded.
    pub max_args: Option<usize>,
    /// Mutates server state.
    pub writes: bool,
    /// Requires `allowAdmin`.
    pub admin: bool,
    /// May be served by a replica.
    pub replica_ok: bool,
    /// Alters the connection's pub/sub state.
    pub pubsub_state: bool,
    /// Terminates a `MULTI` block.
    pub ends_transaction: bool,
}

impl CommandHints {
    const fn new(min_args: usize, max_args: Option<usize>) -> Self {
        Self {
            min_args,
            max_args,
            writes: false,
            admin: false,
            replica_ok: false,
            pubsub_state: false,
            ends_transaction: false,
        }
    }

    const fn writes(mut self) -> Self {
        self.writes = true;
        self
    }

    const fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    const fn replica_ok(mut self) -> Self {
        self.replica_ok = true;
        self
    }

    const fn pubsub(mut self) -> Self {
        self.pubsub_state = true;
        self
    }

    const fn ends_transaction(mut self) -> Self {
        self.ends_transaction = true;
        self
    }
}

impl CommandId {
    /// The command words as sent on the wire.
    pub fn wire_words(&self) -> &'static [&'static str] {
        match self {
            Self::Ping => &["PING"],
            Self::Hello => &["HELLO"],
            Self::Auth => &["AUTH"],
            Self::Select => &["SELECT"],
            Self::ClientSetName => &["CLIENT", "SETNAME"],
            Self::ClientSetInfo => &["CLIENT", "SETINFO"],
            Self::ClientInfo => &["CLIENT", "INFO"],
            Self::Info => &["INFO"],
            Self::ClusterNodes => &["CLUSTER", "NODES"],
            Self::Asking => &["ASKING"],
            Self::Watch => &["WATCH"],
            Self::Unwatch => &["UNWATCH"],
            Self::Multi => &["MULTI"],
            Self::Exec => &["EXEC"],
            Self::Discard => &["DISCARD"],
            Self::Subscribe => &["SUBSCRIBE"],
            Self::Unsubscribe => &["UNSUBSCRIBE"],
            Self::PSubscribe => &["PSUBSCRIBE"],
            Self::PUnsubscribe => &["PUNSUBSCRIBE"],
            Self::SSubscribe => &["SSUBSCRIBE"],
            Self::SUnsubscribe => &["SUNSUBSCRIBE"],
            Self::Publish => &["PUBLISH"],
            Self::SPublish => &["SPUBLISH"],
            Self::Get => &["GET"],
            Self::Set => &["SET"],
            Self::Del => &["DEL"],
            Self::Exists => &["EXISTS"],
            Self::Incr => &["INCR"],
            Self::IncrBy => &["INCRBY"],
            Self::Decr => &["DECR"],
            Self::Strlen => &["STRLEN"],
            Self::HGet => &["HGET"],
            Self::HSet => &["HSET"],
            Self::HExists => &["HEXISTS"],
            Self::HLen => &["HLEN"],
            Self::HGetAll => &["HGETALL"],
            Self::LIndex => &["LINDEX"],
            Self::LLen => &["LLEN"],
            Self::LPush => &["LPUSH"],
            Self::RPush => &["RPUSH"],
            Self::ZAdd => &["ZADD"],
            Self::ZScore => &["ZSCORE"],
            Self::ZCard => &["ZCARD"],
            Self::ZCount => &["ZCOUNT"],
            Self::ZRangeByLex => &["ZRANGEBYLEX"],
            Self::ZRangeWithScores => &["ZRANGE"],
            Self::GeoPos => &["GEOPOS"],
            Self::XAdd => &["XADD"],
            Self::XRange => &["XRANGE"],
            Self::Eval => &["EVAL"],
            Self::EvalSha => &["EVALSHA"],
            Self::ScriptLoad => &["SCRIPT", "LOAD"],
            Self::Sentinel => &["SENTINEL"],
            Self::Raw => &[],
        }
    }

    /// Primary command word, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.wire_words().first().copied().unwrap_or("RAW")
    }

    /// Dispatch hints. Unknown commands default to writes, primary-only,
    /// non-admin.
    pub fn hints(&self) -> CommandHints {
        match self {
            Self::Ping => CommandHints::new(0, Some(1)).replica_ok(),
            Self::Hello => CommandHints::new(0, Some(6)).replica_ok(),
            Self::Auth => CommandHints::new(1, Some(2)).replica_ok(),
            Self::Select => CommandHints::new(1, Some(1)).replica_ok(),
            Self::ClientSetName => CommandHints::new(1, Some(1)).replica_ok(),
            Self::ClientSetInfo => CommandHints::new(2, Some(2)).replica_ok(),
            Self::ClientInfo => CommandHints::new(0, Some(0)).replica_ok(),
            Self::Info => CommandHints::new(0, Some(1)).replica_ok(),
            Self::ClusterNodes => CommandHints::new(0, Some(0)).replica_ok(),
            Self::Asking => CommandHints::new(0, Some(0)),
            Self::Watch => CommandHints::new(1, None),
            Self::Unwatch => CommandHints::new(0, Some(0)),
            Self::Multi => CommandHints::new(0, Some(0)),
            Self::Exec => CommandHints::new(0, Some(0)).ends_transaction(),
            Self::Discard => CommandHints::new(0, Some(0)).ends_transaction(),
            Self::Subscribe | Self::PSubscribe | Self::SSubscribe => {
                CommandHints::new(1, None).replica_ok().pubsub()
            }
            Self::Unsubscribe | Self::PUnsubscribe | Self::SUnsubscribe => {
                CommandHints::new(0, None).replica_ok().pubsub()
            }
            Self::Publish | Self::SPublish => CommandHints::new(2, Some(2)).writes(),
            Self::Get => CommandHints::new(1, Some(1)).replica_ok(),
            Self::Set => CommandHints::new(2, None).writes(),
            Self::Del => CommandHints::new(1, None).writes(),
            Self::Exists => CommandHints::new(1, None).replica_ok(),
            Self::Incr | Self::Decr => CommandHints::new(1, Some(1)).writes(),
            Self::IncrBy => CommandHints::new(2, Some(2)).writes(),
            Self::Strlen => CommandHints::new(1, Some(1)).replica_ok(),
            Self::HGet => CommandHints::new(2, Some(2)).replica_ok(),
            Self::HSet => CommandHints::new(3, None).writes(),
            Self::HExists => CommandHints::new(2, Some(2)).replica_ok(),
            Self::HLen => CommandHints::new(1, Some(1)).replica_ok(),
            Self::HGetAll => CommandHints::new(1, Some(1)).replica_ok(),
            Self::LIndex => CommandHints::new(2, Some(2)).replica_ok(),
            Self::LLen => CommandHints::new(1, Some(1)).replica_ok(),
            Self::LPush | Self::RPush => CommandHints::new(2, None).writes(),
            Self::ZAdd => CommandHints::new(3, None).writes(),
            Self::ZScore => CommandHints::new(2, Some(2)).replica_ok(),
            Self::ZCard => CommandHints::new(1, Some(1)).replica_ok(),
            Self::ZCount => CommandHints::new(3, Some(3)).replica_ok(),
            Self::ZRangeByLex => CommandHints::new(3, None).replica_ok(),
            Self::ZRangeWithScores => CommandHints::new(3, None).replica_ok(),
            Self::GeoPos => CommandHints::new(1, None).replica_ok(),
            Self::XAdd => CommandHints::new(4, None).writes(),
            Self::XRange => CommandHints::new(3, Some(4)).replica_ok(),
            Self::Eval | Self::EvalSha => CommandHints::new(2, None).writes(),
            Self::ScriptLoad => CommandHints::new(1, Some(1)).writes(),
            Self::Sentinel => CommandHints::new(1, None).admin().replica_ok(),
            Self::Raw => CommandHints::new(0, None).writes(),
        }
    }
}
