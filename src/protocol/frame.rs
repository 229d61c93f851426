//! Decoded reply frames.

use bytes::Bytes;

/// A decoded RESP frame, as it appeared on the wire.
///
/// `$-1` and `*-1` (RESP2 nulls) and `_` (RESP3 null) all decode to
/// [`RawFrame::Null`]; a zero-length bulk and a zero-element array are
/// distinct non-null values.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    /// Null in any of its wire spellings.
    Null,

    /// Simple string (`+OK\r\n`).
    Simple(String),

    /// Error reply (`-ERR message\r\n`), the line without the `-`.
    Error(String),

    /// Integer (`:1000\r\n`).
    Integer(i64),

    /// Bulk string payload (`$6\r\nfoobar\r\n`).
    Bulk(Bytes),

    /// Array (`*2\r\n...`).
    Array(Vec<RawFrame>),

    /// Map (`%2\r\n...`) - RESP3.
    Map(Vec<(RawFrame, RawFrame)>),

    /// Set (`~3\r\n...`) - RESP3.
    Set(Vec<RawFrame>),

    /// Out-of-band push (`>3\r\n...`) - RESP3.
    Push(Vec<RawFrame>),

    /// Double (`,1.23\r\n`) - RESP3.
    Double(f64),

    /// Boolean (`#t\r\n`) - RESP3.
    Boolean(bool),

    /// Big number as its decimal text (`(3492...\r\n`) - RESP3.
    BigNumber(String),

    /// Verbatim string (`=15\r\ntxt:Some text\r\n`) - RESP3.
    Verbatim {
        /// Three-byte format tag (`txt`, `mkd`).
        format: String,
        /// The payload after the `:`.
        data: Bytes,
    },
}

impl RawFrame {
    /// Whether this frame is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Short name of the frame's wire shape, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Simple(_) => "simple-string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::Bulk(_) => "bulk-string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Push(_) => "push",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::BigNumber(_) => "big-number",
            Self::Verbatim { .. } => "verbatim-string",
        }
    }

    /// The textual content of a simple or bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Simple(s) => Some(s),
            Self::Bulk(b) => std::str::from_utf8(b).ok(),
            Self::Verbatim { data, .. } => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// The byte content of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Simple(s) => Some(s.as_bytes()),
            Self::Bulk(b) => Some(b),
            Self::Verbatim { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Integer content, parsing string shapes when unambiguous.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Boolean(b) => Some(i64::from(*b)),
            Self::Simple(s) | Self::BigNumber(s) => s.parse().ok(),
            Self::Bulk(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Double content, parsing string shapes when unambiguous.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Integer(n) => Some(*n as f64),
            Self::Bulk(b) => {
                let s = std::str::from_utf8(b).ok()?;
                match s {
                    "inf" | "+inf" => Some(f64::INFINITY),
                    "-inf" => Some(f64::NEG_INFINITY),
                    "nan" => Some(f64::NAN),
                    other => other.parse().ok(),
                }
            }
            _ => None,
        }
    }

    /// Aggregate elements for array, set, or push frames.
    pub fn as_items(&self) -> Option<&[RawFrame]> {
        match self {
            Self::Array(items) | Self::Set(items) | Self::Push(items) => Some(items),
            _ => None,
        }
    }

    /// Consume into aggregate elements.
    pub fn into_items(self) -> Option<Vec<RawFrame>> {
        match self {
            Self::Array(items) | Self::Set(items) | Self::Push(items) => Some(items),
            _ => None,
        }
    }

    /// Key/value pairs, from a RESP3 map or a flat even-length array.
    pub fn into_pairs(self) -> Option<Vec<(RawFrame, RawFrame)>> {
        match self {
            Self::Map(pairs) => Some(pairs),
            Self::Array(items) if items.len() % 2 == 0 => {
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Some(pairs)
            }
            _ => None,
        }
    }

    /// Whether this frame is an out-of-band pub/sub delivery.
    ///
    /// RESP3 pushes are out-of-band by construction; in RESP2 the
    /// subscription connection carries deliveries as plain arrays whose
    /// first element names the event.
    pub fn pubsub_event(&self) -> Option<&str> {
        let items = self.as_items()?;
        let event = items.first()?.as_str()?;
        match event {
            "message" | "pmessage" | "smessage" | "subscribe" | "unsubscribe" | "psubscribe"
            | "punsubscribe" | "ssubscribe" | "sunsubscribe" => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_empty_are_distinct() {
        assert!(RawFrame::Null.is_null());
        assert!(!RawFrame::Bulk(Bytes::new()).is_null());
        assert!(!RawFrame::Array(Vec::new()).is_null());
        assert_ne!(RawFrame::Null, RawFrame::Bulk(Bytes::new()));
        assert_ne!(RawFrame::Null, RawFrame::Array(Vec::new()));
    }

    #[test]
    fn accessors() {
        assert_eq!(RawFrame::Simple("OK".into()).as_str(), Some("OK"));
        assert_eq!(RawFrame::Bulk(Bytes::from_static(b"42")).as_int(), Some(42));
        assert_eq!(RawFrame::Integer(7).as_double(), Some(7.0));
        assert_eq!(RawFrame::Boolean(true).as_int(), Some(1));
    }

    #[test]
    fn pairs_from_flat_array() {
        let frame = RawFrame::Array(vec![
            RawFrame::Bulk(Bytes::from_static(b"a")),
            RawFrame::Integer(1),
            RawFrame::Bulk(Bytes::from_static(b"b")),
            RawFrame::Integer(2),
        ]);
        let pairs = frame.into_pairs().unwrap();
        assert_eq!(pairs.len(), 2);

        let odd = RawFrame::Array(vec![RawFrame::Integer(1)]);
        assert!(odd.into_pairs().is_none());
    }

    #[test]
    fn pubsub_event_detection() {
        let delivery = RawFrame::Push(vec![
            RawFrame::Bulk(Bytes::from_static(b"message")),
            RawFrame::Bulk(Bytes::from_static(b"chan")),
            RawFrame::Bulk(Bytes::from_static(b"hi")),
        ]);
        assert_eq!(delivery.pubsub_event(), Some("message"));

        let reply = RawFrame::Array(vec![RawFrame::Bulk(Bytes::from_static(b"value"))]);
        assert_eq!(reply.pubsub_event(), None);
    }
}
