//! RESP wire protocol.
//!
//! This module implements the client side of the Redis Serialization
//! Protocol: a streaming decoder for RESP2 and RESP3 reply frames and an
//! encoder for outbound command frames.
//!
//! # Protocol versions
//!
//! - **RESP2**: default framing, arrays for all aggregates
//! - **RESP3**: negotiated via `HELLO 3`; adds maps, sets, push frames,
//!   doubles, booleans, big numbers, verbatim strings, and attributes
//!
//! When RESP2 is negotiated, a RESP3-only tag on the wire is a hard decode
//! error; in RESP3 mode, RESP2 frames remain accepted.

pub mod buffer;
pub mod decode;
pub mod encode;
pub mod frame;

pub use buffer::{ReadBuffer, Token, Tokenizer};
pub use decode::{AttributeHook, DecodeError, FrameDecoder};
pub use encode::encode_command;
pub use frame::RawFrame;

/// Maximum nesting depth for aggregate frames.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum bulk payload size (the server's 512MB limit).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum declared elements in one aggregate frame.
pub const MAX_ELEMENTS: usize = 1_000_000;

/// Negotiated RESP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RespVersion {
    /// RESP2 (all servers).
    #[default]
    Resp2,
    /// RESP3 (servers 6.0+ after `HELLO 3`).
    Resp3,
}

impl std::fmt::Display for RespVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RespVersion::Resp2 => write!(f, "2"),
            RespVersion::Resp3 => write!(f, "3"),
        }
    }
}

/// RESP frame tag bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Simple string (`+`)
    Simple,
    /// Error (`-`)
    Error,
    /// Integer (`:`)
    Integer,
    /// Bulk string (`$`)
    Bulk,
    /// Array (`*`)
    Array,
    /// Null (`_`) - RESP3
    Null,
    /// Boolean (`#`) - RESP3
    Boolean,
    /// Double (`,`) - RESP3
    Double,
    /// Big number (`(`) - RESP3
    BigNumber,
    /// Bulk error (`!`) - RESP3
    BulkError,
    /// Verbatim string (`=`) - RESP3
    Verbatim,
    /// Map (`%`) - RESP3
    Map,
    /// Set (`~`) - RESP3
    Set,
    /// Attribute (`|`) - RESP3
    Attribute,
    /// Push (`>`) - RESP3
    Push,
}

impl FrameKind {
    /// Decode a tag byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'+' => Some(Self::Simple),
            b'-' => Some(Self::Error),
            b':' => Some(Self::Integer),
            b'$' => Some(Self::Bulk),
            b'*' => Some(Self::Array),
            b'_' => Some(Self::Null),
            b'#' => Some(Self::Boolean),
            b',' => Some(Self::Double),
            b'(' => Some(Self::BigNumber),
            b'!' => Some(Self::BulkError),
            b'=' => Some(Self::Verbatim),
            b'%' => Some(Self::Map),
            b'~' => Some(Self::Set),
            b'|' => Some(Self::Attribute),
            b'>' => Some(Self::Push),
            _ => None,
        }
    }

    /// The tag byte for this kind.
    pub fn prefix(&self) -> u8 {
        match self {
            Self::Simple => b'+',
            Self::Error => b'-',
            Self::Integer => b':',
            Self::Bulk => b'$',
            Self::Array => b'*',
            Self::Null => b'_',
            Self::Boolean => b'#',
            Self::Double => b',',
            Self::BigNumber => b'(',
            Self::BulkError => b'!',
            Self::Verbatim => b'=',
            Self::Map => b'%',
            Self::Set => b'~',
            Self::Attribute => b'|',
            Self::Push => b'>',
        }
    }

    /// Whether this tag only exists in RESP3.
    pub fn is_resp3_only(&self) -> bool {
        matches!(
            self,
            Self::Null
                | Self::Boolean
                | Self::Double
                | Self::BigNumber
                | Self::BulkError
                | Self::Verbatim
                | Self::Map
                | Self::Set
                | Self::Attribute
                | Self::Push
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_round_trip() {
        for b in [
            b'+', b'-', b':', b'$', b'*', b'_', b'#', b',', b'(', b'!', b'=', b'%', b'~', b'|',
            b'>',
        ] {
            let kind = FrameKind::from_byte(b).unwrap();
            assert_eq!(kind.prefix(), b);
        }
        assert_eq!(FrameKind::from_byte(b'x'), None);
    }

    #[test]
    fn resp3_only_tags() {
        assert!(!FrameKind::Simple.is_resp3_only());
        assert!(!FrameKind::Array.is_resp3_only());
        assert!(FrameKind::Map.is_resp3_only());
        assert!(FrameKind::Push.is_resp3_only());
        assert!(FrameKind::Attribute.is_resp3_only());
    }

    #[test]
    fn version_display() {
        assert_eq!(RespVersion::Resp2.to_string(), "2");
        assert_eq!(RespVersion::Resp3.to_string(), "3");
    }
}
