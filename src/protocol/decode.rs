//! Streaming RESP frame decoder.
//!
//! The decoder owns a [`ReadBuffer`]; socket bytes are appended with
//! [`FrameDecoder::feed`] and complete frames drained with
//! [`FrameDecoder::next_frame`]. Buffer position only advances when a whole
//! frame has been parsed, so decoding is insensitive to how the byte stream
//! is split across reads.

use super::buffer::{ReadBuffer, Token, TokenError, Tokenizer};
use super::frame::RawFrame;
use super::{FrameKind, RespVersion, MAX_BULK_SIZE, MAX_ELEMENTS, MAX_NESTING_DEPTH};
use bytes::Bytes;
use std::sync::Arc;

/// Handler invoked for each RESP3 attribute frame, at any nesting depth.
pub type AttributeHook = Arc<dyn Fn(&RawFrame) + Send + Sync>;

/// A framing violation. Fatal to the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Absolute offset into the connection's inbound byte stream.
    pub offset: u64,
    /// The token class the decoder was expecting.
    pub expected: &'static str,
    /// Description of the violation.
    pub message: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "at byte {}: expected {}: {}",
            self.offset, self.expected, self.message
        )
    }
}

impl std::error::Error for DecodeError {}

/// Streaming decoder for one connection's reply stream.
pub struct FrameDecoder {
    version: RespVersion,
    buffer: ReadBuffer,
    attribute_hook: Option<AttributeHook>,
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("version", &self.version)
            .field("buffered", &self.buffer.len())
            .field("attribute_hook", &self.attribute_hook.is_some())
            .finish()
    }
}

impl FrameDecoder {
    /// Create a decoder for the given protocol version.
    pub fn new(version: RespVersion) -> Self {
        Self {
            version,
            buffer: ReadBuffer::default(),
            attribute_hook: None,
        }
    }

    /// Attach an attribute handler.
    pub fn with_attribute_hook(mut self, hook: AttributeHook) -> Self {
        self.attribute_hook = Some(hook);
        self
    }

    /// Switch protocol version (after `HELLO` negotiation).
    pub fn set_version(&mut self, version: RespVersion) {
        self.version = version;
    }

    /// The protocol version currently decoded.
    pub fn version(&self) -> RespVersion {
        self.version
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append inbound socket bytes.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        self.buffer.extend(data).map_err(|message| DecodeError {
            offset: self.buffer.stream_offset() + self.buffer.len() as u64,
            expected: "buffer capacity",
            message,
        })
    }

    /// Decode the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, DecodeError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut tokenizer = Tokenizer::new(self.buffer.data());
        match self.parse_value(&mut tokenizer, 0) {
            Ok(Token::Complete(frame)) => {
                let consumed = tokenizer.position();
                self.buffer.consume(consumed);
                Ok(Some(frame))
            }
            Ok(Token::Incomplete) => Ok(None),
            Err(err) => Err(DecodeError {
                offset: self.buffer.stream_offset() + tokenizer.position() as u64 + err.offset as u64,
                expected: err.expected,
                message: err.message,
            }),
        }
    }

    fn parse_value(
        &self,
        t: &mut Tokenizer<'_>,
        depth: usize,
    ) -> Result<Token<RawFrame>, TokenError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(TokenError {
                offset: 0,
                expected: "frame",
                message: format!("nesting depth exceeds {}", MAX_NESTING_DEPTH),
            });
        }
        let Some(tag) = t.peek() else {
            return Ok(Token::Incomplete);
        };
        let kind = FrameKind::from_byte(tag).ok_or_else(|| TokenError {
            offset: 0,
            expected: "frame tag",
            message: format!("unknown tag byte 0x{:02x}", tag),
        })?;
        if self.version == RespVersion::Resp2 && kind.is_resp3_only() {
            return Err(TokenError {
                offset: 0,
                expected: "RESP2 frame tag",
                message: format!("RESP3 tag '{}' while RESP2 is negotiated", tag as char),
            });
        }
        t.take_byte();

        match kind {
            FrameKind::Simple => Ok(t
                .line()?
                .map(|line| RawFrame::Simple(String::from_utf8_lossy(line).into_owned()))),
            FrameKind::Error => Ok(t
                .line()?
                .map(|line| RawFrame::Error(String::from_utf8_lossy(line).into_owned()))),
            FrameKind::Integer => Ok(t.integer_line()?.map(RawFrame::Integer)),
            FrameKind::Bulk => self.parse_bulk(t, false),
            FrameKind::BulkError => self.parse_bulk(t, true),
            FrameKind::Verbatim => self.parse_verbatim(t),
            FrameKind::Null => match t.line()? {
                Token::Incomplete => Ok(Token::Incomplete),
                Token::Complete(line) if line.is_empty() => Ok(Token::Complete(RawFrame::Null)),
                Token::Complete(_) => Err(TokenError {
                    offset: 0,
                    expected: "null",
                    message: "null frame with payload".to_string(),
                }),
            },
            FrameKind::Boolean => match t.line()? {
                Token::Incomplete => Ok(Token::Incomplete),
                Token::Complete(b"t") => Ok(Token::Complete(RawFrame::Boolean(true))),
                Token::Complete(b"f") => Ok(Token::Complete(RawFrame::Boolean(false))),
                Token::Complete(other) => Err(TokenError {
                    offset: 0,
                    expected: "boolean",
                    message: format!("'{}' is not t or f", String::from_utf8_lossy(other)),
                }),
            },
            FrameKind::Double => Ok(t.double_line()?.map(RawFrame::Double)),
            FrameKind::BigNumber => match t.line()? {
                Token::Incomplete => Ok(Token::Incomplete),
                Token::Complete(line) => {
                    let valid = !line.is_empty()
                        && line
                            .iter()
                            .enumerate()
                            .all(|(i, &b)| b.is_ascii_digit() || (i == 0 && (b == b'-' || b == b'+')))
                        && line.iter().any(|b| b.is_ascii_digit());
                    if !valid {
                        return Err(TokenError {
                            offset: 0,
                            expected: "big number",
                            message: "non-decimal big number payload".to_string(),
                        });
                    }
                    Ok(Token::Complete(RawFrame::BigNumber(
                        String::from_utf8_lossy(line).into_owned(),
                    )))
                }
            },
            FrameKind::Array => self.parse_aggregate(t, depth, FrameKind::Array),
            FrameKind::Set => self.parse_aggregate(t, depth, FrameKind::Set),
            FrameKind::Push => self.parse_aggregate(t, depth, FrameKind::Push),
            FrameKind::Map => self.parse_map(t, depth).map(|tok| tok.map(RawFrame::Map)),
            FrameKind::Attribute => self.parse_attribute(t, depth),
        }
    }

    fn parse_bulk(&self, t: &mut Tokenizer<'_>, is_error: bool) -> Result<Token<RawFrame>, TokenError> {
        let len = match t.integer_line()? {
            Token::Incomplete => return Ok(Token::Incomplete),
            Token::Complete(len) => len,
        };
        if len == -1 {
            return Ok(Token::Complete(RawFrame::Null));
        }
        if len < 0 || len as usize > MAX_BULK_SIZE {
            return Err(TokenError {
                offset: 0,
                expected: "bulk length",
                message: format!("bulk length {} out of range", len),
            });
        }
        Ok(t.exact(len as usize)?.map(|payload| {
            if is_error {
                RawFrame::Error(String::from_utf8_lossy(payload).into_owned())
            } else {
                RawFrame::Bulk(Bytes::copy_from_slice(payload))
            }
        }))
    }

    fn parse_verbatim(&self, t: &mut Tokenizer<'_>) -> Result<Token<RawFrame>, TokenError> {
        let len = match t.integer_line()? {
            Token::Incomplete => return Ok(Token::Incomplete),
            Token::Complete(len) => len,
        };
        if !(4..=MAX_BULK_SIZE as i64).contains(&len) {
            return Err(TokenError {
                offset: 0,
                expected: "verbatim length",
                message: format!("verbatim length {} out of range", len),
            });
        }
        match t.exact(len as usize)? {
            Token::Incomplete => Ok(Token::Incomplete),
            Token::Complete(payload) => {
                if payload[3] != b':' {
                    return Err(TokenError {
                        offset: 3,
                        expected: "verbatim format",
                        message: "missing ':' after format tag".to_string(),
                    });
                }
                Ok(Token::Complete(RawFrame::Verbatim {
                    format: String::from_utf8_lossy(&payload[..3]).into_owned(),
                    data: Bytes::copy_from_slice(&payload[4..]),
                }))
            }
        }
    }

    fn parse_aggregate(
        &self,
        t: &mut Tokenizer<'_>,
        depth: usize,
        kind: FrameKind,
    ) -> Result<Token<RawFrame>, TokenError> {
        let len = match t.integer_line()? {
            Token::Incomplete => return Ok(Token::Incomplete),
            Token::Complete(len) => len,
        };
        if len == -1 {
            return Ok(Token::Complete(RawFrame::Null));
        }
        if len < 0 || len as usize > MAX_ELEMENTS {
            return Err(TokenError {
                offset: 0,
                expected: "aggregate length",
                message: format!("aggregate length {} out of range", len),
            });
        }
        let mut items = Vec::with_capacity((len as usize).min(1024));
        for _ in 0..len {
            match self.parse_value(t, depth + 1)? {
                Token::Incomplete => return Ok(Token::Incomplete),
                Token::Complete(item) => items.push(item),
            }
        }
        let frame = match kind {
            FrameKind::Array => RawFrame::Array(items),
            FrameKind::Set => RawFrame::Set(items),
            FrameKind::Push => RawFrame::Push(items),
            _ => unreachable!("parse_aggregate called for {:?}", kind),
        };
        Ok(Token::Complete(frame))
    }

    fn parse_map(
        &self,
        t: &mut Tokenizer<'_>,
        depth: usize,
    ) -> Result<Token<Vec<(RawFrame, RawFrame)>>, TokenError> {
        let len = match t.integer_line()? {
            Token::Incomplete => return Ok(Token::Incomplete),
            Token::Complete(len) => len,
        };
        if len < 0 || len as usize > MAX_ELEMENTS / 2 {
            return Err(TokenError {
                offset: 0,
                expected: "map length",
                message: format!("map length {} out of range", len),
            });
        }
        let mut pairs = Vec::with_capacity((len as usize).min(512));
        for _ in 0..len {
            let key = match self.parse_value(t, depth + 1)? {
                Token::Incomplete => return Ok(Token::Incomplete),
                Token::Complete(key) => key,
            };
            let value = match self.parse_value(t, depth + 1)? {
                Token::Incomplete => return Ok(Token::Incomplete),
                Token::Complete(value) => value,
            };
            pairs.push((key, value));
        }
        Ok(Token::Complete(pairs))
    }

    /// An attribute precedes the value it annotates and does not occupy a
    /// slot in the parent aggregate; the annotated value is returned.
    fn parse_attribute(
        &self,
        t: &mut Tokenizer<'_>,
        depth: usize,
    ) -> Result<Token<RawFrame>, TokenError> {
        let pairs = match self.parse_map(t, depth)? {
            Token::Incomplete => return Ok(Token::Incomplete),
            Token::Complete(pairs) => pairs,
        };
        match &self.attribute_hook {
            Some(hook) => hook(&RawFrame::Map(pairs)),
            None => tracing::debug!(entries = pairs.len(), "attribute frame discarded"),
        }
        self.parse_value(t, depth)
    }
}
