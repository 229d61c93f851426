//! Byte buffer and token layer.
//!
//! [`ReadBuffer`] accumulates inbound socket bytes: append-only at the write
//! head, consumed from the front once whole frames have been decoded.
//! [`Tokenizer`] is a non-destructive cursor over the buffered bytes exposing
//! the RESP token primitives: a partial token leaves the cursor where it
//! started and reports [`Token::Incomplete`]; a complete token advances the
//! cursor exactly past its trailing CRLF.

use bytes::BytesMut;

/// Outcome of a token-level parse step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<T> {
    /// A complete token; the cursor has advanced past it.
    Complete(T),
    /// The buffer ends mid-token; the cursor is unchanged.
    Incomplete,
}

impl<T> Token<T> {
    /// Map the complete value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Token<U> {
        match self {
            Self::Complete(v) => Token::Complete(f(v)),
            Self::Incomplete => Token::Incomplete,
        }
    }
}

/// A malformed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenError {
    /// Offset from the cursor start position where the violation sits.
    pub offset: usize,
    /// The token class that was being parsed.
    pub expected: &'static str,
    /// Description of the violation.
    pub message: String,
}

impl TokenError {
    fn new(offset: usize, expected: &'static str, message: impl Into<String>) -> Self {
        Self {
            offset,
            expected,
            message: message.into(),
        }
    }
}

/// Result alias for token parsing.
pub type TokenResult<T> = Result<Token<T>, TokenError>;

/// Non-destructive parsing cursor over buffered bytes.
#[derive(Debug)]
pub struct Tokenizer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    /// Create a cursor at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Rewind to an earlier position.
    pub fn rewind(&mut self, pos: usize) {
        debug_assert!(pos <= self.pos);
        self.pos = pos;
    }

    /// Look at the next byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Consume and return the next byte.
    pub fn take_byte(&mut self) -> Token<u8> {
        match self.buf.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Token::Complete(b)
            }
            None => Token::Incomplete,
        }
    }

    /// Consume a line terminated by CRLF, returning the bytes before it.
    pub fn line(&mut self) -> TokenResult<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        match find_crlf(rest) {
            Some(at) => {
                let line = &rest[..at];
                if let Some(lone) = line.iter().position(|&b| b == b'\n') {
                    return Err(TokenError::new(lone, "line", "bare LF inside line"));
                }
                self.pos += at + 2;
                Ok(Token::Complete(line))
            }
            None => Ok(Token::Incomplete),
        }
    }

    /// Consume a signed decimal integer line.
    pub fn integer_line(&mut self) -> TokenResult<i64> {
        let start = self.pos;
        match self.line()? {
            Token::Incomplete => Ok(Token::Incomplete),
            Token::Complete(line) => match parse_decimal(line) {
                Some(n) => Ok(Token::Complete(n)),
                None => {
                    self.pos = start;
                    Err(TokenError::new(
                        0,
                        "integer",
                        format!("'{}' is not a decimal integer", String::from_utf8_lossy(line)),
                    ))
                }
            },
        }
    }

    /// Consume a double line, accepting `inf`, `-inf`, `+inf`, and `nan`.
    pub fn double_line(&mut self) -> TokenResult<f64> {
        let start = self.pos;
        match self.line()? {
            Token::Incomplete => Ok(Token::Incomplete),
            Token::Complete(line) => {
                let text = std::str::from_utf8(line).map_err(|_| {
                    TokenError::new(0, "double", "non-UTF8 double literal")
                })?;
                let value = match text {
                    "inf" | "+inf" => f64::INFINITY,
                    "-inf" => f64::NEG_INFINITY,
                    "nan" | "-nan" => f64::NAN,
                    other => match other.parse::<f64>() {
                        Ok(d) => d,
                        Err(_) => {
                            self.pos = start;
                            return Err(TokenError::new(
                                0,
                                "double",
                                format!("'{}' is not a double", other),
                            ));
                        }
                    },
                };
                Ok(Token::Complete(value))
            }
        }
    }

    /// Consume exactly `n` payload bytes followed by CRLF.
    pub fn exact(&mut self, n: usize) -> TokenResult<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        if rest.len() < n + 2 {
            return Ok(Token::Incomplete);
        }
        if &rest[n..n + 2] != b"\r\n" {
            return Err(TokenError::new(
                n,
                "CRLF",
                "payload not terminated by CRLF",
            ));
        }
        let payload = &rest[..n];
        self.pos += n + 2;
        Ok(Token::Complete(payload))
    }
}

/// Find the first CRLF in `data`.
fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Parse an optionally-negative decimal integer; no leading `+`, no blanks.
fn parse_decimal(line: &[u8]) -> Option<i64> {
    if line.is_empty() {
        return None;
    }
    let (neg, digits) = match line[0] {
        b'-' => (true, &line[1..]),
        _ => (false, line),
    };
    if digits.is_empty() {
        return None;
    }
    // Accumulate negative so i64::MIN parses without overflow.
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_sub(i64::from(b - b'0'))?;
    }
    if neg {
        Some(value)
    } else {
        value.checked_neg()
    }
}

/// Accumulating read buffer for streaming decode.
#[derive(Debug)]
pub struct ReadBuffer {
    buffer: BytesMut,
    max_size: usize,
    /// Total bytes consumed over the buffer's lifetime.
    consumed_total: u64,
}

impl ReadBuffer {
    /// Create a buffer with an initial capacity and a hard size cap.
    pub fn new(capacity: usize, max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_size,
            consumed_total: 0,
        }
    }

    /// Append inbound bytes. Fails when the cap would be exceeded.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), String> {
        if self.buffer.len() + data.len() > self.max_size {
            return Err(format!(
                "read buffer overflow: {} + {} > {}",
                self.buffer.len(),
                data.len(),
                self.max_size
            ));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// The buffered, not-yet-consumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Discard `count` bytes from the front (a decoded frame).
    pub fn consume(&mut self, count: usize) {
        let _ = self.buffer.split_to(count);
        self.consumed_total += count as u64;
    }

    /// Stream offset of the first unconsumed byte.
    pub fn stream_offset(&self) -> u64 {
        self.consumed_total
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        // 512MB matches the server's largest admissible bulk payload.
        Self::new(64 * 1024, 512 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_complete_and_partial() {
        let mut t = Tokenizer::new(b"OK\r\nrest");
        assert_eq!(t.line().unwrap(), Token::Complete(b"OK".as_slice()));
        assert_eq!(t.position(), 4);

        let mut t = Tokenizer::new(b"OK\r");
        assert_eq!(t.line().unwrap(), Token::Incomplete);
        assert_eq!(t.position(), 0);
    }

    #[test]
    fn integer_line_values() {
        let mut t = Tokenizer::new(b"1000\r\n");
        assert_eq!(t.integer_line().unwrap(), Token::Complete(1000));

        let mut t = Tokenizer::new(b"-1\r\n");
        assert_eq!(t.integer_line().unwrap(), Token::Complete(-1));

        let mut t = Tokenizer::new(b"12a\r\n");
        let err = t.integer_line().unwrap_err();
        assert_eq!(err.expected, "integer");
        assert_eq!(t.position(), 0);
    }

    #[test]
    fn integer_line_extremes() {
        let mut t = Tokenizer::new(b"9223372036854775807\r\n");
        assert_eq!(t.integer_line().unwrap(), Token::Complete(i64::MAX));

        let mut t = Tokenizer::new(b"-9223372036854775808\r\n");
        assert_eq!(t.integer_line().unwrap(), Token::Complete(i64::MIN));

        let mut t = Tokenizer::new(b"9223372036854775808\r\n");
        assert!(t.integer_line().is_err());
    }

    #[test]
    fn double_line_special_values() {
        let mut t = Tokenizer::new(b"1.5\r\n");
        assert_eq!(t.double_line().unwrap(), Token::Complete(1.5));

        let mut t = Tokenizer::new(b"inf\r\n");
        assert!(matches!(t.double_line().unwrap(), Token::Complete(d) if d == f64::INFINITY));

        let mut t = Tokenizer::new(b"-inf\r\n");
        assert!(matches!(t.double_line().unwrap(), Token::Complete(d) if d == f64::NEG_INFINITY));

        let mut t = Tokenizer::new(b"nan\r\n");
        assert!(matches!(t.double_line().unwrap(), Token::Complete(d) if d.is_nan()));
    }

    #[test]
    fn exact_requires_trailing_crlf() {
        let mut t = Tokenizer::new(b"foobar\r\n");
        assert_eq!(t.exact(6).unwrap(), Token::Complete(b"foobar".as_slice()));

        let mut t = Tokenizer::new(b"foobar\r");
        assert_eq!(t.exact(6).unwrap(), Token::Incomplete);

        let mut t = Tokenizer::new(b"foobarXY");
        assert!(t.exact(6).is_err());
    }

    #[test]
    fn exact_allows_embedded_crlf() {
        let mut t = Tokenizer::new(b"a\r\nb\r\n");
        assert_eq!(t.exact(4).unwrap(), Token::Complete(b"a\r\nb".as_slice()));
    }

    #[test]
    fn read_buffer_consume_tracks_offset() {
        let mut buf = ReadBuffer::new(16, 1024);
        buf.extend(b"+OK\r\n:1\r\n").unwrap();
        assert_eq!(buf.len(), 9);
        buf.consume(5);
        assert_eq!(buf.data(), b":1\r\n");
        assert_eq!(buf.stream_offset(), 5);
    }

    #[test]
    fn read_buffer_overflow() {
        let mut buf = ReadBuffer::new(4, 8);
        buf.extend(b"12345678").unwrap();
        assert!(buf.extend(b"9").is_err());
    }
}
