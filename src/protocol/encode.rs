//! Outbound command frame encoding.
//!
//! A command frame is `*N<CRLF>` followed by N bulk strings
//! `$L<CRLF><bytes><CRLF>`. The inline (space-delimited) encoding is never
//! emitted. Numeric arguments are rendered by the caller in shortest decimal
//! form before reaching this layer; here everything is opaque bytes.

use bytes::{BufMut, BytesMut};

/// Append one complete command frame to `buf`.
///
/// `parts` is the command name followed by its arguments, each already
/// rendered to bytes.
pub fn encode_command<I, B>(buf: &mut BytesMut, parts: I)
where
    I: ExactSizeIterator<Item = B>,
    B: AsRef<[u8]>,
{
    write_header(buf, b'*', parts.len() as i64);
    for part in parts {
        let bytes = part.as_ref();
        write_header(buf, b'$', bytes.len() as i64);
        buf.put_slice(bytes);
        buf.put_slice(b"\r\n");
    }
}

/// Bytes a frame with the given part lengths will occupy.
pub fn encoded_len<'a, I>(part_lens: I) -> usize
where
    I: ExactSizeIterator<Item = &'a usize>,
{
    let mut total = header_len(part_lens.len() as i64);
    for &len in part_lens {
        total += header_len(len as i64) + len + 2;
    }
    total
}

fn write_header(buf: &mut BytesMut, tag: u8, n: i64) {
    let mut digits = itoa_buffer();
    let text = itoa(&mut digits, n);
    buf.reserve(1 + text.len() + 2);
    buf.put_u8(tag);
    buf.put_slice(text);
    buf.put_slice(b"\r\n");
}

fn header_len(n: i64) -> usize {
    let mut digits = itoa_buffer();
    1 + itoa(&mut digits, n).len() + 2
}

fn itoa_buffer() -> [u8; 20] {
    [0u8; 20]
}

/// Render `n` as shortest decimal into `buf`, returning the written slice.
fn itoa(buf: &mut [u8; 20], n: i64) -> &[u8] {
    let mut value = n.unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    if n < 0 {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}
