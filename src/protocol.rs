/*!
 * Request Tokenizer and RESP Reply Writers
 *
 * This module turns raw request bytes into argument tokens and encodes
 * replies. Two request shapes are accepted: RESP arrays of bulk strings
 * (`*<n>\r\n$<len>\r\n<bytes>\r\n...`) and plain whitespace-separated
 * inline commands. Replies are written straight into an output buffer.
 */

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Longest inline request accepted while waiting for its newline
pub const MAX_INLINE: usize = 64 * 1024;

/// Largest bulk string length a client may declare (512 MiB, as Redis)
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// A frame that can never become valid no matter how many bytes follow
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected '$', got '{}'", char::from(*.0))]
    ExpectedBulk(u8),
    #[error("invalid length")]
    InvalidLength,
    #[error("expected CRLF")]
    MissingCrlf,
    #[error("inline request too long")]
    InlineTooLong,
}

/// Split a complete request buffer into argument tokens (best effort)
///
/// Buffers starting with `*` are read as a RESP array; anything else is
/// split on ASCII whitespace. On any framing inconsistency the tokens
/// collected so far are returned and the rest of the buffer is ignored,
/// so a corrupted frame yields a truncated (possibly empty) argument list
/// instead of an error.
pub fn parse_request(input: &[u8]) -> Vec<Bytes> {
    if input.first() != Some(&b'*') {
        return split_inline(input);
    }

    let mut tokens = Vec::new();
    let Some((count, mut cursor)) = read_length(input, 1) else {
        return tokens;
    };

    for _ in 0..count {
        if input.get(cursor) != Some(&b'$') {
            break;
        }
        let Some((len, start)) = read_length(input, cursor + 1) else {
            break;
        };
        let end = match start.checked_add(len) {
            Some(end) if end <= input.len() => end,
            _ => break,
        };
        tokens.push(Bytes::copy_from_slice(&input[start..end]));

        // A final token may arrive without its trailing CRLF
        cursor = end + 2;
        if matches!(input.get(end..cursor), Some(t) if t != b"\r\n") {
            break;
        }
    }
    tokens
}

/// Parse one request frame from the front of `data`
///
/// # Returns
/// * `Ok(Some((consumed_bytes, tokens)))` - a complete frame
/// * `Ok(None)` - incomplete data, need more bytes
/// * `Err(...)` - malformed frame, the connection should be dropped
pub fn parse_frame(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>, ProtocolError> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] != b'*' {
        return parse_inline_frame(data);
    }

    let Some((n, mut cursor)) = read_decimal_line(data, 1)? else {
        return Ok(None);
    };

    // Never trust the declared count for the allocation
    let mut items: Vec<Bytes> = Vec::with_capacity(n.min(64));

    for _ in 0..n {
        let Some(&sigil) = data.get(cursor) else {
            return Ok(None);
        };
        if sigil != b'$' {
            return Err(ProtocolError::ExpectedBulk(sigil));
        }

        let Some((len, start)) = read_decimal_line(data, cursor + 1)? else {
            return Ok(None);
        };
        if len > MAX_BULK_LEN {
            return Err(ProtocolError::InvalidLength);
        }

        let end = start + len;
        let need = end + 2;
        if need > data.len() {
            return Ok(None);
        }
        if &data[end..need] != b"\r\n" {
            return Err(ProtocolError::MissingCrlf);
        }

        items.push(Bytes::copy_from_slice(&data[start..end]));
        cursor = need;
    }

    Ok(Some((cursor, items)))
}

/// Parse every complete frame buffered so far
///
/// Consumed bytes are removed from `buf`; a trailing partial frame is
/// left in place for the next read. Blank inline lines are dropped.
pub fn parse_many(buf: &mut BytesMut, out: &mut Vec<Vec<Bytes>>) -> Result<(), ProtocolError> {
    while let Some((consumed, tokens)) = parse_frame(&buf[..])? {
        buf.advance(consumed);
        if !tokens.is_empty() {
            out.push(tokens);
        }
    }
    Ok(())
}

fn parse_inline_frame(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>, ProtocolError> {
    match data.iter().position(|&b| b == b'\n') {
        Some(eol) => Ok(Some((eol + 1, split_inline(&data[..eol])))),
        None if data.len() > MAX_INLINE => Err(ProtocolError::InlineTooLong),
        None => Ok(None),
    }
}

fn split_inline(input: &[u8]) -> Vec<Bytes> {
    input
        .split(|b| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Lenient `<digits>\r\n` reader used by [`parse_request`]
fn read_length(buf: &[u8], at: usize) -> Option<(usize, usize)> {
    let rest = buf.get(at..)?;
    let eol = rest.windows(2).position(|w| w == b"\r\n")?;
    let n = std::str::from_utf8(&rest[..eol]).ok()?.trim().parse::<usize>().ok()?;
    Some((n, at + eol + 2))
}

/// Strict `<digits>\r\n` reader used by [`parse_frame`]
///
/// Returns the parsed number and the index just past the CRLF, or
/// `Ok(None)` when the line is not complete yet.
fn read_decimal_line(data: &[u8], at: usize) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut i = at;
    let mut num: usize = 0;

    while let Some(&c) = data.get(i) {
        if !c.is_ascii_digit() {
            break;
        }
        num = num
            .checked_mul(10)
            .and_then(|n| n.checked_add((c - b'0') as usize))
            .ok_or(ProtocolError::InvalidLength)?;
        i += 1;
    }

    match (data.get(i), data.get(i + 1)) {
        (None, _) => Ok(None),
        _ if i == at => Err(ProtocolError::InvalidLength),
        (Some(b'\r'), None) => Ok(None),
        (Some(b'\r'), Some(b'\n')) => Ok(Some((num, i + 2))),
        _ => Err(ProtocolError::MissingCrlf),
    }
}

//
// RESP Reply Writers
//
// These functions append a single encoded reply to the output buffer.
//

/// Write a simple status reply (`+<text>\r\n`)
pub fn write_simple(s: &[u8], out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'+');
    out.put_slice(s);
    out.put_slice(b"\r\n");
}

/// Write an error reply (`-Error: <text>\r\n`)
pub fn write_error(msg: &str, out: &mut BytesMut) {
    out.reserve(msg.len() + 10);
    out.put_slice(b"-Error: ");
    out.put_slice(msg.as_bytes());
    out.put_slice(b"\r\n");
}

/// Write an error reply without the separating space (`-Error:<text>\r\n`)
pub fn write_error_compact(msg: &str, out: &mut BytesMut) {
    out.reserve(msg.len() + 9);
    out.put_slice(b"-Error:");
    out.put_slice(msg.as_bytes());
    out.put_slice(b"\r\n");
}

/// Write a bulk string reply (`$<len>\r\n<data>\r\n`)
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    let len_str = b.len().to_string();
    out.reserve(1 + len_str.len() + 2 + b.len() + 2);
    out.put_u8(b'$');
    out.put_slice(len_str.as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(b);
    out.put_slice(b"\r\n");
}

/// Write a null bulk reply (`$-1\r\n`) for a missing value
pub fn write_null(out: &mut BytesMut) {
    out.put_slice(b"$-1\r\n");
}

/// Write an array header (`*<count>\r\n`); the caller writes the items
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    out.put_u8(b'*');
    out.put_slice(n.to_string().as_bytes());
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(tokens: &[Bytes]) -> Vec<&[u8]> {
        tokens.iter().map(|t| t.as_ref()).collect()
    }

    #[test]
    fn parses_resp_array() {
        let t = parse_request(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
        assert_eq!(strs(&t), vec![&b"SET"[..], b"foo", b"bar"]);
    }

    #[test]
    fn inline_fallback_splits_on_whitespace() {
        let t = parse_request(b"  SET   foo\tbar\r\n");
        assert_eq!(strs(&t), vec![&b"SET"[..], b"foo", b"bar"]);
        assert!(parse_request(b"").is_empty());
    }

    #[test]
    fn truncates_when_declared_length_overruns() {
        let t = parse_request(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$10\r\nbar\r\n");
        assert_eq!(strs(&t), vec![&b"SET"[..], b"foo"]);
    }

    #[test]
    fn truncates_on_wrong_sigil_or_bad_count() {
        let t = parse_request(b"*2\r\n$4\r\nPING\r\n:5\r\n");
        assert_eq!(strs(&t), vec![&b"PING"[..]]);
        assert!(parse_request(b"*x\r\n$4\r\nPING\r\n").is_empty());
        assert!(parse_request(b"*1").is_empty());
    }

    #[test]
    fn truncates_on_missing_crlf_after_payload() {
        let t = parse_request(b"*2\r\n$3\r\nGETxx$3\r\nfoo\r\n");
        assert_eq!(strs(&t), vec![&b"GET"[..]]);
    }

    #[test]
    fn frame_reports_incomplete() {
        assert_eq!(parse_frame(b"*2\r\n$3\r\nGET\r\n").unwrap(), None);
        assert_eq!(parse_frame(b"*2\r").unwrap(), None);
        assert_eq!(parse_frame(b"GET foo").unwrap(), None);
    }

    #[test]
    fn frame_reports_malformed() {
        assert_eq!(
            parse_frame(b"*1\r\n+PING\r\n"),
            Err(ProtocolError::ExpectedBulk(b'+'))
        );
        assert_eq!(parse_frame(b"*1\r\n$4\r\nPINGxx"), Err(ProtocolError::MissingCrlf));
        assert_eq!(parse_frame(b"*-1\r\n"), Err(ProtocolError::InvalidLength));
        assert_eq!(
            parse_frame(&vec![b'a'; MAX_INLINE + 1]),
            Err(ProtocolError::InlineTooLong)
        );
    }

    #[test]
    fn frame_consumes_exactly_one_request() {
        let data = b"*1\r\n$4\r\nPING\r\nECHO hi\n";
        let (n, t) = parse_frame(data).unwrap().unwrap();
        assert_eq!(n, 14);
        assert_eq!(strs(&t), vec![&b"PING"[..]]);
        let (m, t) = parse_frame(&data[n..]).unwrap().unwrap();
        assert_eq!(m, 8);
        assert_eq!(strs(&t), vec![&b"ECHO"[..], b"hi"]);
    }

    #[test]
    fn writers_encode_replies() {
        let mut out = BytesMut::new();
        write_simple(b"OK", &mut out);
        write_error("GET requires key", &mut out);
        write_error_compact("Unknown command", &mut out);
        write_bulk(b"bar", &mut out);
        write_null(&mut out);
        write_array_len(2, &mut out);
        assert_eq!(
            &out[..],
            &b"+OK\r\n-Error: GET requires key\r\n-Error:Unknown command\r\n$3\r\nbar\r\n$-1\r\n*2\r\n"[..]
        );
    }
}
