//! Protocol primitives for the control and transfer channels.
//!
//! The control channel carries `\n`-terminated UTF-8 lines. A line starts with a
//! command token and its remaining text is split on [`PARAM_DELIMITER`].
//!
//! The transfer channel uses big-endian integers, single-byte booleans and strings
//! prefixed with a `u16` byte length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::PARAM_DELIMITER;
use crate::{Error, Result};

/// Trait for reading transfer-channel primitives from a buffer.
pub trait ProtocolRead: Sized {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self>;
}

/// Trait for writing transfer-channel primitives to a buffer.
pub trait ProtocolWrite {
    fn write_to<B: BufMut>(&self, buf: &mut B);

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }
}

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::BufferUnderflow {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

impl ProtocolRead for bool {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 1)?;
        Ok(buf.get_u8() != 0)
    }
}

impl ProtocolWrite for bool {
    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(if *self { 1 } else { 0 });
    }
}

impl ProtocolRead for i32 {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 4)?;
        Ok(buf.get_i32())
    }
}

impl ProtocolWrite for i32 {
    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(*self);
    }
}

impl ProtocolRead for i64 {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 8)?;
        Ok(buf.get_i64())
    }
}

impl ProtocolWrite for i64 {
    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64(*self);
    }
}

impl ProtocolRead for String {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 2)?;
        let len = buf.get_u16() as usize;
        ensure(buf, len)?;
        let mut bytes = vec![0u8; len];
        buf.copy_to_slice(&mut bytes);
        Ok(String::from_utf8(bytes)?)
    }
}

impl ProtocolWrite for String {
    fn write_to<B: BufMut>(&self, buf: &mut B) {
        self.as_str().write_to(buf);
    }
}

impl ProtocolWrite for &str {
    fn write_to<B: BufMut>(&self, buf: &mut B) {
        // Strings longer than u16::MAX are truncated to keep the prefix honest.
        let bytes = &self.as_bytes()[..self.len().min(u16::MAX as usize)];
        buf.put_u16(bytes.len() as u16);
        buf.put_slice(bytes);
    }
}

/// Read a `u16`-prefixed UTF-8 string from an async stream.
pub async fn read_utf<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16().await? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(String::from_utf8(bytes)?)
}

/// Write a `u16`-prefixed UTF-8 string to an async stream.
pub async fn write_utf<W: AsyncWrite + Unpin>(writer: &mut W, value: &str) -> Result<()> {
    let mut buf = BytesMut::with_capacity(value.len() + 2);
    value.write_to(&mut buf);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Take the next complete line out of `buf`, without its terminator.
///
/// Returns `Ok(None)` when no full line is buffered yet. A buffered line longer
/// than `max_len` is discarded and reported as [`Error::LineTooLong`].
pub fn next_line(buf: &mut BytesMut, max_len: usize) -> Result<Option<String>> {
    match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => {
            let mut line = buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.len() > max_len {
                return Err(Error::LineTooLong(max_len));
            }
            Ok(Some(String::from_utf8(line.to_vec())?))
        }
        None if buf.len() > max_len => {
            buf.clear();
            Err(Error::LineTooLong(max_len))
        }
        None => Ok(None),
    }
}

/// Split a line into its command token and the remaining argument text.
pub fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, rest)) => (command, rest),
        None => (line, ""),
    }
}

/// Split argument text into fields.
///
/// With `max_fields` set, the last field keeps any further delimiters unsplit.
/// Empty argument text yields no fields.
pub fn split_fields(args: &str, max_fields: Option<usize>) -> Vec<&str> {
    if args.is_empty() {
        return Vec::new();
    }
    match max_fields {
        Some(n) => args.splitn(n, PARAM_DELIMITER).collect(),
        None => args.split(PARAM_DELIMITER).collect(),
    }
}

/// Join fields with the parameter delimiter.
///
/// Fields are not escaped; only the final field may safely contain the delimiter.
pub fn join_fields<S: AsRef<str>>(fields: &[S]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(PARAM_DELIMITER);
        }
        out.push_str(field.as_ref());
    }
    out
}

/// Integer percentage of `done` out of `total`, clamped to 0..=100.
pub fn progress_percent(done: u64, total: u64) -> i32 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        "hello".write_to(&mut buf);
        assert_eq!(&buf[..2], &[0, 5]);
        assert_eq!(String::read_from(&mut buf.freeze()).unwrap(), "hello");
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut buf = BytesMut::new();
        100i32.write_to(&mut buf);
        10_000i64.write_to(&mut buf);
        assert_eq!(&buf[..4], &[0, 0, 0, 100]);
        let mut frozen = buf.freeze();
        assert_eq!(i32::read_from(&mut frozen).unwrap(), 100);
        assert_eq!(i64::read_from(&mut frozen).unwrap(), 10_000);
    }

    #[test]
    fn test_truncated_string_underflows() {
        let mut buf = BytesMut::new();
        buf.put_u16(10);
        buf.put_slice(b"abc");
        assert!(matches!(
            String::read_from(&mut buf.freeze()),
            Err(Error::BufferUnderflow { needed: 10, available: 3 })
        ));
    }

    #[test]
    fn test_next_line_handles_partial_and_crlf() {
        let mut buf = BytesMut::from(&b"/online\r\n/login al"[..]);
        assert_eq!(next_line(&mut buf, 1024).unwrap().as_deref(), Some("/online"));
        assert_eq!(next_line(&mut buf, 1024).unwrap(), None);
        buf.extend_from_slice(b"ice|pw\n");
        assert_eq!(
            next_line(&mut buf, 1024).unwrap().as_deref(),
            Some("/login alice|pw")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_next_line_rejects_oversized_lines() {
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(next_line(&mut buf, 4), Err(Error::LineTooLong(4))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bounded_split_keeps_delimiters_in_last_field() {
        assert_eq!(
            split_fields("bob|a|b|c", Some(2)),
            vec!["bob", "a|b|c"]
        );
        assert_eq!(split_fields("a|b|c", None), vec!["a", "b", "c"]);
        assert!(split_fields("", Some(2)).is_empty());
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("/private bob|hi there"), ("/private", "bob|hi there"));
        assert_eq!(split_command("/online"), ("/online", ""));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 10_000), 0);
        assert_eq!(progress_percent(8192, 10_000), 81);
        assert_eq!(progress_percent(10_000, 10_000), 100);
        assert_eq!(progress_percent(20, 10), 100);
    }

    #[tokio::test]
    async fn test_async_utf_roundtrip() {
        let mut out = Vec::new();
        write_utf(&mut out, "RECEIVE").await.unwrap();
        let mut reader = &out[..];
        assert_eq!(read_utf(&mut reader).await.unwrap(), "RECEIVE");
    }
}
