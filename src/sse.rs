//! Line splitting for upstream SSE bodies.

use bytes::{Bytes, BytesMut};

use crate::error::{BridgeError, Result};

pub const DATA_TAG: &[u8] = b"data:";

/// Splits a chunked byte stream into lines. A line may not grow beyond
/// `max_line_bytes`; exceeding it is a stream error.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: BytesMut,
    // Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    max_line_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    /// Append a chunk and return every line it completed, without the
    /// trailing `\n` or `\r\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.len() > self.max_line_bytes {
                return Err(self.too_long());
            }
            lines.push(line.freeze());
        }

        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_line_bytes {
            return Err(self.too_long());
        }
        Ok(lines)
    }

    /// The unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        self.scanned = 0;
        let mut line = self.buffer.split();
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }

    fn too_long(&self) -> BridgeError {
        BridgeError::stream(format!(
            "upstream line exceeds {} bytes",
            self.max_line_bytes
        ))
    }
}

/// The trimmed payload of a `data:` line.
pub fn data_payload(line: &[u8]) -> Option<&[u8]> {
    line.strip_prefix(DATA_TAG).map(trim_ascii)
}

pub fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.push(b"data: {\"a\"").unwrap().is_empty());
        let lines = buf.push(b":1}\r\n\ndata: x\n").unwrap();
        assert_eq!(
            lines,
            vec![
                Bytes::from_static(b"data: {\"a\":1}"),
                Bytes::new(),
                Bytes::from_static(b"data: x"),
            ]
        );
        assert!(buf.finish().is_none());
    }

    #[test]
    fn test_finish_returns_tail() {
        let mut buf = LineBuffer::new(1024);
        buf.push(b"data: tail").unwrap();
        assert_eq!(buf.finish(), Some(Bytes::from_static(b"data: tail")));
    }

    #[test]
    fn test_oversized_line_errors() {
        let mut buf = LineBuffer::new(8);
        let err = buf.push(b"0123456789").unwrap_err();
        assert!(matches!(err, BridgeError::Stream { .. }));
    }

    #[test]
    fn test_large_line_assembled_from_small_chunks() {
        let mut buf = LineBuffer::new(20 * 1024 * 1024);
        let chunk = vec![b'a'; 8 * 1024];
        let started = std::time::Instant::now();
        for _ in 0..1024 {
            assert!(buf.push(&chunk).unwrap().is_empty());
        }
        let lines = buf.push(b"\r\ndata: next\n").unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 8 * 1024 * 1024);
        assert!(lines[0].iter().all(|b| *b == b'a'));
        assert_eq!(lines[1], Bytes::from_static(b"data: next"));
        assert!(buf.finish().is_none());
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.push(b"data: a\r").unwrap().is_empty());
        assert_eq!(buf.push(b"\ndata: b").unwrap(), vec![Bytes::from_static(b"data: a")]);
        assert_eq!(buf.push(b"\n").unwrap(), vec![Bytes::from_static(b"data: b")]);
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload(b"data:  {\"x\":1} "), Some(&b"{\"x\":1}"[..]));
        assert_eq!(data_payload(b"event: ping"), None);
        assert_eq!(trim_ascii(b"   "), b"");
    }
}
