use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Outcome of a bounded line read. The bytes are left in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLineResult {
    /// A complete line, including its newline unless the stream ended first.
    Line,
    /// The line was longer than the limit; the rest of it was consumed and dropped.
    Truncated,
    Eof,
}

/// Read one line into `buf`, keeping at most `max_len` bytes of it.
///
/// A final line without a trailing newline is returned as a line, not lost.
pub async fn read_line_with_limit<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<ReadLineResult> {
    buf.clear();
    let mut truncated = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if truncated {
                ReadLineResult::Truncated
            } else if buf.is_empty() {
                ReadLineResult::Eof
            } else {
                ReadLineResult::Line
            });
        }

        let (chunk_len, line_done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        let room = max_len.saturating_sub(buf.len());
        let keep = chunk_len.min(room);
        buf.extend_from_slice(&available[..keep]);
        truncated |= keep < chunk_len;
        reader.consume(chunk_len);

        if line_done {
            return Ok(if truncated {
                ReadLineResult::Truncated
            } else {
                ReadLineResult::Line
            });
        }
    }
}
