//! Newline-delimited JSON framing over stdio streams.
//!
//! Each message is one JSON object followed by a single newline. Blank
//! lines are skipped; lines that fail to parse are surfaced as raw text
//! so the relay can forward them untouched. A single line may not exceed
//! [`STDIO_STREAM_LIMIT`]; an overlong line aborts the stream with an
//! error rather than buffering without bound.

use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on the length of one line, either direction.
pub const STDIO_STREAM_LIMIT: usize = 8 * 1024 * 1024;

/// One line read from a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    /// A parsed JSON-RPC message.
    Message(Value),
    /// A non-JSON line, preserved byte-for-byte (without the newline).
    Raw(String),
}

/// Accumulates one newline-terminated line into `buf`, erroring once the
/// line grows past `limit`. Returns true when the stream ended before a
/// newline was seen.
async fn fill_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<bool>
where
    R: AsyncBufReadExt + Unpin,
{
    loop {
        let (used, done, eof) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                (0, true, true)
            } else if let Some(idx) = available.iter().position(|&b| b == b'\n') {
                buf.extend_from_slice(&available[..=idx]);
                (idx + 1, true, false)
            } else {
                buf.extend_from_slice(available);
                (available.len(), false, false)
            }
        };
        reader.consume(used);
        if buf.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("stdio line exceeds the {limit}-byte stream limit"),
            ));
        }
        if done {
            return Ok(eof);
        }
    }
}

/// Reads the next non-blank line, enforcing `limit` per line.
/// Returns `None` on EOF.
pub async fn read_line_with_limit<R>(
    reader: &mut R,
    limit: usize,
) -> io::Result<Option<InboundLine>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.clear();
        let eof = fill_line(reader, &mut buf, limit).await?;
        if buf.is_empty() && eof {
            return Ok(None);
        }
        let line = std::str::from_utf8(&buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "stream is not valid UTF-8"))?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            if eof {
                return Ok(None);
            }
            continue;
        }
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => Ok(Some(InboundLine::Message(value))),
            Err(_) => Ok(Some(InboundLine::Raw(trimmed.to_string()))),
        };
    }
}

/// Reads the next non-blank line under the default stream limit.
/// Returns `None` on EOF.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<InboundLine>>
where
    R: AsyncBufReadExt + Unpin,
{
    read_line_with_limit(reader, STDIO_STREAM_LIMIT).await
}

/// Serializes `msg` compactly and writes it as one line.
pub async fn write_message<W>(writer: &mut W, msg: &Value) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut data = serde_json::to_vec(msg)?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    writer.flush().await
}

/// Forwards a raw (non-JSON) line unchanged.
pub async fn write_raw_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_json_lines_and_skips_blanks() {
        let input = b"\n{\"jsonrpc\":\"2.0\",\"id\":1}\n\n{\"id\":2}\n";
        let mut reader = BufReader::new(&input[..]);

        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(InboundLine::Message(json!({"jsonrpc": "2.0", "id": 1})))
        );
        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(InboundLine::Message(json!({"id": 2})))
        );
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_json_lines_are_preserved_verbatim() {
        let input = b"not json at all\n{\"id\":3}\n";
        let mut reader = BufReader::new(&input[..]);

        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(InboundLine::Raw("not json at all".to_string()))
        );
        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(InboundLine::Message(json!({"id": 3})))
        );
    }

    #[tokio::test]
    async fn final_line_without_newline_is_still_delivered() {
        let input = b"{\"id\":4}";
        let mut reader = BufReader::new(&input[..]);
        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some(InboundLine::Message(json!({"id": 4})))
        );
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn overlong_line_aborts_the_stream() {
        let mut input = vec![b'x'; 64];
        input.push(b'\n');
        let mut reader = BufReader::new(&input[..]);

        let err = read_line_with_limit(&mut reader, 16).await.expect_err("limit");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn lines_under_the_limit_pass() {
        let input = b"{\"id\":5}\n";
        let mut reader = BufReader::new(&input[..]);
        assert_eq!(
            read_line_with_limit(&mut reader, 64).await.unwrap(),
            Some(InboundLine::Message(json!({"id": 5})))
        );
    }

    #[tokio::test]
    async fn write_message_emits_compact_line() {
        let mut out = Vec::new();
        write_message(&mut out, &json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}))
            .await
            .unwrap();
        assert_eq!(out, b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n");
    }

    #[tokio::test]
    async fn raw_lines_round_trip() {
        let mut out = Vec::new();
        write_raw_line(&mut out, "garbage in").await.unwrap();
        assert_eq!(out, b"garbage in\n");
    }
}
