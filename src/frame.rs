//! Framed line protocol: newline-terminated text messages and the JSON
//! metadata header that opens a file-share stream.
//!
//! Every control message on a stream (chat text, metadata header, `ACK`,
//! `Error: ...` reports) is one UTF-8 line terminated by `\n`. Writers flush
//! after each line so the peer never waits on a half-sent message.

use std::fmt::Display;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::types::{ShareError, TransferMetadata, ERROR_PREFIX, LINE_DELIMITER, MAX_LINE_LEN};

/// Read one framed line and return it without its delimiter.
///
/// Fails with an `UnexpectedEof` I/O error if the stream ends before a
/// delimiter arrives, and with a framing error if the line is longer than
/// [`MAX_LINE_LEN`] or is not UTF-8.
pub async fn read_line<R>(reader: &mut R) -> Result<String, ShareError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = MAX_LINE_LEN as u64 + 1;
    let n = (&mut *reader)
        .take(limit)
        .read_until(LINE_DELIMITER, &mut buf)
        .await?;

    if buf.last() != Some(&LINE_DELIMITER) {
        if n as u64 >= limit {
            return Err(ShareError::ProtocolFraming(format!(
                "line exceeds {} bytes",
                MAX_LINE_LEN
            )));
        }
        return Err(ShareError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before end of line",
        )));
    }
    buf.pop();

    String::from_utf8(buf)
        .map_err(|_| ShareError::ProtocolFraming("line is not valid UTF-8".to_string()))
}

/// Write `text` followed by the line delimiter, then flush.
pub async fn write_line<W>(writer: &mut W, text: &str) -> Result<(), ShareError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::with_capacity(text.len() + 1);
    line.extend_from_slice(text.as_bytes());
    line.push(LINE_DELIMITER);
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize the handshake header as a single JSON line (without delimiter).
pub fn encode_metadata(metadata: &TransferMetadata) -> Result<String, ShareError> {
    Ok(serde_json::to_string(metadata)?)
}

/// Parse a handshake header line.
pub fn decode_metadata(line: &str) -> Result<TransferMetadata, ShareError> {
    serde_json::from_str(line)
        .map_err(|e| ShareError::ProtocolFraming(format!("invalid metadata header: {}", e)))
}

/// Best-effort report of a local fault to the peer as an `Error: ...` line.
///
/// A failure to deliver the report is logged and otherwise ignored.
pub async fn write_error_line<W, E>(writer: &mut W, err: &E)
where
    W: AsyncWrite + Unpin,
    E: Display + ?Sized,
{
    let line = format!("{}{}", ERROR_PREFIX, err);
    match write_line(writer, &line).await {
        Ok(()) => debug!("reported fault to peer: {}", err),
        Err(e) => warn!("could not report fault to peer: {}", e),
    }
}
