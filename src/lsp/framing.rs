//! `Content-Length` framing for the language server's stdio pipe.
//!
//! Each message is an ASCII header block terminated by an empty line,
//! followed by exactly `Content-Length` bytes of UTF-8 body:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"initialize",...}
//! ```
//!
//! Bodies are opaque here; only the length is interpreted.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::FramingError;

const CONTENT_LENGTH: &str = "content-length:";

/// Upper bound for a single header line.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Frame `payload` and write it to `writer`, flushing afterwards.
pub async fn write_message<W>(writer: &mut W, payload: &str) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let body = payload.as_bytes();
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message.
///
/// Returns `Ok(None)` when the stream ends cleanly before a header, or ends
/// in the middle of a body.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<String>, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let Some(line) = read_header_line(reader).await? else {
            return Ok(None);
        };
        if line.is_empty() {
            break;
        }
        if let Some(name) = line.get(..CONTENT_LENGTH.len())
            && name.eq_ignore_ascii_case(CONTENT_LENGTH)
        {
            let value = line[CONTENT_LENGTH.len()..].trim();
            let parsed = value
                .parse::<usize>()
                .map_err(|_| FramingError::InvalidContentLength {
                    value: value.to_string(),
                })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or(FramingError::MissingContentLength)?;

    let mut body = vec![0u8; content_length];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    String::from_utf8(body)
        .map(Some)
        .map_err(FramingError::InvalidUtf8)
}

/// Read one `\n`-terminated header line with `\r` stripped.
/// `Ok(None)` means EOF before any byte of the line.
async fn read_header_line<R>(reader: &mut R) -> Result<Option<String>, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_HEADER_LINE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_HEADER_LINE {
        return Err(FramingError::HeaderTooLong {
            limit: MAX_HEADER_LINE,
        });
    }
    buf.retain(|b| *b != b'\r');

    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
