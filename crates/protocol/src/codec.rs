//! Newline-delimited JSON framing for [`ChaincodeMessage`].

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::ChaincodeMessage;

/// Upper bound on a single encoded message.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
}

impl CodecError {
    /// True when the underlying stream is unusable, as opposed to a single bad frame.
    pub fn is_stream_failure(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }
}

pub fn encode_line(msg: &ChaincodeMessage) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(msg)?;
    if line.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: line.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    line.push('\n');
    Ok(line)
}

pub fn decode_line(line: &str) -> Result<ChaincodeMessage, CodecError> {
    decode_frame(line.as_bytes())
}

/// Decodes one frame from raw bytes. Invalid UTF-8 is a frame error.
pub fn decode_frame(frame: &[u8]) -> Result<ChaincodeMessage, CodecError> {
    let trimmed = trim_frame(frame);
    if trimmed.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: trimmed.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(serde_json::from_slice(trimmed)?)
}

fn trim_frame(frame: &[u8]) -> &[u8] {
    let start = frame
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(frame.len());
    let end = frame
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |last| last + 1);
    &frame[start..end]
}

/// Reads the next message, skipping blank lines. `Ok(None)` means end of stream.
///
/// At most [`MAX_FRAME_BYTES`] are buffered per frame. A longer line is
/// discarded up to its newline and reported as [`CodecError::FrameTooLarge`],
/// leaving the reader positioned at the next frame.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ChaincodeMessage>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_FRAME_BYTES as u64 + 1;
    let mut frame = Vec::new();
    loop {
        frame.clear();
        if (&mut *reader).take(limit).read_until(b'\n', &mut frame).await? == 0 {
            return Ok(None);
        }
        if frame.last() != Some(&b'\n') && frame.len() > MAX_FRAME_BYTES {
            let skipped = discard_line(reader).await?;
            return Err(CodecError::FrameTooLarge {
                size: frame.len() + skipped,
                limit: MAX_FRAME_BYTES,
            });
        }
        if trim_frame(&frame).is_empty() {
            continue;
        }
        return decode_frame(&frame).map(Some);
    }
}

/// Consumes bytes through the next newline without buffering them.
async fn discard_line<R>(reader: &mut R) -> Result<usize, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(skipped);
        }
        match available.iter().position(|byte| *byte == b'\n') {
            Some(newline) => {
                reader.consume(newline + 1);
                return Ok(skipped + newline + 1);
            }
            None => {
                let len = available.len();
                reader.consume(len);
                skipped += len;
            }
        }
    }
}

pub async fn write_message<W>(writer: &mut W, msg: &ChaincodeMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(msg)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
