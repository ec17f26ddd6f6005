//! Length-framed JSON codec for control-plane messages.
//!
//! Each frame is a 4-byte unsigned big-endian length followed by that many
//! bytes of JSON. Frames above [`MAX_FRAME_LEN`] are fatal for the
//! connection and rejected before the payload is read. Messages are
//! validated on both send and receive.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::service::{Message, ValidationError};

/// Maximum frame payload size: 10 MiB.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge(usize),

    #[error("frame declares an empty payload")]
    EmptyFrame,

    #[error("message failed validation: {0}")]
    Invalid(#[from] ValidationError),

    #[error("malformed message payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode and write a single message frame.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    msg.validate()?;

    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode a single message frame.
///
/// Oversized frames fail without reading the payload; the connection must
/// be dropped afterwards since the stream is no longer in sync.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 {
        return Err(CodecError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: Message = serde_json::from_slice(&payload)?;
    msg.validate()?;
    Ok(msg)
}
