//! Message framing over async byte streams.
//!
//! The byte-level serialization of messages is deliberately kept to this one
//! narrow module: a frame is a 4-byte big-endian length followed by the
//! bincode encoding of a [`Message`]. Both the session loop and the peer
//! client speak this framing; nothing else touches raw sockets.

use ferrumq_core::{Error, Message, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame size (16MB). Larger frames are rejected as corrupt.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Write one message frame to the stream.
///
/// # Errors
/// Returns an error if encoding fails, the encoded message exceeds
/// [`MAX_FRAME_SIZE`], or the write fails.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)?;
    let len = u32::try_from(body.len()).map_err(|_| Error::InvalidMessage {
        message: "message exceeds maximum frame size".to_string(),
    })?;
    if len > MAX_FRAME_SIZE {
        return Err(Error::InvalidMessage {
            message: format!("message of {len} bytes exceeds maximum frame size"),
        });
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message frame from the stream.
///
/// Returns `Ok(None)` only on a clean end-of-stream before the first length
/// byte; end-of-stream after that is a truncated frame and an error.
///
/// # Errors
/// Returns an error on a truncated frame, an oversized length prefix, a
/// decode failure, or an I/O error.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    match reader.read_exact(&mut first).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    read_started_frame(reader, first[0]).await.map(Some)
}

/// Read one message frame, waiting at most `wait` for a frame to start.
///
/// The timeout covers only the wait for the first length byte. Once a frame
/// has started, the read runs to completion: a single-byte read either
/// consumes its byte or nothing, so a fired timeout never strands partial
/// bytes and the framing stays synchronized across attempts.
///
/// # Errors
/// Returns a network error when no frame starts within `wait`, otherwise as
/// [`read_message`].
pub async fn read_message_timed<R>(reader: &mut R, wait: Duration) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    match tokio::time::timeout(wait, reader.read_exact(&mut first)).await {
        Err(_) => {
            return Err(Error::Network {
                message: format!("no request within {}ms", wait.as_millis()),
            })
        },
        Ok(Ok(_)) => {},
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(e.into()),
    }
    read_started_frame(reader, first[0]).await.map(Some)
}

/// Read the remainder of a frame whose first length byte has arrived.
async fn read_started_frame<R>(reader: &mut R, first: u8) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut rest = [0u8; 3];
    truncation_guard(reader.read_exact(&mut rest).await)?;

    let len = u32::from_be_bytes([first, rest[0], rest[1], rest[2]]);
    if len > MAX_FRAME_SIZE {
        return Err(Error::InvalidMessage {
            message: format!("frame length {len} exceeds maximum frame size"),
        });
    }

    let mut body = vec![0u8; len as usize];
    truncation_guard(reader.read_exact(&mut body).await)?;
    Ok(bincode::deserialize(&body)?)
}

/// Map end-of-stream inside a frame to a truncation error.
fn truncation_guard(result: std::io::Result<usize>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::InvalidMessage {
            message: "stream ended inside a frame".to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Embed a full message inside a reply payload as raw bytes.
///
/// Used by the MessageGet reply path so federated proxy queues can
/// reconstruct the retrieved message byte-for-byte.
///
/// # Errors
/// Returns an error if the message cannot be encoded.
pub fn embed_message(reply: &mut Message, message: &Message) -> Result<()> {
    let body = bincode::serialize(message)?;
    reply.payload = ferrumq_core::Payload::Data(bytes::Bytes::from(body));
    Ok(())
}

/// Extract a message embedded by [`embed_message`].
///
/// # Errors
/// Returns an error if the reply payload is not an embedded message.
pub fn extract_message(reply: &Message) -> Result<Message> {
    match &reply.payload {
        ferrumq_core::Payload::Data(bytes) => Ok(bincode::deserialize(bytes)?),
        other => Err(Error::InvalidMessage {
            message: format!("expected embedded message payload, found {:?}", other.kind()),
        }),
    }
}
