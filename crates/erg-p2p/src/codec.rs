//! Async framing over a TCP stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use erg_core::{ErgError, MAX_WIRE_PAYLOAD, WIRE_HEADER_LEN, WIRE_MAGIC};

use crate::message::{frame_checksum, MessageType, WireMessage};

/// Write one framed message.
pub async fn write_message<W>(stream: &mut W, msg: &WireMessage) -> Result<(), ErgError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&msg.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message, validating magic, size cap, and checksum.
///
/// An unknown message type is returned as [`ErgError::UnknownMessageType`]
/// after the payload has been drained, so the connection stays framed and
/// the caller can apply its ban policy.
pub async fn read_message<R>(stream: &mut R) -> Result<WireMessage, ErgError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; WIRE_HEADER_LEN];
    stream.read_exact(&mut header).await?;

    let magic = u32::from_le_bytes(header[..4].try_into().unwrap());
    if magic != WIRE_MAGIC {
        return Err(ErgError::MalformedMessage(format!(
            "bad magic {magic:#010x}"
        )));
    }
    let kind_raw = header[4];
    let length = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
    if length > MAX_WIRE_PAYLOAD {
        return Err(ErgError::MalformedMessage(format!(
            "payload of {length} bytes exceeds cap"
        )));
    }
    let checksum: [u8; 4] = header[9..13].try_into().unwrap();

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;

    if frame_checksum(&payload) != checksum {
        return Err(ErgError::MalformedMessage("checksum mismatch".into()));
    }
    let kind = MessageType::from_u8(kind_raw).ok_or(ErgError::UnknownMessageType(kind_raw))?;
    Ok(WireMessage { kind, payload })
}
