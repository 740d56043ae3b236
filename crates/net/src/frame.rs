//! Length-prefixed frames
//!
//! Wire format: [4-byte big-endian length][JSON `Message`]. Frames above
//! 1MB are refused in both directions.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::Message;

const MAX_FRAME_SIZE: u32 = 1024 * 1024;
const PREFIX_LEN: usize = 4;

/// EOF mid-frame means the peer went away
fn closed_on_eof(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        _ => Error::Io(e),
    }
}

fn check_len(len: usize) -> Result<u32> {
    match u32::try_from(len) {
        Ok(0) => Err(Error::Protocol("Empty frame".into())),
        Ok(n) if n <= MAX_FRAME_SIZE => Ok(n),
        _ => Err(Error::Protocol(format!(
            "Frame of {} bytes exceeds {} byte limit",
            len, MAX_FRAME_SIZE
        ))),
    }
}

/// Read one message
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix).await.map_err(closed_on_eof)?;
    let len = check_len(u32::from_be_bytes(prefix) as usize)?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(closed_on_eof)?;

    Message::from_bytes(&payload).map_err(|e| Error::Protocol(format!("Invalid JSON: {}", e)))
}

/// Write one message and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let payload = msg
        .to_bytes()
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;
    let len = check_len(payload.len())?;

    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;
    use std::io::Cursor;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let msg = Message::Request {
            id: 42,
            body: Request::Unsubscribe {
                session_uuid: Uuid::new_v4(),
            },
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();
        assert_eq!(&buf[..4], &((buf.len() - 4) as u32).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();

        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_closed() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{\"ty");
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_bad_lengths_rejected() {
        let mut empty = Cursor::new(vec![0, 0, 0, 0]);
        assert!(matches!(
            read_frame(&mut empty).await,
            Err(Error::Protocol(_))
        ));

        let mut oversized = Cursor::new((MAX_FRAME_SIZE + 1).to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut oversized).await,
            Err(Error::Protocol(_))
        ));
    }
}
