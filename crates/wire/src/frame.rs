//! Message framing.
//!
//! `codec u8 | length u32 big-endian | payload`. Codec 1 is the only
//! defined codec (bincode envelope). The length is validated against the
//! configured cap before the payload is read, so an oversized frame is
//! rejected without allocation.

use gibram_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The structured binary codec.
pub const CODEC_BINCODE: u8 = 1;

/// Default cap on a frame payload: 64 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read one frame.
///
/// Returns `Ok(None)` on clean end-of-stream (peer closed between
/// frames). Unknown codecs and oversized lengths are protocol errors.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut codec = [0u8; 1];
    match reader.read(&mut codec).await? {
        0 => return Ok(None),
        _ => {}
    }
    if codec[0] != CODEC_BINCODE {
        return Err(Error::Protocol(format!("unknown codec {}", codec[0])));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > max_frame_size {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes exceeds limit {max_frame_size}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[CODEC_BINCODE]).await?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello frame").await.unwrap();

        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"hello frame");

        // Clean EOF after the frame.
        assert!(read_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_codec_rejected() {
        let mut cursor = Cursor::new(vec![9u8, 0, 0, 0, 0]);
        let err = read_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_read() {
        let mut data = vec![CODEC_BINCODE];
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut cursor = Cursor::new(data);
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
