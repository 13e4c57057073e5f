//! Stream framing: `u32` little-endian length header, capped payload,
//! deadline-bound reads and writes.

use crate::{NodeError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes used for the length header
pub const LENGTH_HEADER: usize = 4;
/// Largest payload a frame may carry (512 KiB)
pub const MAX_PAYLOAD: usize = 512 * 1024;
/// Deadline for reading one frame
pub const TIMEOUT_READ: Duration = Duration::from_secs(2);
/// Deadline for writing one frame
pub const TIMEOUT_WRITE: Duration = Duration::from_secs(2);

/// Read one length-prefixed frame within the read deadline.
pub async fn read_length_prefixed<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    read_length_prefixed_within(stream, TIMEOUT_READ).await
}

/// Read one length-prefixed frame within the given deadline; used by the
/// join-party protocol, which waits longer than a plain stream read.
pub async fn read_length_prefixed_within<S>(stream: &mut S, deadline: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(deadline, async {
        let mut header = [0u8; LENGTH_HEADER];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| NodeError::BadFrame(format!("error in read the message head: {e}")))?;
        let length = u32::from_le_bytes(header) as usize;
        if length > MAX_PAYLOAD {
            return Err(NodeError::BadFrame(format!(
                "payload length:{length} exceed max payload length:{MAX_PAYLOAD}"
            )));
        }
        let mut payload = vec![0u8; length];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| NodeError::BadFrame(format!("short read: {e}")))?;
        Ok(payload)
    })
    .await
    .map_err(|_| NodeError::StreamTimeout("read".into()))?
}

/// Write one length-prefixed frame within the write deadline.
pub async fn write_length_prefixed<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD {
        return Err(NodeError::BadFrame(format!(
            "payload length:{} exceed max payload length:{MAX_PAYLOAD}",
            payload.len()
        )));
    }
    tokio::time::timeout(TIMEOUT_WRITE, async {
        let header = (payload.len() as u32).to_le_bytes();
        stream
            .write_all(&header)
            .await
            .map_err(|e| NodeError::BadFrame(format!("fail to write head: {e}")))?;
        stream
            .write_all(payload)
            .await
            .map_err(|e| NodeError::BadFrame(format!("short write: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| NodeError::BadFrame(format!("fail to flush: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|_| NodeError::StreamTimeout("write".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(MAX_PAYLOAD * 2);
        let payload = vec![0xabu8; 4096];
        write_length_prefixed(&mut a, &payload).await.unwrap();
        let read = read_length_prefixed(&mut b).await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_length_prefixed(&mut a, &[]).await.unwrap();
        let read = read_length_prefixed(&mut b).await.unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn test_max_payload_boundary() {
        let (mut a, mut b) = tokio::io::duplex(MAX_PAYLOAD * 2 + 64);
        let payload = vec![1u8; MAX_PAYLOAD];
        write_length_prefixed(&mut a, &payload).await.unwrap();
        let read = read_length_prefixed(&mut b).await.unwrap();
        assert_eq!(read.len(), MAX_PAYLOAD);

        let oversized = vec![1u8; MAX_PAYLOAD + 1];
        assert!(write_length_prefixed(&mut a, &oversized).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = ((MAX_PAYLOAD + 1) as u32).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus).await.unwrap();
        let err = read_length_prefixed(&mut b).await.unwrap_err();
        assert!(matches!(err, NodeError::BadFrame(_)));
    }
}
