// rust/kmeans-core/src/transport/frame.rs

//! Length-prefixed framing: `[u32 BE length][payload]`.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClusterError, Result};

/// Read one frame. Returns `Ok(None)` on a clean EOF before the length prefix.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ClusterError::transport_with_source("frame read failed", e)),
    };
    if len > max_frame_bytes {
        return Err(ClusterError::transport(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| ClusterError::transport_with_source("truncated frame", e))?;
    Ok(Some(Bytes::from(buf)))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_frame_bytes {
        return Err(ClusterError::transport(format!(
            "frame of {} bytes exceeds limit of {}",
            payload.len(),
            max_frame_bytes
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| ClusterError::transport("frame length does not fit in u32"))?;

    writer
        .write_u32(len)
        .await
        .map_err(|e| ClusterError::transport_with_source("frame write failed", e))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| ClusterError::transport_with_source("frame write failed", e))?;
    writer
        .flush()
        .await
        .map_err(|e| ClusterError::transport_with_source("frame flush failed", e))?;
    Ok(())
}
