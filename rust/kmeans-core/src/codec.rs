// rust/kmeans-core/src/codec.rs

//! Payload encoding for task units, centroid sets and contributions.
//!
//! Every payload is wrapped in a small envelope:
//! ```text
//! +-----------------------+
//! | Magic "KMWF" (4)      |
//! +-----------------------+
//! | Version (u32 LE)      |
//! +-----------------------+
//! | XxHash64 of body (8)  |
//! +-----------------------+
//! | Body (bincode)        |
//! +-----------------------+
//! ```

use std::hash::Hasher;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use twox_hash::XxHash64;

use crate::error::{ClusterError, Result};

/// Magic bytes identifying an encoded payload.
pub const MAGIC: [u8; 4] = *b"KMWF";

/// Current envelope version.
pub const VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8;

/// Encode `value`, failing if the result would exceed `max_frame_bytes`.
pub fn encode<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Bytes> {
    let body = bincode::serialize(value)
        .map_err(|e| ClusterError::encoding(format!("bincode serialization failed: {}", e)))?;

    let total = HEADER_LEN + body.len();
    if total > max_frame_bytes {
        return Err(ClusterError::encoding(format!(
            "encoded payload is {} bytes, limit is {}",
            total, max_frame_bytes
        )));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&MAGIC);
    buf.put_u32_le(VERSION);
    buf.put_u64_le(checksum(&body));
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode a payload produced by [`encode`], verifying magic, version and checksum.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(ClusterError::encoding(format!(
            "payload too short: {} bytes",
            bytes.len()
        )));
    }

    let mut header = &bytes[..HEADER_LEN];
    let mut magic = [0u8; 4];
    header.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(ClusterError::encoding("invalid payload magic"));
    }

    let version = header.get_u32_le();
    if version != VERSION {
        return Err(ClusterError::encoding(format!(
            "unsupported payload version {}",
            version
        )));
    }

    let expected = header.get_u64_le();
    let body = &bytes[HEADER_LEN..];
    let actual = checksum(body);
    if actual != expected {
        return Err(ClusterError::encoding(format!(
            "checksum mismatch: expected {:016x}, got {:016x}",
            expected, actual
        )));
    }

    bincode::deserialize(body)
        .map_err(|e| ClusterError::encoding(format!("bincode deserialization failed: {}", e)))
}

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Point, PointGroup};

    fn sample_group() -> PointGroup {
        PointGroup::new("17", 2, vec![Point::new(1.5, -2.0), Point::new(0.0, 3.25)])
    }

    #[test]
    fn test_encode_decode_group() {
        let group = sample_group();
        let bytes = encode(&group, 1 << 20).unwrap();
        assert_eq!(&bytes[..4], b"KMWF");

        let decoded: PointGroup = decode(&bytes).unwrap();
        assert_eq!(decoded, group);
    }

    #[test]
    fn test_encode_respects_frame_limit() {
        let err = encode(&sample_group(), 16).unwrap_err();
        assert!(matches!(err, ClusterError::Encoding { .. }));
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_decode_detects_corruption() {
        let bytes = encode(&sample_group(), 1 << 20).unwrap();
        let mut corrupted = bytes.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;

        let err = decode::<PointGroup>(&corrupted).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_short_input() {
        let mut bytes = encode(&sample_group(), 1 << 20).unwrap().to_vec();
        bytes[0] = b'X';
        assert!(decode::<PointGroup>(&bytes).is_err());
        assert!(decode::<PointGroup>(&[0u8; 3]).is_err());
    }
}
