//! Checksummed framing for metadata files

use crate::{Result, TagStoreError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Metadata file magic
pub const MAGIC: &[u8; 4] = b"TSMF";

/// Metadata format version
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 12;
const CHECKSUM_LEN: usize = 4;

/// Serialize a value into a framed metadata blob
///
/// Format:
/// - 4 bytes: magic
/// - 4 bytes: format version
/// - 4 bytes: payload length
/// - N bytes: bincode payload
/// - 4 bytes: CRC32 over version, length and payload
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let payload =
        bincode::serialize(value).map_err(|e| TagStoreError::InvalidFormat(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    buf.put_slice(MAGIC);
    buf.put_u32_le(FORMAT_VERSION);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);

    let checksum = crc32fast::hash(&buf[4..]);
    buf.put_u32_le(checksum);

    Ok(buf.freeze())
}

/// Validate a framed blob and deserialize its payload
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    if data.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(TagStoreError::InvalidFormat("Metadata too short".into()));
    }
    if &data[..4] != MAGIC {
        return Err(TagStoreError::InvalidFormat("Invalid metadata magic".into()));
    }

    let mut cursor = std::io::Cursor::new(&data[4..HEADER_LEN]);
    let version = cursor.get_u32_le();
    if version != FORMAT_VERSION {
        return Err(TagStoreError::InvalidFormat(format!(
            "Unsupported metadata version: {}",
            version
        )));
    }
    let len = cursor.get_u32_le() as usize;
    if data.len() != HEADER_LEN + len + CHECKSUM_LEN {
        return Err(TagStoreError::InvalidFormat(format!(
            "Metadata length mismatch: header says {} payload bytes, file has {}",
            len,
            data.len().saturating_sub(HEADER_LEN + CHECKSUM_LEN)
        )));
    }

    let body_end = HEADER_LEN + len;
    let expected = std::io::Cursor::new(&data[body_end..]).get_u32_le();
    let actual = crc32fast::hash(&data[4..body_end]);
    if expected != actual {
        return Err(TagStoreError::ChecksumMismatch { expected, actual });
    }

    bincode::deserialize(&data[HEADER_LEN..body_end])
        .map_err(|e| TagStoreError::InvalidFormat(e.to_string()))
}
