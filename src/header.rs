//! FileHeader and the stored index record.
//!
//! # Raw file layout (Compressed state)
//!
//! ```text
//! [0, HEADER_REGION)           FileHeader, zero padded
//! [HEADER_REGION, index)       compressed Block payloads in append order
//! [index, EOF)                 index record
//! ```
//!
//! # FileHeader (20 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//!      0     3  magic 1f 5d 89
//!      3     1  index method tag
//!      4     8  logical size
//!     12     8  index offset (0 = no index)
//! ```
//!
//! # Index record
//!
//! ```text
//! u32  raw_len     serialized LayerMap length
//! u32  stored_len  length after the index method ran
//! ...  stored bytes
//! ```

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::codec::CompressionMethod;
use crate::error::FormatError;
use crate::layer_map::LayerMap;

pub const MAGIC: [u8; 3] = [0x1f, 0x5d, 0x89];

/// Encoded size of a [`FileHeader`].
pub const HEADER_WIRE_SIZE: usize = 20;

/// Bytes reserved at the start of every compressed raw file.
pub const HEADER_REGION: u64 = 32;

/// Size of the length prefix in front of a stored index.
pub const INDEX_PREFIX_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileHeader {
    pub index_method: CompressionMethod,
    pub logical_size: u64,
    pub index_offset: u64,
}

impl FileHeader {
    pub fn new(index_method: CompressionMethod) -> Self {
        Self { index_method, logical_size: 0, index_offset: 0 }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_u8(self.index_method.tag())?;
        writer.write_u64::<LittleEndian>(self.logical_size)?;
        writer.write_u64::<LittleEndian>(self.index_offset)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, FormatError> {
        let mut magic = [0u8; 3];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(FormatError::InvalidMagic(magic));
        }
        let tag = reader.read_u8()?;
        let index_method = CompressionMethod::try_from(tag)
            .map_err(|_| FormatError::UnknownMethod(tag))?;
        let logical_size = reader.read_u64::<LittleEndian>()?;
        let index_offset = reader.read_u64::<LittleEndian>()?;
        if index_offset != 0 && index_offset < HEADER_REGION {
            return Err(FormatError::Malformed(format!(
                "index offset 0x{index_offset:x} inside header region"
            )));
        }
        Ok(Self { index_method, logical_size, index_offset })
    }

    /// The whole reserved region, header first and zero padded.
    pub fn to_region(&self) -> [u8; HEADER_REGION as usize] {
        let mut region = [0u8; HEADER_REGION as usize];
        // Fixed-size header into a larger fixed buffer.
        let _ = self.write(&mut region[..]);
        region
    }
}

// ── Index record ────────────────────────────────────────────────────────────

/// Serialize and compress a LayerMap into an index record.
pub fn encode_index(
    map:    &LayerMap,
    method: CompressionMethod,
    level:  i32,
) -> Result<Vec<u8>, crate::codec::CodecError> {
    let raw = map.to_bytes();
    let stored = method.compress(&raw, level)?;
    let mut out = Vec::with_capacity(INDEX_PREFIX_SIZE as usize + stored.len());
    out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    out.extend_from_slice(&(stored.len() as u32).to_le_bytes());
    out.extend_from_slice(&stored);
    Ok(out)
}

/// Parse the length prefix of an index record: `(raw_len, stored_len)`.
pub fn decode_index_prefix(prefix: &[u8; INDEX_PREFIX_SIZE as usize]) -> (u32, u32) {
    let raw_len    = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let stored_len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
    (raw_len, stored_len)
}

/// Rebuild a LayerMap from the stored bytes that follow the prefix.
pub fn decode_index(
    stored:  &[u8],
    raw_len: u32,
    method:  CompressionMethod,
) -> Result<LayerMap, FormatError> {
    let raw = method
        .decompress(stored, raw_len as usize)
        .map_err(|e| FormatError::Malformed(format!("index payload: {e}")))?;
    LayerMap::from_bytes(&raw)
}
