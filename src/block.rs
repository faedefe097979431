//! Block record: one compressed extent of a logical file.
//!
//! # On-disk layout (33 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//!      0     8  logical_offset
//!      8     4  logical_length
//!     12     4  original_length
//!     16     8  physical_offset
//!     24     4  physical_length
//!     28     4  level
//!     32     1  method (CompressionMethod tag)
//! ```
//!
//! `original_length` is the number of bytes the compressed payload expands
//! to.  It equals `logical_length` when the Block is written; a truncation
//! that cuts through the Block shrinks `logical_length` only, because the
//! compressed bytes on disk cannot be shortened.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::codec::CompressionMethod;
use crate::error::FormatError;

/// Encoded size of one [`Block`].
pub const BLOCK_WIRE_SIZE: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Block {
    pub logical_offset:  u64,
    pub logical_length:  u32,
    pub original_length: u32,
    pub physical_offset: u64,
    pub physical_length: u32,
    /// Recency marker; higher wins where Blocks overlap.
    pub level:           u32,
    pub method:          CompressionMethod,
}

impl Block {
    /// A freshly written extent.  The level is assigned on insertion.
    pub fn new(
        logical_offset:  u64,
        logical_length:  u32,
        physical_offset: u64,
        physical_length: u32,
        method:          CompressionMethod,
    ) -> Self {
        Self {
            logical_offset,
            logical_length,
            original_length: logical_length,
            physical_offset,
            physical_length,
            level: 0,
            method,
        }
    }

    /// One past the last logical byte covered.
    #[inline]
    pub fn logical_end(&self) -> u64 {
        self.logical_offset + self.logical_length as u64
    }

    /// One past the last physical byte occupied.
    #[inline]
    pub fn physical_end(&self) -> u64 {
        self.physical_offset + self.physical_length as u64
    }

    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        self.logical_offset <= offset && offset < self.logical_end()
    }

    /// True while no truncation has cut into this Block.
    #[inline]
    pub fn is_whole(&self) -> bool {
        self.logical_length == self.original_length
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.logical_offset)?;
        writer.write_u32::<LittleEndian>(self.logical_length)?;
        writer.write_u32::<LittleEndian>(self.original_length)?;
        writer.write_u64::<LittleEndian>(self.physical_offset)?;
        writer.write_u32::<LittleEndian>(self.physical_length)?;
        writer.write_u32::<LittleEndian>(self.level)?;
        writer.write_u8(self.method.tag())?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, FormatError> {
        let logical_offset  = reader.read_u64::<LittleEndian>()?;
        let logical_length  = reader.read_u32::<LittleEndian>()?;
        let original_length = reader.read_u32::<LittleEndian>()?;
        let physical_offset = reader.read_u64::<LittleEndian>()?;
        let physical_length = reader.read_u32::<LittleEndian>()?;
        let level           = reader.read_u32::<LittleEndian>()?;
        let tag             = reader.read_u8()?;
        let method = CompressionMethod::try_from(tag)
            .map_err(|_| FormatError::UnknownMethod(tag))?;

        if logical_length == 0 {
            return Err(FormatError::Malformed(format!(
                "zero-length block at logical 0x{logical_offset:x}"
            )));
        }
        if logical_length > original_length {
            return Err(FormatError::Malformed(format!(
                "block at logical 0x{logical_offset:x} covers {logical_length} bytes \
                 but decompresses to {original_length}"
            )));
        }
        Ok(Self {
            logical_offset,
            logical_length,
            original_length,
            physical_offset,
            physical_length,
            level,
            method,
        })
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "offset: 0x{:x}, length: 0x{:x}, olength: 0x{:x}, level: 0x{:x}, \
             coffset: 0x{:x}, clength: 0x{:x}, method: {}",
            self.logical_offset, self.logical_length, self.original_length, self.level,
            self.physical_offset, self.physical_length, self.method,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        let mut b = Block::new(0x1000, 500, 32, 120, CompressionMethod::Lz4);
        b.level = 7;
        b
    }

    #[test]
    fn wire_size_is_fixed() {
        let mut buf = Vec::new();
        block().write(&mut buf).unwrap();
        assert_eq!(buf.len(), BLOCK_WIRE_SIZE);
        assert_eq!(buf[32], CompressionMethod::Lz4.tag());
        assert_eq!(&buf[..8], &0x1000u64.to_le_bytes());
    }

    #[test]
    fn decode_restores_every_field() {
        let mut buf = Vec::new();
        let mut b = block();
        b.logical_length = 200;
        b.write(&mut buf).unwrap();
        assert_eq!(Block::read(&buf[..]).unwrap(), b);
    }

    #[test]
    fn unknown_method_rejected() {
        let mut buf = Vec::new();
        block().write(&mut buf).unwrap();
        buf[32] = 42;
        assert!(matches!(Block::read(&buf[..]), Err(FormatError::UnknownMethod(42))));
    }

    #[test]
    fn zero_length_rejected() {
        let mut b = block();
        b.logical_length = 0;
        let mut buf = Vec::new();
        b.write(&mut buf).unwrap();
        assert!(matches!(Block::read(&buf[..]), Err(FormatError::Malformed(_))));
    }

    #[test]
    fn short_input_is_io_error() {
        let mut buf = Vec::new();
        block().write(&mut buf).unwrap();
        assert!(matches!(Block::read(&buf[..20]), Err(FormatError::Io(_))));
    }

    #[test]
    fn extents() {
        let b = block();
        assert_eq!(b.logical_end(), 0x1000 + 500);
        assert_eq!(b.physical_end(), 152);
        assert!(b.contains(0x1000));
        assert!(!b.contains(0x1000 + 500));
        assert!(b.is_whole());
    }
}
