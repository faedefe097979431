//! LayerMap: the per-file index of every Block ever written.
//!
//! Compressed extents cannot be edited in place, so every overwrite appends
//! a new Block with a higher level.  The map behaves like a "most recent
//! write wins" interval index: for any logical offset the visible Block is
//! the highest-level Block covering it.
//!
//! # Storage
//! Blocks live in one `Vec`, kept sorted by `logical_offset` ascending and
//! then by `level` descending, so a forward scan meets the most recent Block
//! at each start offset first.  Positions in the vector are never handed
//! out; queries return copies.
//!
//! # Serialized form (little-endian)
//! ```text
//! u32  max_level
//! u32  max_block_length
//! u32  block count
//! N ×  Block (33 bytes each, see block.rs)
//! u32  CRC32 of everything above
//! ```

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::block::{Block, BLOCK_WIRE_SIZE};
use crate::codec::CompressionMethod;
use crate::error::FormatError;

/// Size of the fixed fields around the Block array.
const PREAMBLE_SIZE: usize = 12;
const TRAILER_SIZE:  usize = 4;

#[derive(Debug, Clone)]
pub struct LayerMap {
    blocks:           Vec<Block>,
    /// Next level to hand out.
    max_level:        u32,
    /// Largest logical length ever inserted; bounds the backward search.
    max_block_length: u32,
    dirty:            bool,
}

impl Default for LayerMap {
    fn default() -> Self { Self::new() }
}

impl LayerMap {
    pub fn new() -> Self {
        Self {
            blocks:           Vec::new(),
            max_level:        1,
            max_block_length: 0,
            dirty:            false,
        }
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Insert a Block.
    ///
    /// With `preserve_level == false` (the write path) the Block gets the
    /// next level; with `true` (index restore) its stored level is kept.
    pub fn put(&mut self, mut block: Block, preserve_level: bool) {
        if preserve_level {
            self.max_level = self.max_level.max(block.level.saturating_add(1));
        } else {
            block.level = self.max_level;
            self.max_level += 1;
        }
        let at = self.blocks.partition_point(|b| {
            b.logical_offset < block.logical_offset
                || (b.logical_offset == block.logical_offset && b.level > block.level)
        });
        self.blocks.insert(at, block);
        self.max_block_length = self.max_block_length.max(block.logical_length);
        self.dirty = true;
    }

    /// Drop everything at or beyond `offset` and shorten Blocks that
    /// straddle it.
    pub fn truncate(&mut self, offset: u64) {
        self.blocks.retain(|b| b.logical_offset < offset);
        for b in self.blocks.iter_mut() {
            if b.logical_end() > offset {
                b.logical_length = (offset - b.logical_offset) as u32;
            }
        }
        self.dirty = true;
    }

    /// Forget every Block.  The result is a pristine, clean map.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Resolve what is visible at `offset`.
    ///
    /// Returns the covering Block with the highest level together with the
    /// number of bytes, starting at `offset`, that may be read from it before
    /// the Block ends or a higher-level Block starts.  When nothing covers
    /// `offset` but a Block starts later, that Block is returned with a
    /// visible length of 0 so the caller can zero-fill up to its start.
    /// `None` means nothing exists at or after `offset`.
    pub fn get(&self, offset: u64) -> Option<(Block, u64)> {
        // Nothing starting before this index can reach `offset`.
        let window = self.max_block_length as u64;
        let start = self.blocks.partition_point(|b| b.logical_offset + window <= offset);

        let mut best: Option<&Block> = None;
        let mut next = start;
        for b in &self.blocks[start..] {
            if b.logical_offset > offset {
                break;
            }
            next += 1;
            if b.contains(offset) && best.map_or(true, |cur| b.level > cur.level) {
                best = Some(b);
            }
        }

        let best = match best {
            Some(b) => b,
            None    => return self.blocks.get(next).map(|b| (*b, 0)),
        };

        // The first higher-level Block starting ahead of `offset` and inside
        // `best` cuts the visible run short.
        let mut limit = best.logical_end();
        for n in &self.blocks[next..] {
            if n.logical_offset >= limit {
                break;
            }
            if n.level > best.level {
                limit = n.logical_offset;
                break;
            }
        }
        Some((*best, limit - offset))
    }

    /// Number of bytes in `[0, limit)` that some Block makes visible.
    pub fn visible_bytes(&self, limit: u64) -> u64 {
        let mut offset  = 0u64;
        let mut visible = 0u64;
        while offset < limit {
            match self.get(offset) {
                None => break,
                Some((b, 0)) => offset = b.logical_offset.min(limit),
                Some((_, len)) => {
                    let take = len.min(limit - offset);
                    visible += take;
                    offset  += take;
                }
            }
        }
        visible
    }

    /// Σ logical length over all Blocks, shadowed ones included.
    pub fn stored_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.logical_length as u64).sum()
    }

    /// Σ compressed length over all Blocks.
    pub fn physical_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.physical_length as u64).sum()
    }

    /// True when every Block is still whole (never cut by truncation).
    pub fn all_whole(&self) -> bool {
        self.blocks.iter().all(Block::is_whole)
    }

    /// True when every Block was produced by `method`, or stored plainly
    /// because `method` did not shrink it.
    pub fn is_compressed_only_with(&self, method: CompressionMethod) -> bool {
        self.blocks
            .iter()
            .all(|b| b.method == method || b.method == CompressionMethod::None)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> { self.blocks.iter() }
    pub fn len(&self) -> usize { self.blocks.len() }
    pub fn is_empty(&self) -> bool { self.blocks.is_empty() }
    pub fn max_level(&self) -> u32 { self.max_level }
    pub fn max_block_length(&self) -> u32 { self.max_block_length }
    pub fn is_dirty(&self) -> bool { self.dirty }
    pub fn mark_clean(&mut self) { self.dirty = false; }

    // ── Serialization ───────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            PREAMBLE_SIZE + self.blocks.len() * BLOCK_WIRE_SIZE + TRAILER_SIZE,
        );
        // Writes into a Vec cannot fail.
        let _ = out.write_u32::<LittleEndian>(self.max_level);
        let _ = out.write_u32::<LittleEndian>(self.max_block_length);
        let _ = out.write_u32::<LittleEndian>(self.blocks.len() as u32);
        for b in &self.blocks {
            let _ = b.write(&mut out);
        }
        let mut hasher = Hasher::new();
        hasher.update(&out);
        let _ = out.write_u32::<LittleEndian>(hasher.finalize());
        out
    }

    /// Rebuild a map from [`LayerMap::to_bytes`] output.  The result is clean.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < PREAMBLE_SIZE + TRAILER_SIZE {
            return Err(FormatError::Truncated {
                needed:    (PREAMBLE_SIZE + TRAILER_SIZE) as u64,
                available: bytes.len() as u64,
            });
        }
        let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_SIZE);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let mut hasher = Hasher::new();
        hasher.update(body);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(FormatError::ChecksumMismatch { stored, computed });
        }

        let mut cur = Cursor::new(body);
        let max_level        = cur.read_u32::<LittleEndian>()?;
        let max_block_length = cur.read_u32::<LittleEndian>()?;
        let count            = cur.read_u32::<LittleEndian>()? as usize;

        let needed = PREAMBLE_SIZE + count * BLOCK_WIRE_SIZE;
        if body.len() != needed {
            return Err(FormatError::Truncated {
                needed:    needed as u64,
                available: body.len() as u64,
            });
        }

        let mut map = Self::new();
        map.blocks.reserve_exact(count);
        for _ in 0..count {
            map.put(Block::read(&mut cur)?, true);
        }
        if map.max_block_length > max_block_length {
            return Err(FormatError::Malformed(format!(
                "block of {} bytes exceeds recorded maximum {max_block_length}",
                map.max_block_length,
            )));
        }
        map.max_level        = map.max_level.max(max_level);
        map.max_block_length = max_block_length;
        map.dirty            = false;
        Ok(map)
    }
}

impl fmt::Display for LayerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "-- max_level: 0x{:x}, max_length: 0x{:x} -------",
            self.max_level, self.max_block_length,
        )?;
        for b in &self.blocks {
            writeln!(f, "{b}")?;
        }
        write!(f, "---------")
    }
}
