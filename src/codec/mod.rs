//! Transform set: the compression methods a Block or index may be stored with.
//!
//! # Identity rules
//! Every method is identified by a one-byte tag.  That tag is:
//!   - Written into every Block record on disk.
//!   - Written into the file header for the serialized block index.
//!
//! Tags are permanent.  A tag is NEVER reused or renumbered, even if a method
//! is deprecated; new methods take the next free value.  A reader that meets
//! an unknown tag reports [`CodecError::UnknownMethod`] and the caller decides
//! whether that is fatal (a Block) or means "not our file" (a header).
//!
//! # Dispatch
//! The method set is small, closed and versioned with the on-disk format, so
//! dispatch is a `match` over [`CompressionMethod`] rather than trait objects.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key used by the XOR transform.
const XOR_KEY: u8 = b'2';

/// Streaming buffer size for brotli.
const BROTLI_BUFFER: usize = 4096;
/// Brotli window (log2).
const BROTLI_LGWIN: u32 = 22;

// ── CompressionMethod ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    /// Payload stored verbatim.
    None   = 0,
    /// Byte-wise XOR with a constant key.  Obfuscation only, never shrinks.
    Xor    = 1,
    /// Zstandard, the default.
    Zstd   = 2,
    /// LZ4: fastest, lower ratio.
    Lz4    = 3,
    /// Brotli: high ratio on text.
    Brotli = 4,
    /// LZMA: highest ratio, slowest.
    Lzma   = 5,
}

impl Default for CompressionMethod {
    fn default() -> Self { CompressionMethod::Zstd }
}

impl CompressionMethod {
    pub const ALL: [CompressionMethod; 6] = [
        CompressionMethod::None,
        CompressionMethod::Xor,
        CompressionMethod::Zstd,
        CompressionMethod::Lz4,
        CompressionMethod::Brotli,
        CompressionMethod::Lzma,
    ];

    /// The on-disk tag.
    #[inline]
    pub fn tag(self) -> u8 { self as u8 }

    /// Human-readable name (CLI, config, diagnostics).
    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::None   => "none",
            CompressionMethod::Xor    => "xor",
            CompressionMethod::Zstd   => "zstd",
            CompressionMethod::Lz4    => "lz4",
            CompressionMethod::Brotli => "brotli",
            CompressionMethod::Lzma   => "lzma",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"   => Some(CompressionMethod::None),
            "xor"    => Some(CompressionMethod::Xor),
            "zstd"   => Some(CompressionMethod::Zstd),
            "lz4"    => Some(CompressionMethod::Lz4),
            "brotli" => Some(CompressionMethod::Brotli),
            "lzma"   => Some(CompressionMethod::Lzma),
            _        => None,
        }
    }

    /// Compress `data`.  `level` is honoured by zstd (1-19) and brotli
    /// (0-11) and ignored by the other methods.
    pub fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        match self {
            CompressionMethod::None => Ok(data.to_vec()),
            CompressionMethod::Xor  => Ok(xor(data)),
            CompressionMethod::Zstd => {
                zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
            }
            CompressionMethod::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionMethod::Brotli => {
                let quality = level.clamp(0, 11) as u32;
                let mut out = Vec::new();
                {
                    let mut w = brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, quality, BROTLI_LGWIN);
                    w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
                }
                Ok(out)
            }
            CompressionMethod::Lzma => {
                let mut out = Vec::new();
                lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
                    .map_err(|e| CodecError::Compression(e.to_string()))?;
                Ok(out)
            }
        }
    }

    /// Decompress a whole payload and check it yields exactly
    /// `expected_len` bytes.
    pub fn decompress(self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let out = match self {
            CompressionMethod::None => data.to_vec(),
            CompressionMethod::Xor  => xor(data),
            CompressionMethod::Zstd => {
                zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))?
            }
            CompressionMethod::Lz4 => {
                // The prefix sizes the output buffer.
                let prefix = data.get(..4).map(LittleEndian::read_u32);
                if prefix != Some(expected_len as u32) || expected_len > u32::MAX as usize {
                    return Err(CodecError::Decompression(format!(
                        "lz4 size prefix {prefix:?} does not match expected {expected_len} bytes"
                    )));
                }
                lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?
            }
            CompressionMethod::Brotli => {
                let mut out = Vec::with_capacity(expected_len);
                brotli::Decompressor::new(data, BROTLI_BUFFER)
                    .read_to_end(&mut out)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                out
            }
            CompressionMethod::Lzma => {
                let mut out = Vec::with_capacity(expected_len);
                lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                out
            }
        };
        if out.len() != expected_len {
            return Err(CodecError::Decompression(format!(
                "{} stream yielded {} bytes, expected {expected_len}",
                self.name(), out.len(),
            )));
        }
        Ok(out)
    }

    /// Decompress only the first `want` bytes of a payload whose full
    /// decompressed size is `expected_len`.
    ///
    /// Streaming methods stop as soon as `want` bytes are produced; the
    /// block-oriented ones (lz4, lzma) decompress everything and truncate.
    pub fn decompress_prefix(
        self,
        data:         &[u8],
        expected_len: usize,
        want:         usize,
    ) -> Result<Vec<u8>, CodecError> {
        if want > expected_len {
            return Err(CodecError::Decompression(format!(
                "prefix of {want} bytes requested from a {expected_len}-byte stream"
            )));
        }
        match self {
            CompressionMethod::None | CompressionMethod::Xor => {
                if data.len() != expected_len {
                    return Err(CodecError::Decompression(format!(
                        "{} payload is {} bytes, expected {expected_len}",
                        self.name(), data.len(),
                    )));
                }
                let prefix = &data[..want];
                Ok(if self == CompressionMethod::Xor { xor(prefix) } else { prefix.to_vec() })
            }
            CompressionMethod::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(data)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                read_prefix(decoder, want)
            }
            CompressionMethod::Brotli => {
                read_prefix(brotli::Decompressor::new(data, BROTLI_BUFFER), want)
            }
            CompressionMethod::Lz4 | CompressionMethod::Lzma => {
                let mut out = self.decompress(data, expected_len)?;
                out.truncate(want);
                Ok(out)
            }
        }
    }
}

impl TryFrom<u8> for CompressionMethod {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Xor),
            2 => Ok(CompressionMethod::Zstd),
            3 => Ok(CompressionMethod::Lz4),
            4 => Ok(CompressionMethod::Brotli),
            5 => Ok(CompressionMethod::Lzma),
            t => Err(CodecError::UnknownMethod(t)),
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Unknown compression method tag {0}")]
    UnknownMethod(u8),
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ XOR_KEY).collect()
}

fn read_prefix<R: Read>(mut reader: R, want: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![0u8; want];
    reader.read_exact(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Vec<u8> {
        b"The quick brown fox jumps over the lazy dog. ".repeat(64)
    }

    #[test]
    fn tags_are_stable() {
        let tags: Vec<u8> = CompressionMethod::ALL.iter().map(|m| m.tag()).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4, 5]);
        for m in CompressionMethod::ALL {
            assert_eq!(CompressionMethod::try_from(m.tag()).unwrap(), m);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(CompressionMethod::try_from(6), Err(CodecError::UnknownMethod(6))));
        assert!(matches!(CompressionMethod::try_from(255), Err(CodecError::UnknownMethod(255))));
    }

    #[test]
    fn lz4_size_prefix_checked_before_decoding() {
        let data = sample();
        let mut packed = CompressionMethod::Lz4.compress(&data, 0).unwrap();
        packed[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            CompressionMethod::Lz4.decompress(&packed, data.len()),
            Err(CodecError::Decompression(_))
        ));
        assert!(CompressionMethod::Lz4.decompress(&[1, 2], data.len()).is_err());
    }

    #[test]
    fn names_round_trip() {
        for m in CompressionMethod::ALL {
            assert_eq!(CompressionMethod::from_name(m.name()), Some(m));
        }
        assert_eq!(CompressionMethod::from_name("ZSTD"), Some(CompressionMethod::Zstd));
        assert_eq!(CompressionMethod::from_name("gzip"), None);
    }

    #[test]
    fn empty_and_zero_buffers() {
        for m in CompressionMethod::ALL {
            let c = m.compress(&[], 3).unwrap();
            assert!(m.decompress(&c, 0).unwrap().is_empty(), "{m}");

            let zeros = vec![0u8; 10_000];
            let c = m.compress(&zeros, 3).unwrap();
            assert_eq!(m.decompress(&c, zeros.len()).unwrap(), zeros, "{m}");
        }
    }

    #[test]
    fn compressors_shrink_text() {
        let data = sample();
        for m in [CompressionMethod::Zstd, CompressionMethod::Lz4, CompressionMethod::Brotli, CompressionMethod::Lzma] {
            assert!(m.compress(&data, 3).unwrap().len() < data.len() / 4, "{m}");
        }
    }

    #[test]
    fn xor_is_not_identity() {
        let data = sample();
        let c = CompressionMethod::Xor.compress(&data, 0).unwrap();
        assert_eq!(c.len(), data.len());
        assert_ne!(c, data);
    }

    #[test]
    fn length_mismatch_is_corrupt() {
        let data = sample();
        let c = CompressionMethod::Zstd.compress(&data, 3).unwrap();
        assert!(CompressionMethod::Zstd.decompress(&c, data.len() + 1).is_err());
    }

    #[test]
    fn garbage_is_corrupt() {
        let junk = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02];
        for m in [CompressionMethod::Zstd, CompressionMethod::Lz4, CompressionMethod::Lzma] {
            assert!(m.decompress(&junk, 100).is_err(), "{m}");
        }
    }

    #[test]
    fn prefix_matches_full() {
        let data = sample();
        for m in CompressionMethod::ALL {
            let c = m.compress(&data, 3).unwrap();
            for want in [0, 1, 100, data.len()] {
                let p = m.decompress_prefix(&c, data.len(), want).unwrap();
                assert_eq!(p, &data[..want], "{m} want={want}");
            }
        }
    }

    #[test]
    fn prefix_larger_than_stream_rejected() {
        let c = CompressionMethod::None.compress(b"abc", 0).unwrap();
        assert!(CompressionMethod::None.decompress_prefix(&c, 3, 4).is_err());
    }

    proptest! {
        #[test]
        fn round_trip_every_method(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            for m in CompressionMethod::ALL {
                let c = m.compress(&data, 3).unwrap();
                prop_assert_eq!(m.decompress(&c, data.len()).unwrap(), data.clone());
            }
        }
    }
}
