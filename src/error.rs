//! Error taxonomy shared by every layer of the engine.
//!
//! Two levels:
//! - [`FormatError`] describes bytes on disk that do not parse (bad header
//!   magic, unknown method tag, truncated or checksum-failing index).  A
//!   header-level `FormatError` is resolved locally by treating the raw file
//!   as not compressed; it never reaches the caller.
//! - [`Error`] is what engine operations return.  Data-level and I/O-level
//!   failures are always surfaced, never masked, and map onto POSIX errno
//!   values through [`Error::to_errno`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic {0:02x?}")]
    InvalidMagic([u8; 3]),
    #[error("Unknown compression method tag {0}")]
    UnknownMethod(u8),
    #[error("Truncated record: needed {needed} bytes, {available} available")]
    Truncated { needed: u64, available: u64 },
    #[error("Checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Malformed record: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    /// The header is valid but the block index it points at cannot be read.
    #[error("Cannot restore block index of {}: {source}", path.display())]
    Index {
        path:   PathBuf,
        #[source]
        source: FormatError,
    },
    /// A block's compressed bytes failed to decompress.
    #[error("Corrupt block at logical 0x{logical_offset:x} (physical 0x{physical_offset:x}): {source}")]
    CorruptBlock {
        logical_offset:  u64,
        physical_offset: u64,
        #[source]
        source:          CodecError,
    },
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },
    #[error("File is not open")]
    NotOpen,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Index { .. }        => libc::EIO,
            Error::CorruptBlock { .. } => libc::EIO,
            Error::Codec(_)            => libc::EIO,
            Error::Io(e)               => e.raw_os_error().unwrap_or(libc::EIO),
            Error::OutOfMemory { .. }  => libc::ENOMEM,
            Error::NotOpen             => libc::EBADF,
        }
    }
}

/// Collapse a result into the hook layer's convention: the non-negative
/// value on success, `-errno` on failure.
pub fn errno_result<T: TryInto<i64>>(r: Result<T>) -> i64 {
    match r {
        Ok(v)  => v.try_into().unwrap_or(i64::MAX),
        Err(e) => -(e.to_errno() as i64),
    }
}

/// Allocate a zeroed buffer of `len` bytes, reporting allocation failure
/// instead of aborting the process.
pub fn try_alloc(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_error_is_eio() {
        let err = Error::Index {
            path:   PathBuf::from("a"),
            source: FormatError::UnknownMethod(9),
        };
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn corrupt_block_is_eio() {
        let err = Error::CorruptBlock {
            logical_offset:  0,
            physical_offset: 32,
            source:          CodecError::Decompression("bad frame".into()),
        };
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn io_error_keeps_os_code() {
        let err = Error::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
        let err = Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn not_open_and_oom() {
        assert_eq!(Error::NotOpen.to_errno(), libc::EBADF);
        assert_eq!(Error::OutOfMemory { bytes: 1 }.to_errno(), libc::ENOMEM);
    }

    #[test]
    fn errno_result_convention() {
        assert_eq!(errno_result(Ok(12usize)), 12);
        assert_eq!(errno_result::<usize>(Err(Error::NotOpen)), -(libc::EBADF as i64));
    }

    #[test]
    fn try_alloc_zeroed() {
        let buf = try_alloc(16).unwrap();
        assert_eq!(buf, vec![0u8; 16]);
    }
}
