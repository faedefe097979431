//! Content sniffing: is an incoming buffer already in a compressed format?
//!
//! Consulted once per file, on the first write to offset 0 of a file that
//! is still empty.  A positive answer makes the engine store the file
//! plainly.

use std::collections::BTreeSet;
use std::fmt;

pub trait ContentSniffer: Send + Sync {
    fn looks_already_compressed(&self, buf: &[u8]) -> bool;
}

/// Never reports compressed content.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSniffer;

impl ContentSniffer for NoSniffer {
    fn looks_already_compressed(&self, _buf: &[u8]) -> bool { false }
}

// ── Signature table ─────────────────────────────────────────────────────────

struct Signature {
    mime:   &'static str,
    offset: usize,
    bytes:  &'static [u8],
}

const fn sig(mime: &'static str, offset: usize, bytes: &'static [u8]) -> Signature {
    Signature { mime, offset, bytes }
}

static SIGNATURES: &[Signature] = &[
    sig("application/x-gzip",           0, b"\x1f\x8b"),
    sig("application/x-bzip2",          0, b"BZh"),
    sig("application/x-xz",             0, b"\xfd7zXZ\x00"),
    sig("application/zstd",             0, b"\x28\xb5\x2f\xfd"),
    sig("application/x-compress",       0, b"\x1f\x9d"),
    sig("application/x-zip",            0, b"PK\x03\x04"),
    sig("application/x-rar",            0, b"Rar!\x1a\x07"),
    sig("application/x-7z-compressed",  0, b"7z\xbc\xaf\x27\x1c"),
    sig("application/x-lharc",          2, b"-lh"),
    sig("application/x-arj",            0, b"\x60\xea"),
    sig("application/x-zoo",            20, b"\xdc\xa7\xc4\xfd"),
    sig("application/x-rpm",            0, b"\xed\xab\xee\xdb"),
    sig("application/x-debian-package", 0, b"!<arch>\ndebian"),
    sig("application/x-shockwave-flash", 0, b"CWS"),
    sig("application/ogg",              0, b"OggS"),
    sig("application/pdf",              0, b"%PDF-"),
    sig("audio/mpeg",                   0, b"ID3"),
    sig("audio/mpeg",                   0, b"\xff\xfb"),
    sig("image/png",                    0, b"\x89PNG\r\n\x1a\n"),
    sig("image/jpeg",                   0, b"\xff\xd8\xff"),
    sig("image/gif",                    0, b"GIF8"),
    sig("image/jp2",                    4, b"jP  \r\n\x87\n"),
    sig("video/mp4",                    4, b"ftypisom"),
    sig("video/mp4",                    4, b"ftypmp4"),
    sig("video/3gpp",                   4, b"ftyp3gp"),
    sig("video/quicktime",              4, b"ftypqt"),
    sig("video/quicktime",              4, b"moov"),
    sig("video/mpeg",                   0, b"\x00\x00\x01\xba"),
    sig("video/mpeg",                   0, b"\x00\x00\x01\xb3"),
];

/// The mime types treated as already compressed by default.
const DEFAULT_MIMES: &[&str] = &[
    "application/ogg",
    "application/pdf",
    "application/x-7z-compressed",
    "application/x-arj",
    "application/x-bzip2",
    "application/x-compress",
    "application/x-debian-package",
    "application/x-gzip",
    "application/x-lharc",
    "application/x-rar",
    "application/x-rpm",
    "application/x-shockwave-flash",
    "application/x-xz",
    "application/x-zip",
    "application/x-zoo",
    "application/zstd",
    "audio/mpeg",
    "image/gif",
    "image/jp2",
    "image/jpeg",
    "image/png",
    "video/3gpp",
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
];

/// Signature-based sniffer with an editable set of compressed mime types.
#[derive(Debug, Clone)]
pub struct MagicSniffer {
    mimes: BTreeSet<String>,
}

impl Default for MagicSniffer {
    fn default() -> Self {
        Self { mimes: DEFAULT_MIMES.iter().map(|m| m.to_string()).collect() }
    }
}

impl MagicSniffer {
    pub fn new() -> Self { Self::default() }

    /// Add `;`-separated mime types to the compressed set.
    pub fn add(&mut self, list: &str) {
        self.mimes.extend(split_mimes(list));
    }

    /// Remove `;`-separated mime types from the compressed set.
    pub fn remove(&mut self, list: &str) {
        for m in split_mimes(list) {
            self.mimes.remove(&m);
        }
    }

    pub fn contains(&self, mime: &str) -> bool {
        self.mimes.contains(&mime.to_ascii_lowercase())
    }

    /// Mime type recognised from the leading bytes of `buf`.
    pub fn detect(buf: &[u8]) -> Option<&'static str> {
        SIGNATURES
            .iter()
            .find(|s| buf.get(s.offset..s.offset + s.bytes.len()) == Some(s.bytes))
            .map(|s| s.mime)
    }
}

impl ContentSniffer for MagicSniffer {
    fn looks_already_compressed(&self, buf: &[u8]) -> bool {
        match Self::detect(buf) {
            Some(mime) => {
                let hit = self.mimes.contains(mime);
                tracing::trace!(mime, hit, "sniffed");
                hit
            }
            None => false,
        }
    }
}

impl fmt::Display for MagicSniffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.mimes.iter().map(String::len).max().unwrap_or(0) + 5;
        let cols = (78 / width).max(1);
        for (i, m) in self.mimes.iter().enumerate() {
            write!(f, "{m:<width$}")?;
            if (i + 1) % cols == 0 {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

fn split_mimes(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(';')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_formats() {
        assert_eq!(MagicSniffer::detect(b"\x1f\x8b\x08\x00rest"), Some("application/x-gzip"));
        assert_eq!(MagicSniffer::detect(b"\x89PNG\r\n\x1a\n...."), Some("image/png"));
        assert_eq!(MagicSniffer::detect(b"\x00\x00\x00\x18ftypisom"), Some("video/mp4"));
        assert_eq!(MagicSniffer::detect(b"plain old text"), None);
        assert_eq!(MagicSniffer::detect(b""), None);
    }

    #[test]
    fn default_set_flags_archives() {
        let s = MagicSniffer::new();
        assert!(s.looks_already_compressed(b"PK\x03\x04zipdata"));
        assert!(!s.looks_already_compressed(b"#!/bin/sh\necho hi\n"));
    }

    #[test]
    fn edit_set() {
        let mut s = MagicSniffer::new();
        s.remove("image/png; application/x-gzip");
        assert!(!s.looks_already_compressed(b"\x89PNG\r\n\x1a\n...."));
        assert!(!s.looks_already_compressed(b"\x1f\x8b\x08"));
        s.add("IMAGE/PNG");
        assert!(s.contains("image/png"));
        assert!(s.looks_already_compressed(b"\x89PNG\r\n\x1a\n...."));
    }

    #[test]
    fn no_sniffer() {
        assert!(!NoSniffer.looks_already_compressed(b"\x1f\x8b\x08\x00"));
    }

    #[test]
    fn listing_mentions_every_mime() {
        let s = MagicSniffer::new();
        let text = s.to_string();
        assert!(DEFAULT_MIMES.iter().all(|m| text.contains(m)));
    }
}
