//! The compress engine: one `CompressedFile` per logical file.
//!
//! A raw file is either managed (Compressed: header, Block payloads, index)
//! or a plain pass-through (NotCompressed).  The decision is taken once when
//! the object is built:
//!
//! - raw size 0 → Compressed, header region reserved;
//! - raw size below the header region → NotCompressed;
//! - otherwise Compressed iff a valid header is found.
//!
//! The only later transition is Compressed → NotCompressed on the first
//! write to a still empty file whose content sniffs as already compressed.
//!
//! Callers serialise access: every method takes `&mut self` and the owning
//! registry wraps each object in a mutex.

use std::borrow::Cow;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::block::Block;
use crate::codec::CompressionMethod;
use crate::config::EngineConfig;
use crate::error::{try_alloc, Error, FormatError, Result};
use crate::header::{self, FileHeader, HEADER_REGION, INDEX_PREFIX_SIZE};
use crate::layer_map::LayerMap;
use crate::raw::{self, RememberTimes, Xattrs};
use crate::sniff::{ContentSniffer, NoSniffer};

/// Re-keys an inode-indexed registry when defragmentation replaces the raw
/// file.  `commit` performs the rename and must run while the registry is
/// locked, so no lookup can observe the new inode without its object.
pub trait InodeRekey: Send + Sync {
    fn rekey(
        &self,
        old:    u64,
        new:    u64,
        commit: &mut dyn FnMut() -> io::Result<()>,
    ) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Compressed,
    NotCompressed,
}

/// What `getattr` reports: the raw file's metadata with the logical size.
#[derive(Debug, Clone, Serialize)]
pub struct FileAttr {
    pub inode:    u64,
    pub mode:     u32,
    pub uid:      u32,
    pub gid:      u32,
    pub nlink:    u64,
    /// Size seen by readers.
    pub size:     u64,
    /// Size of the backing file.
    pub raw_size: u64,
    pub atime:    SystemTime,
    pub mtime:    SystemTime,
    pub ctime:    i64,
}

pub struct CompressedFile {
    path:     PathBuf,
    inode:    u64,
    file:     Option<File>,
    refs:     u32,
    mode:     Mode,
    header:   FileHeader,
    map:      LayerMap,
    /// End of Block data; the next payload is written here.
    raw_size: u64,
    /// An append has overwritten the stored index.
    index_stale: bool,
    unlinked: bool,
    config:   Arc<EngineConfig>,
    sniffer:  Arc<dyn ContentSniffer>,
    rekey:    Option<Weak<dyn InodeRekey>>,
}

impl std::fmt::Debug for CompressedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedFile")
            .field("path", &self.path)
            .field("inode", &self.inode)
            .field("refs", &self.refs)
            .field("mode", &self.mode)
            .field("header", &self.header)
            .field("blocks", &self.map.len())
            .field("raw_size", &self.raw_size)
            .finish()
    }
}

impl CompressedFile {
    /// Build the object for an existing (or about to be created) raw file.
    pub fn new(
        path:    impl Into<PathBuf>,
        config:  Arc<EngineConfig>,
        sniffer: Arc<dyn ContentSniffer>,
    ) -> Result<Self> {
        let path = path.into();
        let (inode, size, regular) = match fs::metadata(&path) {
            Ok(meta) => (meta.ino(), meta.len(), meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (0, 0, true),
            Err(e) => return Err(e.into()),
        };

        let mut this = Self {
            path,
            inode,
            file:     None,
            refs:     0,
            mode:     Mode::Compressed,
            header:   FileHeader::new(config.index_method),
            map:      LayerMap::new(),
            raw_size: HEADER_REGION,
            index_stale: false,
            unlinked: false,
            config,
            sniffer,
            rekey:    None,
        };

        if !regular {
            this.mode = Mode::NotCompressed;
        } else if size == 0 {
            // Fresh file.
        } else if size < HEADER_REGION {
            this.mode = Mode::NotCompressed;
        } else {
            let mut region = [0u8; HEADER_REGION as usize];
            File::open(&this.path)?.read_exact_at(&mut region, 0)?;
            match FileHeader::read(&region[..]) {
                Ok(h) => {
                    this.header   = h;
                    this.raw_size = if h.index_offset == 0 { HEADER_REGION } else { size };
                }
                Err(e) => {
                    trace!(path = %this.path.display(), %e, "no header, plain file");
                    this.mode = Mode::NotCompressed;
                }
            }
        }
        debug!(path = %this.path.display(), mode = ?this.mode, size, "file object built");
        Ok(this)
    }

    /// An object that stores its content plainly regardless of what is on
    /// disk.  Used for decompressed output.
    pub fn plain(path: impl Into<PathBuf>, config: Arc<EngineConfig>) -> Result<Self> {
        let path = path.into();
        let inode = match fs::metadata(&path) {
            Ok(meta) => meta.ino(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inode,
            file:     None,
            refs:     0,
            mode:     Mode::NotCompressed,
            header:   FileHeader::new(config.index_method),
            map:      LayerMap::new(),
            raw_size: 0,
            index_stale: false,
            unlinked: false,
            config,
            sniffer:  Arc::new(NoSniffer),
            rekey:    None,
        })
    }

    pub fn set_rekey(&mut self, rekey: Weak<dyn InodeRekey>) {
        self.rekey = Some(rekey);
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path { &self.path }
    pub fn inode(&self) -> u64 { self.inode }
    pub fn refs(&self) -> u32 { self.refs }
    pub fn mode(&self) -> Mode { self.mode }
    pub fn is_compressed(&self) -> bool { self.mode == Mode::Compressed }
    pub fn header(&self) -> &FileHeader { &self.header }
    pub fn layer_map(&self) -> &LayerMap { &self.map }
    pub fn raw_size(&self) -> u64 { self.raw_size }

    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    /// Logical size as readers see it.
    pub fn size(&self) -> Result<u64> {
        match self.mode {
            Mode::Compressed    => Ok(self.header.logical_size),
            Mode::NotCompressed => match &self.file {
                Some(f) => Ok(f.metadata()?.len()),
                None    => Ok(fs::metadata(&self.path)?.len()),
            },
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    pub fn open(&mut self) -> Result<()> {
        if self.refs > 0 {
            self.refs += 1;
            return Ok(());
        }
        let file = raw::open_rw(&self.path)?;
        let meta = file.metadata()?;
        self.inode = meta.ino();

        if self.mode == Mode::Compressed && self.header.index_offset != 0 {
            if let Err(source) = self.restore_index(&file, meta.len()) {
                error!(path = %self.path.display(), %source, "cannot restore block index");
                self.map.clear();
                return Err(Error::Index { path: self.path.clone(), source });
            }
        }
        self.file = Some(file);
        self.refs = 1;
        debug!(path = %self.path.display(), blocks = self.map.len(), raw_size = self.raw_size, "opened");
        Ok(())
    }

    /// Drop one handle.  The last one persists index and header.
    pub fn release(&mut self) -> Result<()> {
        if self.refs == 0 {
            return Err(Error::NotOpen);
        }
        self.refs -= 1;
        if self.refs > 0 {
            return Ok(());
        }
        let stored = if self.is_compressed() && !self.unlinked {
            self.store()
        } else {
            Ok(())
        };
        if self.is_compressed() {
            self.map.clear();
        }
        self.file = None;
        debug!(path = %self.path.display(), "released");
        stored
    }

    pub fn unlink(&mut self) -> Result<()> {
        fs::remove_file(&self.path)?;
        self.detach();
        debug!(path = %self.path.display(), refs = self.refs, "unlinked");
        Ok(())
    }

    /// The raw file no longer has a name (unlinked or renamed over).
    /// Open handles keep reading; nothing is stored on release.
    pub(crate) fn detach(&mut self) {
        self.unlinked = true;
        if self.refs == 0 {
            self.map.clear();
        }
    }

    pub fn getattr(&self) -> Result<FileAttr> {
        let meta = match &self.file {
            Some(f) => f.metadata()?,
            None    => fs::metadata(&self.path)?,
        };
        let size = match self.mode {
            Mode::Compressed    => self.header.logical_size,
            Mode::NotCompressed => meta.len(),
        };
        Ok(FileAttr {
            inode:    meta.ino(),
            mode:     meta.mode(),
            uid:      meta.uid(),
            gid:      meta.gid(),
            nlink:    meta.nlink(),
            size,
            raw_size: meta.len(),
            atime:    meta.accessed()?,
            mtime:    meta.modified()?,
            ctime:    meta.ctime(),
        })
    }

    // ── Data path ───────────────────────────────────────────────────────────

    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;

        if self.is_pristine()
            && offset == 0
            && !buf.is_empty()
            && self.sniffer.looks_already_compressed(buf)
        {
            file.set_len(0)?;
            self.mode = Mode::NotCompressed;
            debug!(path = %self.path.display(), "content already compressed, storing plainly");
        }

        if self.mode == Mode::NotCompressed {
            file.write_all_at(buf, offset)?;
            return Ok(buf.len());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if offset == self.header.logical_size && raw::is_zero_only(buf) {
            self.header.logical_size += buf.len() as u64;
            trace!(offset, len = buf.len(), "zero extension");
            return Ok(buf.len());
        }

        let chunk_size = self.config.chunk_size;
        for (i, chunk) in buf.chunks(chunk_size).enumerate() {
            self.append_block(chunk, offset + (i * chunk_size) as u64)?;
        }

        if self.config.wants_defrag(self.raw_size, self.header.logical_size) {
            if self.has_reclaimable() {
                // The Blocks are already on disk and indexed; a failed
                // rewrite only leaves the file fragmented.
                if let Err(e) = self.defragment() {
                    warn!(path = %self.path.display(), %e, "defragmentation failed, write kept");
                }
            } else {
                trace!(path = %self.path.display(), "nothing to reclaim, defragmentation skipped");
            }
        }
        Ok(buf.len())
    }

    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;

        if self.mode == Mode::NotCompressed {
            let mut done = 0;
            while done < buf.len() {
                match file.read_at(&mut buf[done..], offset + done as u64) {
                    Ok(0)  => break,
                    Ok(n)  => done += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(done);
        }

        let size = self.header.logical_size;
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        let out = &mut buf[..len];

        let mut pos = 0usize;
        while pos < len {
            let at = offset + pos as u64;
            let remaining = (len - pos) as u64;
            match self.map.get(at) {
                None => {
                    out[pos..].fill(0);
                    break;
                }
                Some((next, 0)) => {
                    let gap = (next.logical_offset - at).min(remaining) as usize;
                    out[pos..pos + gap].fill(0);
                    pos += gap;
                }
                Some((block, visible)) => {
                    let take = visible.min(remaining) as usize;
                    let skip = (at - block.logical_offset) as usize;
                    let data = load_block(file, &block, skip + take)?;
                    out[pos..pos + take].copy_from_slice(&data[skip..skip + take]);
                    pos += take;
                }
            }
        }
        Ok(len)
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;

        if self.mode == Mode::NotCompressed {
            file.set_len(size)?;
            return Ok(());
        }

        let current = self.header.logical_size;
        if size == 0 {
            self.map.clear();
            self.header.logical_size = 0;
            self.header.index_offset = 0;
            self.raw_size = HEADER_REGION;
            file.set_len(HEADER_REGION)?;
            // The old header would point past the new end of file.
            file.write_all_at(&self.header.to_region(), 0)?;
        } else if size < current {
            self.map.truncate(size);
            self.header.logical_size = size;
            self.defragment()?;
        } else {
            self.header.logical_size = size;
        }
        debug!(path = %self.path.display(), from = current, to = size, "truncated");
        Ok(())
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Persist index then header.  The header goes last so a crash in
    /// between leaves the old header pointing at the old index.
    pub fn store(&mut self) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;
        let times = RememberTimes::capture(file)?;

        if self.map.is_empty() {
            file.set_len(self.raw_size)?;
            self.header.index_offset = 0;
        } else if self.map.is_dirty() || self.index_stale {
            let record = header::encode_index(&self.map, self.header.index_method, self.config.level)?;
            file.set_len(self.raw_size)?;
            file.write_all_at(&record, self.raw_size)?;
            self.header.index_offset = self.raw_size;
            self.map.mark_clean();
            self.index_stale = false;
            trace!(at = self.raw_size, len = record.len(), "index stored");
        }
        file.write_all_at(&self.header.to_region(), 0)?;
        times.restore(file)?;
        Ok(())
    }

    fn restore_index(&mut self, file: &File, file_len: u64) -> std::result::Result<(), FormatError> {
        let at = self.header.index_offset;
        let body = at + INDEX_PREFIX_SIZE;
        if body > file_len {
            return Err(FormatError::Truncated { needed: body, available: file_len });
        }
        let mut prefix = [0u8; INDEX_PREFIX_SIZE as usize];
        file.read_exact_at(&mut prefix, at)?;
        let (raw_len, stored_len) = header::decode_index_prefix(&prefix);
        let end = body + stored_len as u64;
        if end > file_len {
            return Err(FormatError::Truncated { needed: end, available: file_len });
        }
        let mut stored = vec![0u8; stored_len as usize];
        file.read_exact_at(&mut stored, body)?;

        let map = header::decode_index(&stored, raw_len, self.header.index_method)?;
        if let Some(b) = map
            .iter()
            .find(|b| b.physical_offset < HEADER_REGION || b.physical_end() > at)
        {
            return Err(FormatError::Malformed(format!("block outside data region: {b}")));
        }
        self.map = map;
        // An index at the very end is overwritten by the next append.
        self.raw_size = if end == file_len { at } else { file_len };
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn is_pristine(&self) -> bool {
        self.mode == Mode::Compressed
            && self.header.logical_size == 0
            && self.map.is_empty()
            && self.raw_size == HEADER_REGION
    }

    /// Compress one chunk, append it and index it.  On failure the map is
    /// left as it was.
    fn append_block(&mut self, chunk: &[u8], offset: u64) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;
        let (payload, method) = encode_chunk(chunk, self.config.method, self.config.level)?;

        let at = self.raw_size;
        if self.header.index_offset >= at {
            self.index_stale = true;
        }
        file.set_len(at)?;
        file.write_all_at(&payload, at)?;

        let block = Block::new(offset, chunk.len() as u32, at, payload.len() as u32, method);
        trace!(%block, "appended");
        self.map.put(block, false);
        self.raw_size += payload.len() as u64;
        self.header.logical_size = self.header.logical_size.max(block.logical_end());
        Ok(())
    }

    /// True when a rewrite would shrink the raw file: orphaned bytes,
    /// shadowed data, or Blocks cut by truncation.
    fn has_reclaimable(&self) -> bool {
        self.raw_size > HEADER_REGION + self.map.physical_bytes()
            || !self.map.all_whole()
            || self.map.visible_bytes(self.header.logical_size) < self.map.stored_bytes()
    }

    /// Rewrite the raw file so it holds only visible data.
    ///
    /// The new file is built beside the old one and renamed over it.  Any
    /// failure before the rename discards it and leaves the original intact.
    /// A raw file without a name (unlinked or renamed over) is left alone:
    /// its path now names another file or nothing.
    pub fn defragment(&mut self) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;
        if self.mode != Mode::Compressed {
            return Ok(());
        }
        if self.unlinked {
            trace!(path = %self.path.display(), "raw file has no name, defragmentation skipped");
            return Ok(());
        }
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = tempfile::Builder::new()
            .prefix(".compressfs.")
            .suffix(".defrag")
            .tempfile_in(dir)?;
        let out = tmp.as_file();

        let end = self.header.logical_size;
        let mut map = LayerMap::new();
        let mut raw = HEADER_REGION;
        let mut offset = 0u64;
        let mut copied = 0usize;
        let mut recompressed = 0usize;

        while offset < end {
            let (block, visible) = match self.map.get(offset) {
                None => break,
                Some((next, 0)) => {
                    offset = next.logical_offset;
                    continue;
                }
                Some(found) => found,
            };
            let visible = visible.min(end - offset);

            if block.is_whole()
                && offset == block.logical_offset
                && visible == block.logical_length as u64
            {
                let mut stored = try_alloc(block.physical_length as usize)?;
                file.read_exact_at(&mut stored, block.physical_offset)?;
                out.write_all_at(&stored, raw)?;
                map.put(
                    Block::new(block.logical_offset, block.logical_length, raw, block.physical_length, block.method),
                    false,
                );
                raw += block.physical_length as u64;
                copied += 1;
            } else {
                let skip = (offset - block.logical_offset) as usize;
                let data = load_block(file, &block, skip + visible as usize)?;
                let slice = &data[skip..skip + visible as usize];
                let (payload, method) = encode_chunk(slice, self.config.method, self.config.level)?;
                out.write_all_at(&payload, raw)?;
                map.put(Block::new(offset, slice.len() as u32, raw, payload.len() as u32, method), false);
                raw += payload.len() as u64;
                recompressed += 1;
            }
            offset += visible;
        }

        let mut rebuilt = self.header;
        rebuilt.index_offset = 0;
        out.set_len(raw)?;
        if !map.is_empty() {
            let record = header::encode_index(&map, rebuilt.index_method, self.config.level)?;
            out.write_all_at(&record, raw)?;
            rebuilt.index_offset = raw;
        }
        out.write_all_at(&rebuilt.to_region(), 0)?;
        map.mark_clean();

        raw::copy_ownership(file, out)?;
        Xattrs::capture(file)?.apply(out)?;
        RememberTimes::capture(file)?.restore(out)?;
        out.sync_all()?;
        let new_inode = out.metadata()?.ino();

        let old_raw = self.raw_size;
        let (new_file, tmp_path) = tmp.into_parts();
        let mut pending = Some(tmp_path);
        let path = self.path.clone();
        let mut commit = || -> io::Result<()> {
            match pending.take() {
                Some(p) => p.persist(&path).map_err(|e| e.error),
                None    => Ok(()),
            }
        };
        let renamed = match self.rekey.as_ref().and_then(Weak::upgrade) {
            Some(registry) => registry.rekey(self.inode, new_inode, &mut commit),
            None           => commit(),
        };
        if let Err(e) = renamed {
            warn!(path = %self.path.display(), %e, "defragmentation abandoned");
            return Err(e.into());
        }

        self.file     = Some(new_file);
        self.map      = map;
        self.header   = rebuilt;
        self.raw_size = raw;
        self.index_stale = false;
        self.inode    = new_inode;
        debug!(
            path = %self.path.display(),
            old_raw, new_raw = raw, copied, recompressed,
            "defragmented"
        );
        Ok(())
    }
}

/// Compress `chunk`, storing it as-is when the method would grow it.
fn encode_chunk(
    chunk:  &[u8],
    method: CompressionMethod,
    level:  i32,
) -> Result<(Cow<'_, [u8]>, CompressionMethod)> {
    if method == CompressionMethod::None {
        return Ok((Cow::Borrowed(chunk), method));
    }
    let payload = method.compress(chunk, level)?;
    if payload.len() > chunk.len() {
        Ok((Cow::Borrowed(chunk), CompressionMethod::None))
    } else {
        Ok((Cow::Owned(payload), method))
    }
}

/// Read a Block's payload and decompress its first `want` bytes.
fn load_block(file: &File, block: &Block, want: usize) -> Result<Vec<u8>> {
    let mut stored = try_alloc(block.physical_length as usize)?;
    file.read_exact_at(&mut stored, block.physical_offset)?;
    block
        .method
        .decompress_prefix(&stored, block.original_length as usize, want)
        .map_err(|source| Error::CorruptBlock {
            logical_offset:  block.logical_offset,
            physical_offset: block.physical_offset,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig::default())
    }

    fn fresh(dir: &TempDir, name: &str) -> CompressedFile {
        let path = dir.path().join(name);
        File::create(&path).unwrap();
        let mut f = CompressedFile::new(path, config(), Arc::new(NoSniffer)).unwrap();
        f.open().unwrap();
        f
    }

    #[test]
    fn empty_file_is_compressed() {
        let dir = TempDir::new().unwrap();
        let f = fresh(&dir, "a");
        assert!(f.is_compressed());
        assert_eq!(f.raw_size(), HEADER_REGION);
    }

    #[test]
    fn short_file_is_plain() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short");
        fs::write(&path, b"tiny").unwrap();
        let f = CompressedFile::new(&path, config(), Arc::new(NoSniffer)).unwrap();
        assert_eq!(f.mode(), Mode::NotCompressed);
    }

    #[test]
    fn index_at_end_is_reused() {
        let dir = TempDir::new().unwrap();
        let mut f = fresh(&dir, "b");
        f.write(&[7u8; 1000], 0).unwrap();
        let data_end = f.raw_size();
        f.release().unwrap();
        assert!(fs::metadata(f.path()).unwrap().len() > data_end);

        let mut f = CompressedFile::new(dir.path().join("b"), config(), Arc::new(NoSniffer)).unwrap();
        f.open().unwrap();
        assert_eq!(f.header().index_offset, data_end);
        assert_eq!(f.raw_size(), data_end);
        f.release().unwrap();
    }

    #[test]
    fn incompressible_chunk_stored_plain() {
        let (payload, method) = encode_chunk(&[1, 2, 3], CompressionMethod::Zstd, 3).unwrap();
        assert_eq!(method, CompressionMethod::None);
        assert_eq!(&payload[..], &[1, 2, 3]);
    }

    #[test]
    fn zero_extension_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut f = fresh(&dir, "z");
        f.write(&[0u8; 4096], 0).unwrap();
        assert_eq!(f.size().unwrap(), 4096);
        assert!(f.layer_map().is_empty());
        assert_eq!(f.raw_size(), HEADER_REGION);
    }

    #[test]
    fn shadowed_data_is_reclaimable() {
        let dir = TempDir::new().unwrap();
        let mut f = fresh(&dir, "s");
        f.write(b"aaaaaaaaaa", 0).unwrap();
        assert!(!f.has_reclaimable());
        f.write(b"bb", 2).unwrap();
        assert!(f.has_reclaimable());
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut x = 0x9E37_79B9_7F4A_7C15u64;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect()
    }

    /// Move the raw file away and put a non-empty directory at its name, so
    /// renaming a rewritten file onto the name fails.
    fn occupy_name(dir: &TempDir, name: &str) -> std::path::PathBuf {
        let moved = dir.path().join("moved");
        fs::rename(dir.path().join(name), &moved).unwrap();
        fs::create_dir(dir.path().join(name)).unwrap();
        fs::write(dir.path().join(name).join("occupied"), b"x").unwrap();
        moved
    }

    #[test]
    fn failed_defragment_keeps_original() {
        let dir = TempDir::new().unwrap();
        let mut f = fresh(&dir, "d");
        f.write(&[b'a'; 1000], 0).unwrap();
        f.write(b"bb", 10).unwrap();
        let moved = occupy_name(&dir, "d");

        let raw_before = fs::read(&moved).unwrap();
        let (blocks, raw_size, inode) = (f.layer_map().len(), f.raw_size(), f.inode());

        assert!(f.defragment().is_err());
        assert_eq!(fs::read(&moved).unwrap(), raw_before);
        assert_eq!(f.layer_map().len(), blocks);
        assert_eq!(f.raw_size(), raw_size);
        assert_eq!(f.inode(), inode);
        // Only "moved" and the directory remain; the rewritten copy is gone.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);

        let mut buf = [0u8; 12];
        f.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"aaaaaaaaaabb");
    }

    #[test]
    fn write_survives_failed_defragment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w");
        File::create(&path).unwrap();
        let config = Arc::new(EngineConfig { defrag_min_raw_size: 0, ..Default::default() });
        let mut f = CompressedFile::new(&path, config, Arc::new(NoSniffer)).unwrap();
        f.open().unwrap();
        f.write(&noise(1000), 0).unwrap();
        occupy_name(&dir, "w");

        // Shadows everything, so the raw file crosses the rewrite threshold.
        let fresh_data = noise(2000)[1000..].to_vec();
        assert_eq!(f.write(&fresh_data, 0).unwrap(), 1000);
        assert_eq!(f.layer_map().len(), 2);

        let mut buf = vec![0u8; 1000];
        f.read(&mut buf, 0).unwrap();
        assert_eq!(buf, fresh_data);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn failed_append_leaves_map_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut f = fresh(&dir, "p");
        f.write(b"kept data", 0).unwrap();
        let blocks = f.layer_map().len();
        let size = f.size().unwrap();

        // No file can be extended to this offset.
        f.raw_size = u64::MAX - 8;
        assert!(f.write(b"lost", 100).is_err());
        assert_eq!(f.layer_map().len(), blocks);
        assert_eq!(f.size().unwrap(), size);

        let mut buf = [0u8; 9];
        f.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"kept data");
    }

    #[test]
    fn unlinked_file_is_not_defragmented() {
        let dir = TempDir::new().unwrap();
        let mut f = fresh(&dir, "u");
        f.write(&[b'a'; 1000], 0).unwrap();
        f.write(b"bb", 10).unwrap();
        f.unlink().unwrap();

        f.defragment().unwrap();
        assert!(!dir.path().join("u").exists());
        assert_eq!(f.layer_map().len(), 2);
    }

    #[test]
    fn operations_need_open_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c");
        File::create(&path).unwrap();
        let mut f = CompressedFile::new(&path, config(), Arc::new(NoSniffer)).unwrap();
        assert!(matches!(f.write(b"x", 0), Err(Error::NotOpen)));
        assert!(matches!(f.release(), Err(Error::NotOpen)));
    }
}
