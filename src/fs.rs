//! Path-based facade for a filesystem hook layer.
//!
//! Paths are relative to the backing root (`/` is the root itself).  Each
//! operation returns a [`Result`]; hook callbacks turn it into `>= 0` /
//! `-errno` with [`crate::error::errno_result`].

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::config::EngineConfig;
use crate::engine::{CompressedFile, FileAttr};
use crate::error::Result;
use crate::registry::{lock_pair, FileHandle, FileRegistry};
use crate::sniff::NoSniffer;

pub struct CompressFs {
    root:     PathBuf,
    registry: Arc<FileRegistry>,
}

impl CompressFs {
    pub fn new(root: impl Into<PathBuf>, config: EngineConfig) -> Self {
        Self {
            root:     root.into(),
            registry: FileRegistry::new(Arc::new(config)),
        }
    }

    pub fn root(&self) -> &Path { &self.root }
    pub fn registry(&self) -> &Arc<FileRegistry> { &self.registry }

    /// Backing path of a hook-layer path.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            self.root.join(".")
        } else {
            self.root.join(rel)
        }
    }

    pub fn open(&self, path: &str, create: bool) -> Result<FileHandle> {
        let real = self.resolve(path);
        if create {
            OpenOptions::new().write(true).create(true).open(&real)?;
        }
        let handle = self.registry.lookup_or_create(&real)?;
        let opened = handle.lock().open();
        match opened {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.registry.release(handle);
                Err(e)
            }
        }
    }

    pub fn release(&self, handle: FileHandle) -> Result<()> {
        let released = handle.lock().release();
        self.registry.release(handle);
        released
    }

    pub fn read(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        handle.lock().read(buf, offset)
    }

    pub fn write(&self, handle: &FileHandle, buf: &[u8], offset: u64) -> Result<usize> {
        handle.lock().write(buf, offset)
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let handle = self.open(path, false)?;
        let truncated = handle.lock().truncate(size);
        let released = self.release(handle);
        truncated.and(released)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let real = self.resolve(path);
        match self.registry.lookup(&real)? {
            Some(handle) => {
                let unlinked = handle.lock().unlink();
                self.registry.release(handle);
                unlinked
            }
            None => {
                fs::remove_file(&real)?;
                Ok(())
            }
        }
    }

    pub fn getattr(&self, path: &str) -> Result<FileAttr> {
        let real = self.resolve(path);
        match self.registry.lookup(&real)? {
            Some(handle) => {
                let attr = handle.lock().getattr();
                self.registry.release(handle);
                attr
            }
            None => {
                // Read only; nothing here ever writes, so no sniffing.
                CompressedFile::new(&real, self.registry.config().clone(), Arc::new(NoSniffer))?.getattr()
            }
        }
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (src, dst) = (self.resolve(from), self.resolve(to));
        let moved    = self.registry.lookup(&src)?;
        let replaced = self.registry.lookup(&dst)?;

        // Two names of one inode: the rename changes nothing.
        let same = matches!((&moved, &replaced), (Some(m), Some(r)) if m.same_object(r));

        // Both objects stay locked across the rename: a defragmentation of
        // either one renames onto its own path and must see the new names.
        let renamed = {
            let (mut moving, mut losing) = lock_pair(moved.as_ref(), replaced.as_ref());
            let renamed = fs::rename(&src, &dst);
            if renamed.is_ok() && !same {
                if let Some(lost) = losing.as_mut() {
                    lost.detach();
                }
                if let Some(file) = moving.as_mut() {
                    file.set_path(dst.clone());
                }
            }
            renamed
        };
        if renamed.is_ok() {
            debug!(from = %src.display(), to = %dst.display(), "renamed");
        }
        for h in moved.into_iter().chain(replaced) {
            self.registry.release(h);
        }
        Ok(renamed?)
    }
}
