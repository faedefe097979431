//! Inode → file object registry.
//!
//! Every open of the same raw inode shares one [`CompressedFile`].  The
//! registry lock guards only the map itself: objects are built outside it
//! (building reads the header).  The only I/O run under it is the `stat` of
//! a looked-up path and the rename that defragmentation commits through
//! [`InodeRekey`], so a path's inode and its slot always agree.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::engine::{CompressedFile, InodeRekey};
use crate::error::Result;
use crate::sniff::ContentSniffer;

struct Slot {
    key:  Arc<AtomicU64>,
    file: Arc<Mutex<CompressedFile>>,
    refs: usize,
}

/// A counted reference to a registered object.
#[derive(Clone)]
pub struct FileHandle {
    key:  Arc<AtomicU64>,
    file: Arc<Mutex<CompressedFile>>,
}

impl FileHandle {
    /// Current inode of the object; changes when defragmentation replaces
    /// the raw file.
    pub fn inode(&self) -> u64 {
        self.key.load(Ordering::Acquire)
    }

    /// True when both handles refer to the same registered object.
    pub fn same_object(&self, other: &FileHandle) -> bool {
        Arc::ptr_eq(&self.file, &other.file)
    }

    pub fn lock(&self) -> MutexGuard<'_, CompressedFile> {
        // A panic while holding the lock leaves the object usable: every
        // mutation either completes or is discarded before state changes.
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lock up to two objects in address order, so concurrent callers locking
/// the same pair cannot deadlock.  The same object is locked once and
/// returned as the first guard.
pub(crate) fn lock_pair<'a>(
    a: Option<&'a FileHandle>,
    b: Option<&'a FileHandle>,
) -> (Option<MutexGuard<'a, CompressedFile>>, Option<MutexGuard<'a, CompressedFile>>) {
    match (a, b) {
        (Some(a), Some(b)) if a.same_object(b) => (Some(a.lock()), None),
        (Some(a), Some(b)) if Arc::as_ptr(&a.file) < Arc::as_ptr(&b.file) => {
            let first = a.lock();
            (Some(first), Some(b.lock()))
        }
        (Some(a), Some(b)) => {
            let second = b.lock();
            (Some(a.lock()), Some(second))
        }
        (a, b) => (a.map(FileHandle::lock), b.map(FileHandle::lock)),
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").field("inode", &self.inode()).finish()
    }
}

pub struct FileRegistry {
    slots:   Mutex<HashMap<u64, Slot>>,
    config:  Arc<EngineConfig>,
    sniffer: Arc<dyn ContentSniffer>,
}

impl FileRegistry {
    pub fn new(config: Arc<EngineConfig>) -> Arc<Self> {
        let sniffer = config.sniffer();
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            config,
            sniffer,
        })
    }

    pub fn config(&self) -> &Arc<EngineConfig> { &self.config }

    fn slots(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Find the object for `path`'s inode, building it if none is registered.
    pub fn lookup_or_create(self: &Arc<Self>, path: &Path) -> Result<FileHandle> {
        loop {
            {
                let mut slots = self.slots();
                let inode = fs::metadata(path)?.ino();
                if let Some(handle) = acquire(&mut slots, inode) {
                    return Ok(handle);
                }
            }

            let mut file = CompressedFile::new(path, self.config.clone(), self.sniffer.clone())?;
            let me: Arc<dyn InodeRekey> = self.clone();
            file.set_rekey(Arc::downgrade(&me));

            let mut slots = self.slots();
            let inode = fs::metadata(path)?.ino();
            if inode != file.inode() {
                // Replaced while we were building (a defragmentation commit
                // or an outside rename); the object describes a dead file.
                trace!(path = %path.display(), built = file.inode(), inode, "raw file replaced, rebuilding");
                continue;
            }
            // Someone may have registered it while we were building.
            if let Some(handle) = acquire(&mut slots, inode) {
                return Ok(handle);
            }
            let slot = Slot {
                key:  Arc::new(AtomicU64::new(inode)),
                file: Arc::new(Mutex::new(file)),
                refs: 1,
            };
            let handle = FileHandle { key: slot.key.clone(), file: slot.file.clone() };
            slots.insert(inode, slot);
            debug!(inode, path = %path.display(), "registered");
            return Ok(handle);
        }
    }

    /// Find the object for `path`'s inode without building one.
    pub fn lookup(&self, path: &Path) -> Result<Option<FileHandle>> {
        let mut slots = self.slots();
        let inode = match fs::metadata(path) {
            Ok(meta) => meta.ino(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(acquire(&mut slots, inode))
    }

    /// Give a handle back.  The object is dropped with its last handle.
    pub fn release(&self, handle: FileHandle) {
        let inode = handle.inode();
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&inode) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&inode);
                debug!(inode, "unregistered");
            }
        }
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn acquire(slots: &mut HashMap<u64, Slot>, inode: u64) -> Option<FileHandle> {
    let slot = slots.get_mut(&inode)?;
    slot.refs += 1;
    trace!(inode, refs = slot.refs, "acquired");
    Some(FileHandle { key: slot.key.clone(), file: slot.file.clone() })
}

impl InodeRekey for FileRegistry {
    fn rekey(
        &self,
        old:    u64,
        new:    u64,
        commit: &mut dyn FnMut() -> io::Result<()>,
    ) -> io::Result<()> {
        let mut slots = self.slots();
        commit()?;
        if let Some(slot) = slots.remove(&old) {
            slot.key.store(new, Ordering::Release);
            slots.insert(new, slot);
        }
        debug!(old, new, "rekeyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> Arc<FileRegistry> {
        FileRegistry::new(Arc::new(EngineConfig::default()))
    }

    #[test]
    fn same_inode_shares_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let reg = registry();
        let a = reg.lookup_or_create(&path).unwrap();
        let b = reg.lookup_or_create(&path).unwrap();
        assert!(a.same_object(&b));
        assert_eq!(reg.len(), 1);
        reg.release(a);
        assert_eq!(reg.len(), 1);
        reg.release(b);
        assert!(reg.is_empty());
    }

    #[test]
    fn lookup_does_not_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let reg = registry();
        assert!(reg.lookup(&path).unwrap().is_none());
        assert!(reg.lookup(&dir.path().join("missing")).unwrap().is_none());
        let h = reg.lookup_or_create(&path).unwrap();
        let again = reg.lookup(&path).unwrap().unwrap();
        reg.release(again);
        reg.release(h);
        assert!(reg.is_empty());
    }

    #[test]
    fn rekey_moves_entry_and_runs_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let reg = registry();
        let h = reg.lookup_or_create(&path).unwrap();
        let old = h.inode();

        let mut ran = false;
        reg.rekey(old, old + 1_000_000, &mut || { ran = true; Ok(()) }).unwrap();
        assert!(ran);
        assert_eq!(h.inode(), old + 1_000_000);
        reg.release(h);
        assert!(reg.is_empty());
    }

    #[test]
    fn lookup_follows_committed_replacement() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let staged = dir.path().join("staged");
        fs::write(&path, b"").unwrap();
        fs::write(&staged, b"").unwrap();
        let reg = registry();
        let h = reg.lookup_or_create(&path).unwrap();
        let old = h.inode();
        let new = fs::metadata(&staged).unwrap().ino();

        reg.rekey(old, new, &mut || fs::rename(&staged, &path)).unwrap();

        let again = reg.lookup_or_create(&path).unwrap();
        assert!(again.same_object(&h));
        assert_eq!(again.inode(), new);
        assert_eq!(reg.len(), 1);
        reg.release(again);
        reg.release(h);
        assert!(reg.is_empty());
    }

    #[test]
    fn lock_pair_handles_same_and_distinct_objects() {
        let dir = TempDir::new().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        fs::write(&a, b"").unwrap();
        fs::write(&b, b"").unwrap();
        let reg = registry();
        let ha = reg.lookup_or_create(&a).unwrap();
        let ha2 = reg.lookup_or_create(&a).unwrap();
        let hb = reg.lookup_or_create(&b).unwrap();

        let (first, second) = lock_pair(Some(&ha), Some(&ha2));
        assert!(first.is_some() && second.is_none());
        drop((first, second));

        for (x, y) in [(&ha, &hb), (&hb, &ha)] {
            let (gx, gy) = lock_pair(Some(x), Some(y));
            assert_eq!(gx.unwrap().inode(), x.inode());
            assert_eq!(gy.unwrap().inode(), y.inode());
        }
        for h in [ha, ha2, hb] {
            reg.release(h);
        }
    }

    #[test]
    fn failed_commit_keeps_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let reg = registry();
        let h = reg.lookup_or_create(&path).unwrap();
        let old = h.inode();
        let err = reg.rekey(old, old + 1, &mut || Err(io::Error::from_raw_os_error(libc::EXDEV)));
        assert!(err.is_err());
        assert_eq!(h.inode(), old);
        reg.release(h);
    }
}
