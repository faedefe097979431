//! Primitives on the raw backing file: opening, metadata capture and copy,
//! extended attributes.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File, FileTimes, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::SystemTime;

use xattr::FileExt as _;

/// Open a raw file for reading and writing.
///
/// A read-only raw file is still writable by the engine (index and header
/// stores happen on close): on `EACCES`/`EPERM` the owner gets `rw` and the
/// open is retried.
pub fn open_rw(path: &Path) -> io::Result<File> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => Ok(f),
        Err(e) if matches!(e.raw_os_error(), Some(libc::EACCES) | Some(libc::EPERM)) => {
            let mode = fs::metadata(path)?.permissions().mode();
            tracing::debug!(path = %path.display(), mode = %format!("{mode:o}"), "forcing owner rw");
            fs::set_permissions(path, Permissions::from_mode(mode | 0o600))?;
            OpenOptions::new().read(true).write(true).open(path)
        }
        Err(e) => Err(e),
    }
}

pub fn is_zero_only(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

// ── Times ───────────────────────────────────────────────────────────────────

/// Access and modification times captured before bookkeeping writes so they
/// can be put back afterwards.
#[derive(Debug, Clone, Copy)]
pub struct RememberTimes {
    accessed: SystemTime,
    modified: SystemTime,
}

impl RememberTimes {
    pub fn capture(file: &File) -> io::Result<Self> {
        let meta = file.metadata()?;
        Ok(Self {
            accessed: meta.accessed()?,
            modified: meta.modified()?,
        })
    }

    pub fn restore(&self, file: &File) -> io::Result<()> {
        file.set_times(FileTimes::new().set_accessed(self.accessed).set_modified(self.modified))
    }
}

// ── Ownership ───────────────────────────────────────────────────────────────

/// Copy mode and owner of `from` onto `to`.
///
/// Changing the owner needs privileges; `EPERM` there is ignored since the
/// file then already belongs to the caller.
pub fn copy_ownership(from: &File, to: &File) -> io::Result<()> {
    let meta = from.metadata()?;
    to.set_permissions(Permissions::from_mode(meta.mode() & 0o7777))?;
    match std::os::unix::fs::fchown(to, Some(meta.uid()), Some(meta.gid())) {
        Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(()),
        other => other,
    }
}

// ── Extended attributes ─────────────────────────────────────────────────────

/// Every extended attribute of a file, name and value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Xattrs {
    entries: Vec<(OsString, Vec<u8>)>,
}

impl Xattrs {
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&[u8]> {
        let name = name.as_ref();
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    /// Read all attributes of `file`.  A filesystem or platform without
    /// extended attributes yields an empty set.
    pub fn capture(file: &File) -> io::Result<Self> {
        if !xattr::SUPPORTED_PLATFORM {
            return Ok(Self::default());
        }
        let names = match file.list_xattr() {
            Ok(names) => names,
            Err(e) if unsupported(&e) => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        for name in names {
            // Removed between listing and reading.
            if let Some(value) = file.get_xattr(&name)? {
                entries.push((name, value));
            }
        }
        Ok(Self { entries })
    }

    pub fn apply(&self, file: &File) -> io::Result<()> {
        for (name, value) in &self.entries {
            match file.set_xattr(name, value) {
                Ok(()) => {}
                // Namespaces such as trusted.* need privileges the copy may lack.
                Err(e) if unsupported(&e) || e.raw_os_error() == Some(libc::EPERM) => {
                    tracing::warn!(name = %name.to_string_lossy(), %e, "xattr not copied");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn unsupported(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTSUP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use xattr::FileExt as _;

    #[test]
    fn zero_detection() {
        assert!(is_zero_only(&[]));
        assert!(is_zero_only(&[0; 64]));
        assert!(!is_zero_only(&[0, 0, 1]));
    }

    #[test]
    fn read_only_file_opens_rw() {
        let tmp = NamedTempFile::new().unwrap();
        fs::set_permissions(tmp.path(), Permissions::from_mode(0o400)).unwrap();
        let f = open_rw(tmp.path()).unwrap();
        f.set_len(4).unwrap();
        assert_eq!(fs::metadata(tmp.path()).unwrap().len(), 4);
    }

    #[test]
    fn times_are_restored() {
        let tmp = NamedTempFile::new().unwrap();
        let f = tmp.as_file();
        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        f.set_times(FileTimes::new().set_accessed(past).set_modified(past)).unwrap();
        let remembered = RememberTimes::capture(f).unwrap();
        f.set_len(10).unwrap();
        remembered.restore(f).unwrap();
        assert_eq!(f.metadata().unwrap().modified().unwrap(), past);
    }

    #[test]
    fn ownership_copies_mode() {
        let a = NamedTempFile::new().unwrap();
        let b = NamedTempFile::new().unwrap();
        a.as_file().set_permissions(Permissions::from_mode(0o640)).unwrap();
        copy_ownership(a.as_file(), b.as_file()).unwrap();
        assert_eq!(b.as_file().metadata().unwrap().mode() & 0o7777, 0o640);
    }

    #[test]
    fn xattr_capture_apply() {
        let a = NamedTempFile::new().unwrap();
        let b = NamedTempFile::new().unwrap();
        if a.as_file().set_xattr("user.compressfs.origin", b"kept").is_err() {
            // No user attributes on this filesystem.
            assert!(Xattrs::capture(a.as_file()).is_ok());
            return;
        }
        let attrs = Xattrs::capture(a.as_file()).unwrap();
        assert_eq!(attrs.get("user.compressfs.origin"), Some(&b"kept"[..]));

        attrs.apply(b.as_file()).unwrap();
        let copied = Xattrs::capture(b.as_file()).unwrap();
        assert_eq!(copied.get("user.compressfs.origin"), Some(&b"kept"[..]));
    }
}
