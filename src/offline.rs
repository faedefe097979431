//! Offline conversion of existing files, in place.
//!
//! Each regular file is streamed through a source object into a sibling
//! temporary named `<file>.__f_tmp_c__<ext>`, which then replaces the
//! original and gets its mode back.  An interrupted or failed conversion
//! removes the temporary and leaves the original untouched.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::Read;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::CompressedFile;
use crate::error::{try_alloc, Result};
use crate::sniff::{ContentSniffer, NoSniffer};

const TMP_MARKER: &str = ".__f_tmp_c__";

/// Bytes inspected when deciding whether plain content is already compressed.
const SNIFF_WINDOW: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Compress,
    Decompress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotRegular,
    /// Already managed and stored with the requested method.
    AlreadyCompressed,
    /// Plain content in a natively compressed format.
    NativelyCompressed,
    /// Decompressing a file the engine does not manage.
    NotManaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converted { from: u64, to: u64 },
    Skipped(SkipReason),
}

#[derive(Debug)]
pub struct FileReport {
    pub path:    PathBuf,
    pub outcome: Result<Outcome>,
}

pub struct Converter {
    config:    Arc<EngineConfig>,
    sniffer:   Arc<dyn ContentSniffer>,
    direction: Direction,
}

impl Converter {
    pub fn new(config: Arc<EngineConfig>, direction: Direction) -> Self {
        let sniffer = config.sniffer();
        Self { config, sniffer, direction }
    }

    /// Convert every regular file below `root` (or `root` itself).
    pub fn convert_tree(&self, root: &Path) -> Result<Vec<FileReport>> {
        let mut files = Vec::new();
        collect_files(root, &mut files)?;
        debug!(root = %root.display(), files = files.len(), "collected");

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;

            Ok(files
                .into_par_iter()
                .map(|path| {
                    let outcome = self.convert_file(&path);
                    FileReport { path, outcome }
                })
                .collect())
        }

        #[cfg(not(feature = "parallel"))]
        {
            Ok(files
                .into_iter()
                .map(|path| {
                    let outcome = self.convert_file(&path);
                    FileReport { path, outcome }
                })
                .collect())
        }
    }

    pub fn convert_file(&self, path: &Path) -> Result<Outcome> {
        let meta = fs::symlink_metadata(path)?;
        if !meta.is_file() {
            return Ok(Outcome::Skipped(SkipReason::NotRegular));
        }
        let from = meta.len();

        let mut source = CompressedFile::new(path, self.config.clone(), Arc::new(NoSniffer))?;
        if let Some(reason) = self.skip_reason(&mut source, path)? {
            info!(path = %path.display(), ?reason, "skipped");
            return Ok(Outcome::Skipped(reason));
        }

        let tmp = temp_name(path);
        OpenOptions::new().write(true).create_new(true).mode(0o600).open(&tmp)?;
        let copied = self.copy_through(&mut source, &tmp);
        if let Err(e) = copied {
            warn!(path = %path.display(), %e, "conversion failed, original kept");
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        fs::rename(&tmp, path)?;
        fs::set_permissions(path, Permissions::from_mode(meta.permissions().mode()))?;
        let to = fs::metadata(path)?.len();
        info!(path = %path.display(), from, to, "converted");
        Ok(Outcome::Converted { from, to })
    }

    fn skip_reason(&self, source: &mut CompressedFile, path: &Path) -> Result<Option<SkipReason>> {
        match self.direction {
            Direction::Decompress if !source.is_compressed() => Ok(Some(SkipReason::NotManaged)),
            Direction::Decompress => Ok(None),
            Direction::Compress if source.is_compressed() => {
                source.open()?;
                let same = source.layer_map().is_compressed_only_with(self.config.method);
                source.release()?;
                Ok(same.then_some(SkipReason::AlreadyCompressed))
            }
            Direction::Compress => {
                let mut head = Vec::new();
                File::open(path)?.take(SNIFF_WINDOW).read_to_end(&mut head)?;
                let native = self.sniffer.looks_already_compressed(&head);
                Ok(native.then_some(SkipReason::NativelyCompressed))
            }
        }
    }

    fn copy_through(&self, source: &mut CompressedFile, tmp: &Path) -> Result<()> {
        let mut output = match self.direction {
            Direction::Compress   => CompressedFile::new(tmp, self.config.clone(), Arc::new(NoSniffer))?,
            Direction::Decompress => CompressedFile::plain(tmp, self.config.clone())?,
        };
        source.open()?;
        if let Err(e) = output.open() {
            let _ = source.release();
            return Err(e);
        }

        let copied = stream(source, &mut output, self.config.chunk_size);
        let released = output.release();
        // The source is read only; nothing of value is stored on its release.
        let _ = source.release();
        copied.and(released)
    }
}

fn stream(source: &mut CompressedFile, output: &mut CompressedFile, buffer: usize) -> Result<()> {
    let size = source.size()?;
    let mut buf = try_alloc(buffer)?;
    let mut offset = 0u64;
    while offset < size {
        let n = source.read(&mut buf, offset)?;
        if n == 0 {
            break;
        }
        output.write(&buf[..n], offset)?;
        offset += n as u64;
    }
    Ok(())
}

/// `<file>.__f_tmp_c__<ext>`, keeping the extension so tools keyed on it
/// still recognise the temporary.
fn temp_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_MARKER);
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    PathBuf::from(name)
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        let mut entries: Vec<PathBuf> = fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();
        for entry in entries {
            collect_files(&entry, out)?;
        }
    } else if meta.is_file() {
        out.push(path.to_path_buf());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_name_keeps_extension() {
        assert_eq!(
            temp_name(Path::new("/d/report.txt")),
            PathBuf::from("/d/report.txt.__f_tmp_c__.txt")
        );
        assert_eq!(temp_name(Path::new("/d/Makefile")), PathBuf::from("/d/Makefile.__f_tmp_c__"));
    }

    #[test]
    fn tree_is_collected_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b"), b"1").unwrap();
        fs::write(dir.path().join("sub/a"), b"2").unwrap();
        let mut files = Vec::new();
        collect_files(dir.path(), &mut files).unwrap();
        assert_eq!(files, vec![dir.path().join("b"), dir.path().join("sub/a")]);
    }
}
