//! Atomic file replacement.
//!
//! A write goes to a uniquely named temp file in the *same directory* as the
//! target, is flushed and fsynced, then renamed over the target. Readers see
//! either the complete old file or the complete new one. On any failure the
//! temp file is removed and the previous file is left byte-identical.
//!
//! Temp files are named `.<file>.tmp.<uuid>` so orphans from a crash can be
//! recognised and removed on startup.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

const TEMP_MARKER: &str = ".tmp.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Text,
    Binary,
}

impl FromStr for WriteMode {
    type Err = AtomicWriteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(WriteMode::Text),
            "binary" => Ok(WriteMode::Binary),
            other => Err(AtomicWriteError::UnknownMode(other.to_string())),
        }
    }
}

/// The steps of a write, in order. Used to report where a write failed and
/// as the hook points for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    CreateTemp,
    Write,
    Fsync,
    Rename,
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteStage::CreateTemp => "create temp",
            WriteStage::Write => "write",
            WriteStage::Fsync => "fsync",
            WriteStage::Rename => "rename",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError {
    #[error("unknown write mode: {0}")]
    UnknownMode(String),
    #[error("text mode requires valid UTF-8 content")]
    NotUtf8,
    #[error("cannot create parent directory {path}: {source}")]
    CreateParent {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{stage} failed for {path}: {source}")]
    Io {
        stage: WriteStage,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Called before each stage; returning an error aborts the write at that
/// stage exactly as a real I/O failure would.
pub type FaultInjector = Arc<dyn Fn(WriteStage, &Path) -> io::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct AtomicWriter {
    faults: Option<FaultInjector>,
}

impl fmt::Debug for AtomicWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicWriter")
            .field("fault_injection", &self.faults.is_some())
            .finish()
    }
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault_injector(faults: FaultInjector) -> Self {
        Self {
            faults: Some(faults),
        }
    }

    /// Replace `path` with `content`. The prior file is untouched on error.
    pub fn write(
        &self,
        path: &Path,
        content: &[u8],
        mode: WriteMode,
    ) -> Result<(), AtomicWriteError> {
        if mode == WriteMode::Text && std::str::from_utf8(content).is_err() {
            return Err(AtomicWriteError::NotUtf8);
        }

        let parent = parent_dir(path);
        fs::create_dir_all(&parent).map_err(|source| AtomicWriteError::CreateParent {
            path: parent.clone(),
            source,
        })?;

        let temp = temp_path_for(path);
        let result = self.write_and_swap(&temp, path, &parent, content);
        if result.is_err() {
            if let Err(err) = fs::remove_file(&temp) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %temp.display(),
                        error = %err,
                        "cannot remove temp file after failed write"
                    );
                }
            }
        }
        result
    }

    fn write_and_swap(
        &self,
        temp: &Path,
        target: &Path,
        parent: &Path,
        content: &[u8],
    ) -> Result<(), AtomicWriteError> {
        let io_err = |stage: WriteStage| {
            let path = target.to_path_buf();
            move |source: io::Error| AtomicWriteError::Io {
                stage,
                path,
                source,
            }
        };

        self.inject(WriteStage::CreateTemp, temp)
            .map_err(io_err(WriteStage::CreateTemp))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp)
            .map_err(io_err(WriteStage::CreateTemp))?;

        self.inject(WriteStage::Write, temp)
            .map_err(io_err(WriteStage::Write))?;
        file.write_all(content).map_err(io_err(WriteStage::Write))?;
        file.flush().map_err(io_err(WriteStage::Write))?;
        // The rename replaces the inode, so carry the old mode over.
        if let Ok(existing) = fs::metadata(target) {
            file.set_permissions(existing.permissions())
                .map_err(io_err(WriteStage::Write))?;
        }

        self.inject(WriteStage::Fsync, temp)
            .map_err(io_err(WriteStage::Fsync))?;
        file.sync_all().map_err(io_err(WriteStage::Fsync))?;
        drop(file);

        self.inject(WriteStage::Rename, temp)
            .map_err(io_err(WriteStage::Rename))?;
        fs::rename(temp, target).map_err(io_err(WriteStage::Rename))?;

        if let Err(err) = fsync_dir(parent) {
            debug!(dir = %parent.display(), error = %err, "parent directory fsync failed");
        }
        Ok(())
    }

    fn inject(&self, stage: WriteStage, temp: &Path) -> io::Result<()> {
        match &self.faults {
            Some(faults) => faults(stage, temp),
            None => Ok(()),
        }
    }
}

/// Bool-returning convenience wrapper: `true` iff `path` now holds `content`.
pub fn atomic_write(path: impl AsRef<Path>, content: impl AsRef<[u8]>, mode: WriteMode) -> bool {
    let path = path.as_ref();
    match AtomicWriter::new().write(path, content.as_ref(), mode) {
        Ok(()) => true,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "atomic write failed");
            false
        }
    }
}

/// Unique sibling temp path for `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "scribe".to_string());
    parent_dir(target).join(format!(".{name}{TEMP_MARKER}{}", Uuid::new_v4().simple()))
}

/// True for files produced by [`temp_path_for`].
pub fn is_temp_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.contains(TEMP_MARKER))
        .unwrap_or(false)
}

/// Remove temp files left in `dir` by an interrupted write. Returns how many
/// were removed. Not recursive.
pub fn cleanup_orphans(dir: &Path) -> usize {
    let mut removed = 0;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && is_temp_artifact(&path) {
                warn!(path = %path.display(), "removing orphaned temp file");
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    removed
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn fsync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
