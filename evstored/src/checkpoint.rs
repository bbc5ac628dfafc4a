//! Durable position cursors
//!
//! A checkpoint keeps two values: the last written one (visible
//! through [`Checkpoint::read_non_flushed`]) and the last flushed one
//! (visible through [`Checkpoint::read`]). Only the flushed value is
//! guaranteed to survive a crash.
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::{fmt, io};

use thiserror::Error;
use tracing::trace;

use crate::ioutil::{fsync, pread_exact, pwrite_all};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("io error on checkpoint {name}")]
    Io {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint file {} has invalid length {len}", path.display())]
    InvalidLength { path: PathBuf, len: u64 },
}

pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

pub trait Checkpoint: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn write(&self, value: i64);

    /// Make the last written value durable
    fn flush(&self) -> CheckpointResult<()>;

    /// Last flushed value
    fn read(&self) -> i64;

    /// Last written value
    fn read_non_flushed(&self) -> i64;
}

pub type SharedCheckpoint = Arc<dyn Checkpoint>;

/// Checkpoint kept only in memory
#[derive(Debug)]
pub struct InMemoryCheckpoint {
    name: &'static str,
    last: AtomicI64,
    last_flushed: AtomicI64,
}

impl InMemoryCheckpoint {
    pub fn new(name: &'static str, initial: i64) -> Self {
        Self {
            name,
            last: AtomicI64::new(initial),
            last_flushed: AtomicI64::new(initial),
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn name(&self) -> &'static str {
        self.name
    }

    fn write(&self, value: i64) {
        self.last.store(value, Ordering::SeqCst);
    }

    fn flush(&self) -> CheckpointResult<()> {
        self.last_flushed
            .store(self.last.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn read(&self) -> i64 {
        self.last_flushed.load(Ordering::SeqCst)
    }

    fn read_non_flushed(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Checkpoint stored as 8 big-endian bytes in its own file
#[derive(Debug)]
pub struct FileCheckpoint {
    name: &'static str,
    path: PathBuf,
    file: File,
    last: AtomicI64,
    last_flushed: AtomicI64,
    /// Serializes flushes, so an older value never overwrites a newer one
    flush_lock: Mutex<()>,
}

impl FileCheckpoint {
    pub const BYTE_SIZE: usize = 8;

    /// Open the checkpoint file, creating it with `initial` if missing
    pub fn open(path: &Path, name: &'static str, initial: i64) -> CheckpointResult<Self> {
        let io_err = |source| CheckpointError::Io { name, source };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(io_err)?;

        let len = file.metadata().map_err(io_err)?.len();
        let value = match len {
            0 => {
                pwrite_all(file.as_raw_fd(), 0, &initial.to_be_bytes()).map_err(io_err)?;
                fsync(file.as_raw_fd()).map_err(io_err)?;
                initial
            }
            8 => {
                let mut buf = [0u8; Self::BYTE_SIZE];
                pread_exact(file.as_raw_fd(), 0, &mut buf).map_err(io_err)?;
                i64::from_be_bytes(buf)
            }
            len => {
                return Err(CheckpointError::InvalidLength {
                    path: path.to_owned(),
                    len,
                })
            }
        };
        trace!(name, value, "Opened checkpoint");

        Ok(Self {
            name,
            path: path.to_owned(),
            file,
            last: AtomicI64::new(value),
            last_flushed: AtomicI64::new(value),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &'static str {
        self.name
    }

    fn write(&self, value: i64) {
        self.last.store(value, Ordering::SeqCst);
    }

    fn flush(&self) -> CheckpointResult<()> {
        let _lock = self.flush_lock.lock().expect("Locking failed");
        let value = self.last.load(Ordering::SeqCst);
        if value == self.last_flushed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let io_err = |source| CheckpointError::Io {
            name: self.name,
            source,
        };
        pwrite_all(self.file.as_raw_fd(), 0, &value.to_be_bytes()).map_err(io_err)?;
        fsync(self.file.as_raw_fd()).map_err(io_err)?;
        self.last_flushed.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self) -> i64 {
        self.last_flushed.load(Ordering::SeqCst)
    }

    fn read_non_flushed(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_checkpoint_survives_reopen_only_when_flushed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("writer.chk");

        let chk = FileCheckpoint::open(&path, "writer", 0)?;
        chk.write(100);
        assert_eq!(chk.read(), 0);
        assert_eq!(chk.read_non_flushed(), 100);
        drop(chk);
        assert_eq!(FileCheckpoint::open(&path, "writer", 0)?.read(), 0);

        let chk = FileCheckpoint::open(&path, "writer", 0)?;
        chk.write(200);
        chk.flush()?;
        assert_eq!(chk.read(), 200);
        drop(chk);
        assert_eq!(FileCheckpoint::open(&path, "writer", 0)?.read(), 200);
        Ok(())
    }

    #[test]
    fn file_checkpoint_initial_value() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let chk = FileCheckpoint::open(&dir.path().join("epoch.chk"), "epoch", -1)?;
        assert_eq!(chk.read(), -1);
        assert_eq!(std::fs::metadata(chk.path())?.len(), 8);
        Ok(())
    }

    #[test]
    fn corrupted_checkpoint_file_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chaser.chk");
        std::fs::write(&path, [1, 2, 3])?;
        assert!(matches!(
            FileCheckpoint::open(&path, "chaser", 0),
            Err(CheckpointError::InvalidLength { len: 3, .. })
        ));
        Ok(())
    }
}
