//! Advisory file locks shared by every process working on one source directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Serializes record store writers. Also carries the store generation.
pub const STORE_LOCK_FILE: &str = ".lock";
/// Held for the whole of an update run or a duplicate cleanup.
pub const RUN_LOCK_FILE: &str = ".run.lock";

/// An exclusive lock on a file, released when dropped.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Waits until the lock is free.
    pub async fn acquire(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        tokio::task::spawn_blocking(move || {
            let file = open_lock_file(&path)?;
            file.lock_exclusive()?;
            Ok(Self { file, path })
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
    }

    /// `None` when someone else holds the lock.
    pub async fn try_acquire(path: impl Into<PathBuf>) -> io::Result<Option<Self>> {
        let path = path.into();
        tokio::task::spawn_blocking(move || {
            let file = open_lock_file(&path)?;
            match file.try_lock_exclusive() {
                Ok(()) => Ok(Some(Self { file, path })),
                Err(err) if is_contended(&err) => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counter bumped whenever the store file is rewritten rather than appended to.
    pub fn generation(&mut self) -> io::Result<u64> {
        let mut text = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut text)?;
        Ok(text.trim().parse().unwrap_or(0))
    }

    pub fn set_generation(&mut self, generation: u64) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{generation}")?;
        self.file.sync_data()
    }
}

/// Reads the generation without taking the lock. Only good as a change hint.
pub async fn peek_generation(path: &Path) -> u64 {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
