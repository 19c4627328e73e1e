use std::fs::{self, File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use bincode::serde::Compat;
use fs2::FileExt;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FsError, FsResult};

/// What a load found under the backing file.
#[derive(Debug)]
pub enum Snapshot<T> {
    /// No file, or a file that has never been written.
    Absent,
    /// A file that exists but cannot be read or decoded.
    Unreadable,
    Value(T),
}

impl<T> Snapshot<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Snapshot::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// One structured value persisted under one file.
///
/// Writers serialize through [`Store::store`], which replaces the file
/// atomically (temp sibling + rename) and releases the exclusive lock taken
/// by [`Store::load_rw`]. The lock lives on a `.lock` sibling so that the
/// rename never swaps the locked inode out from under a holder.
pub struct Store<T> {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Option<File>,
    _value: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Store<T> {
    pub fn new<P: AsRef<Path>>(path: P) -> Store<T> {
        let path = path.as_ref().to_path_buf();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Store {
            path,
            lock_path: PathBuf::from(lock_path),
            guard: None,
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Snapshot of the value as of the last successful [`Store::store`].
    /// Takes no lock.
    pub fn load_ro(&self) -> Snapshot<T> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Snapshot::Absent,
            Err(e) => {
                debug!("reading {} failed: {e}", self.path.display());
                return Snapshot::Unreadable;
            }
        };
        if bytes.is_empty() {
            return Snapshot::Absent;
        }
        match bincode::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((Compat(value), _)) => Snapshot::Value(value),
            Err(e) => {
                debug!("decoding {} failed: {e}", self.path.display());
                Snapshot::Unreadable
            }
        }
    }

    /// Acquire the exclusive write lock, then read. No other writer can
    /// lock the same backing file until [`Store::store`] or
    /// [`Store::abort`].
    pub fn load_rw(&mut self) -> FsResult<Snapshot<T>> {
        self.lock()?;
        Ok(self.load_ro())
    }

    /// Atomically replace the stored value and release the write lock.
    /// Acquires the lock first if the caller skipped [`Store::load_rw`].
    pub fn store(&mut self, value: &T) -> FsResult<()> {
        self.lock()?;
        let bytes = bincode::encode_to_vec(Compat(value), bincode::config::standard())
            .map_err(|e| FsError::Corrupt {
                path: self.path.clone(),
                detail: e.to_string(),
            })?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        self.abort();
        Ok(())
    }

    /// Release the write lock without mutating anything.
    pub fn abort(&mut self) {
        if let Some(guard) = self.guard.take() {
            let _ = guard.unlock();
        }
    }

    fn lock(&mut self) -> FsResult<()> {
        if self.guard.is_some() {
            return Ok(());
        }
        let guard = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.lock_path)?;
        guard
            .try_lock_exclusive()
            .map_err(|_| FsError::Conflict(self.path.clone()))?;
        self.guard = Some(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_at(dir: &Path) -> Store<Vec<String>> {
        Store::new(dir.join(".teststate"))
    }

    #[test]
    fn absent_until_first_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        assert!(matches!(store.load_ro(), Snapshot::Absent));
        assert!(!store.exists());
    }

    #[test]
    fn round_trip_preserves_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path());
        let value = vec!["alpha".to_string(), "beta".to_string()];
        store.store(&value).unwrap();

        let reread = store_at(dir.path());
        assert_eq!(reread.load_ro().into_value(), Some(value));
    }

    #[test]
    fn garbage_reads_as_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        fs::write(dir.path().join(".teststate"), b"\xff\xfe not bincode").unwrap();
        assert!(matches!(store.load_ro(), Snapshot::Unreadable));
    }

    #[test]
    fn second_writer_conflicts_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = store_at(dir.path());
        let mut second = store_at(dir.path());

        first.load_rw().unwrap();
        assert!(matches!(second.load_rw(), Err(FsError::Conflict(_))));

        first.abort();
        assert!(second.load_rw().is_ok());
        second.abort();
    }

    #[test]
    fn store_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = store_at(dir.path());
        let mut second = store_at(dir.path());

        first.load_rw().unwrap();
        first.store(&vec!["x".to_string()]).unwrap();
        assert!(second.load_rw().is_ok());
        second.abort();
    }
}
