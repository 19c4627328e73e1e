use std::io;
use std::path::PathBuf;

use libc::{c_int, EACCES, EINVAL, EIO, ENOENT};
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no entry for `{0}`")]
    NotFound(String),

    #[error("permission denied for `{0}`")]
    Permission(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("persisted state at {path} is unreadable: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("another writer holds the lock on {0}")]
    Conflict(PathBuf),

    #[error("invalid input: {0}")]
    Invalid(String),
}

impl FsError {
    /// Negative-errno projection for the kernel bridge.
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound(_) => ENOENT,
            FsError::Permission(_) => EACCES,
            FsError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            FsError::Corrupt { .. } | FsError::Conflict(_) => EIO,
            FsError::Invalid(_) => EINVAL,
        }
    }
}
