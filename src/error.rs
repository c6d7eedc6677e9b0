//! Crate-wide error types.
//!
//! Each subsystem owns a narrow `thiserror` enum (see `backend`, `crypto`,
//! `compression`, `database`, `block_cache`); this module collects the
//! top-level error that the filesystem translator and the CLI binary deal in,
//! plus the errno mapping the FUSE adapter needs.

use thiserror::Error;

use crate::backend::BackendError;
use crate::compression::CompressionError;
use crate::crypto::CryptoError;
use crate::database::DbError;

/// Errors surfaced by the filesystem operations translator (`fs::Operations`).
///
/// Every variant maps to a POSIX errno via [`FsError::to_errno`], which is
/// the only thing the `fuser` adapter layer needs to know about.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not permitted on a locked inode (SPEC_FULL.md §8 scenario
    /// 7: `unlink`/`rmdir` under a locked tree), mapped to `EPERM` rather
    /// than `EACCES` to match the `s3qllock` tool's own errno.
    #[error("operation not permitted")]
    PermissionDenied,

    #[error("out of inode numbers")]
    OutOfInodes,

    #[error("no space left on device")]
    NoSpace,

    #[error("attribute not found")]
    NoAttribute,

    #[error("filesystem database error: {0}")]
    Database(#[from] DbError),

    #[error("block cache error: {0}")]
    Cache(#[from] crate::block_cache::CacheError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("not supported")]
    NotSupported,
}

impl FsError {
    /// Translate into the errno a FUSE reply should carry.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::PermissionDenied => libc::EPERM,
            FsError::OutOfInodes => libc::ENOSPC,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NoAttribute => libc::ENODATA,
            FsError::Database(_) => libc::EIO,
            FsError::Cache(_) => libc::EIO,
            FsError::Backend(_) => libc::EIO,
            FsError::NotSupported => libc::ENOSYS,
        }
    }
}

/// Errors from the metadata lifecycle (mount/umount/fsck sequencing).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Quiet(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("uncorrectable errors found during fsck")]
    UncorrectableErrors,

    #[error("filesystem appears to be mounted, refusing to run")]
    StillMounted,
}

/// Convenience alias used across the lifecycle and CLI modules.
pub type LifecycleResult<T> = Result<T, LifecycleError>;
