//! # Backend driver
//!
//! A backend is an opaque key → (metadata, bytes) object store. This module
//! defines the trait every backend implements (SPEC_FULL.md §4.1), plus the
//! concrete drivers: [`local::LocalBackend`] (the reference, exercised by
//! tests) and [`memory::MemoryBackend`] (a fast in-process double used only
//! by unit tests of the layers that wrap a backend).

pub mod crypto_wrap;
pub mod local;
pub mod memory;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Backend error types. Every backend operation fails with one of these.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Retryable: network blip, throttling, timeout.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Not retryable: auth failure, quota exceeded, malformed request.
    #[error("permanent backend error: {0}")]
    Permanent(String),

    /// The requested key does not exist.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// A cloud driver that isn't wired up yet (Non-goal — see SPEC_FULL.md §4.1).
    #[error("backend kind not supported in this build: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Small string→string map attached to every object, mirroring the
/// `metadata_map` of SPEC_FULL.md §4.1/§6.
pub type ObjectMetadata = HashMap<String, String>;

/// Which kind of backend a `storage-url` names. Cloud variants are present
/// in the enum (and the CLI surface) but their constructors return
/// `BackendError::Unsupported`; see SPEC_FULL.md §4.1 Non-goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    S3,
    Azure,
    Gcs,
}

/// Readable stream returned by [`Backend::open_read`], with the object's
/// metadata attached (the source's "file-like object with a `.metadata`
/// attribute" idiom, made explicit per SPEC_FULL.md §9).
pub struct ReadHandle {
    pub metadata: ObjectMetadata,
    pub stream: Pin<Box<dyn AsyncRead + Send>>,
}

/// Writable stream returned by [`Backend::open_write`]. Dropping it without
/// calling `shutdown` may leave no object behind; callers must always
/// `AsyncWriteExt::shutdown` it to finalize the upload.
pub struct WriteHandle {
    pub stream: Pin<Box<dyn AsyncWrite + Send>>,
}

/// The object-store abstraction every backend and the crypto/compress
/// wrapper implement.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch metadata for `key` without downloading its body.
    async fn lookup(&self, key: &str) -> Result<ObjectMetadata>;

    /// Open `key` for reading.
    async fn open_read(&self, key: &str) -> Result<ReadHandle>;

    /// Open `key` for writing. The object becomes visible atomically once
    /// the returned stream is shut down; an existing object under the same
    /// key is replaced.
    async fn open_write(&self, key: &str, metadata: ObjectMetadata) -> Result<WriteHandle>;

    /// Delete `key`. If `force` is true, a missing key is not an error
    /// (SPEC_FULL.md §9 Open Question: resolved as "treat as success").
    async fn delete(&self, key: &str, force: bool) -> Result<()>;

    /// List all keys with the given prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Copy `src` to `dst`, overwriting `dst` if it exists.
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// Rename `src` to `dst`, overwriting `dst` if it exists.
    async fn rename(&self, src: &str, dst: &str) -> Result<()>;

    /// Whether `key` exists.
    async fn contains(&self, key: &str) -> Result<bool>;

    /// If true, object creation/deletion/overwrite is immediately visible to
    /// subsequent `lookup`/`open_read` calls.
    fn is_get_consistent(&self) -> bool;

    /// If true, a newly created object is immediately visible to `list`.
    fn is_list_create_consistent(&self) -> bool;
}
