//! Shared integration-test harness. Wires a [`MemoryBackend`] through
//! `mkfs` / `Lifecycle::mount` / `Operations` the same way `cli::cmd_mount`
//! does, so these tests exercise the real mount/unmount code paths without
//! a kernel FUSE session (SPEC_FULL.md §8: "implemented as integration
//! tests against `Operations` and the metadata-lifecycle module directly").

use std::path::PathBuf;
use std::sync::Arc;

use s3ql::backend::memory::MemoryBackend;
use s3ql::backend::Backend;
use s3ql::block_cache::BlockCache;
use s3ql::compression::Algorithm;
use s3ql::crypto::DataKey;
use s3ql::database::MetadataDb;
use s3ql::fs::operations::{MountConfig, Operations};
use s3ql::metadata::lifecycle::Lifecycle;
use s3ql::metadata::mkfs;

pub const COMPRESS: Algorithm = Algorithm::None;
pub const PASSPHRASE: &str = "hunter2";

/// Run `mkfs` against a fresh in-memory backend and return it with its data
/// key. `workdir` only hosts the throwaway local DB `mkfs` builds to seed
/// the initial snapshot; it is not reused by any later mount.
pub async fn fresh_backend(label: &str, blocksize: u64, workdir: &std::path::Path) -> (Arc<dyn Backend>, DataKey) {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let key = DataKey::generate();
    mkfs::mkfs(
        backend.clone(),
        key.clone(),
        PASSPHRASE.to_string(),
        label.to_string(),
        blocksize,
        &workdir.join("mkfs-seed.db"),
    )
    .await
    .unwrap();
    (backend, key)
}

pub struct Mount {
    pub ops: Operations,
    pub lifecycle: Lifecycle,
    pub db: Arc<MetadataDb>,
}

/// Mount `backend` at `cache_dir`: resolve the seq_no/params lifecycle,
/// open (or rebuild) the local DB, then wire the block cache and operations
/// translator on top, mirroring `cli::cmd_mount`.
pub async fn mount(backend: Arc<dyn Backend>, key: DataKey, cache_dir: PathBuf) -> Mount {
    let (lifecycle, db) = Lifecycle::mount(backend.clone(), key, COMPRESS, cache_dir.clone()).await.unwrap();
    let blocksize = lifecycle.params.blocksize as i64;
    let db = Arc::new(db);
    let block_cache = Arc::new(
        BlockCache::new(cache_dir.join("blocks"), 64, 1 << 24, 2, backend, db.clone())
            .await
            .unwrap(),
    );
    let ops = Operations::new(db.clone(), block_cache, MountConfig { nfs_mode: false, blocksize });
    Mount { ops, lifecycle, db }
}

/// Like [`mount`], but surfaces the `Lifecycle::mount` error instead of
/// unwrapping it, for tests asserting a refusal.
pub async fn try_mount(backend: Arc<dyn Backend>, key: DataKey, cache_dir: PathBuf) -> Result<Mount, s3ql::error::LifecycleError> {
    let (lifecycle, db) = Lifecycle::mount(backend.clone(), key, COMPRESS, cache_dir.clone()).await?;
    let blocksize = lifecycle.params.blocksize as i64;
    let db = Arc::new(db);
    let block_cache = BlockCache::new(cache_dir.join("blocks"), 64, 1 << 24, 2, backend, db.clone())
        .await
        .map_err(|e| s3ql::error::LifecycleError::Quiet(e.to_string()))?;
    let ops = Operations::new(db.clone(), Arc::new(block_cache), MountConfig { nfs_mode: false, blocksize });
    Ok(Mount { ops, lifecycle, db })
}

impl Mount {
    /// Clean shutdown: drain the block cache, then run the unmount sequence
    /// (upload the final snapshot, clear `needs_fsck`). Returns the local
    /// DB and params paths for callers that want to fsck or inspect them
    /// afterwards, since `Lifecycle` itself is consumed here.
    pub async fn unmount(self) -> (PathBuf, PathBuf) {
        let db_path = self.lifecycle.db_path.clone();
        let params_path = self.lifecycle.params_path.clone();
        self.ops.destroy().await.unwrap();
        self.lifecycle.unmount(self.db.as_ref()).await.unwrap();
        self.db.close().await;
        (db_path, params_path)
    }

    /// Shutdown that expects `Lifecycle::unmount` to detect a concurrent
    /// mount and refuse, returning the error instead of panicking.
    pub async fn unmount_expect_conflict(self) -> s3ql::error::LifecycleError {
        self.ops.destroy().await.unwrap();
        let err = self.lifecycle.unmount(self.db.as_ref()).await.unwrap_err();
        self.db.close().await;
        err
    }
}
