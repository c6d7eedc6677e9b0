//! Fresh-backend initialization (SPEC_FULL.md §4.6 "mkfs (ADDED)"): the
//! creation path the retrieved source's `mkfs.py` isn't present for, but
//! that the lifecycle above requires.

use std::path::Path;
use std::sync::Arc;

use crate::backend::{Backend, ObjectMetadata};
use crate::crypto::{DataKey, WrappedDataKey};
use crate::database::{inodes, models::Inode, MetadataDb};
use crate::error::{LifecycleError, LifecycleResult};

use super::lifecycle::backend_seq_no;
use super::params::Params;

const PASSPHRASE_KEY: &str = "s3ql_passphrase";
const METADATA_KEY: &str = "s3ql_metadata";

/// Create the local SQLite DB for a freshly-mkfs'd filesystem and populate
/// the root and control inodes. Also used by `mount` the first time it
/// bootstraps a cache dir from a downloaded snapshot that (in the mkfs-only
/// case) is this very file.
pub async fn init_local_db(db_path: &Path) -> LifecycleResult<MetadataDb> {
    let db = MetadataDb::open(db_path).await?;
    let now = crate::util::time::now_epoch();
    if !inodes::exists(db.pool(), crate::fs::operations::ROOT_INODE).await? {
        inodes::insert(
            db.pool(),
            &Inode {
                id: crate::fs::operations::ROOT_INODE,
                mode: (libc::S_IFDIR | 0o755) as i64,
                refcount: 2,
                uid: 0,
                gid: 0,
                size: 0,
                locked: 0,
                rdev: 0,
                atime: now,
                mtime: now,
                ctime: now,
            },
        )
        .await?;
    }
    if !inodes::exists(db.pool(), crate::fs::operations::CTRL_INODE).await? {
        inodes::insert(
            db.pool(),
            &Inode {
                id: crate::fs::operations::CTRL_INODE,
                mode: (libc::S_IFREG | 0o600) as i64,
                refcount: 1,
                uid: 0,
                gid: 0,
                size: 0,
                locked: 1,
                rdev: 0,
                atime: now,
                mtime: now,
                ctime: now,
            },
        )
        .await?;
    }
    Ok(db)
}

/// Initialize a fresh backend: seq\_no marker, wrapped data key, a local
/// SQLite DB seeded with the root and control inodes, an initial `.params`,
/// and an uploaded `s3ql_metadata` snapshot of that DB. Refuses if the
/// backend already looks initialized unless `force` is set. `local_db_path`
/// is where the cache-directory DB this mount will use lives; mkfs builds
/// it in place so the filesystem can be mounted immediately afterwards.
pub async fn mkfs(
    backend: Arc<dyn Backend>,
    data_key: DataKey,
    passphrase: String,
    label: String,
    blocksize: u64,
    local_db_path: &Path,
) -> LifecycleResult<()> {
    mkfs_inner(backend, data_key, passphrase, label, blocksize, false, local_db_path).await
}

pub async fn mkfs_forced(
    backend: Arc<dyn Backend>,
    data_key: DataKey,
    passphrase: String,
    label: String,
    blocksize: u64,
    force: bool,
    local_db_path: &Path,
) -> LifecycleResult<()> {
    mkfs_inner(backend, data_key, passphrase, label, blocksize, force, local_db_path).await
}

async fn mkfs_inner(
    backend: Arc<dyn Backend>,
    data_key: DataKey,
    passphrase: String,
    label: String,
    blocksize: u64,
    force: bool,
    local_db_path: &Path,
) -> LifecycleResult<()> {
    let existing_seq_no = backend_seq_no(backend.as_ref()).await?;
    if existing_seq_no > 0 && !force {
        return Err(LifecycleError::Quiet(
            "backend already appears to hold an s3ql filesystem; pass --force to overwrite".to_string(),
        ));
    }

    let mut marker = backend.open_write("s3ql_seq_no_1", ObjectMetadata::default()).await?;
    tokio::io::AsyncWriteExt::write_all(&mut marker.stream, b"Empty").await?;
    tokio::io::AsyncWriteExt::shutdown(&mut marker.stream).await?;

    let wrapped = WrappedDataKey::wrap(&data_key, &passphrase)?;
    let wrapped_bytes = bincode::serialize(&wrapped)?;
    let mut passphrase_obj = backend.open_write(PASSPHRASE_KEY, ObjectMetadata::default()).await?;
    tokio::io::AsyncWriteExt::write_all(&mut passphrase_obj.stream, &wrapped_bytes).await?;
    tokio::io::AsyncWriteExt::shutdown(&mut passphrase_obj.stream).await?;

    if let Some(parent) = local_db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let db = init_local_db(local_db_path).await?;
    db.close().await;
    let dump = tokio::fs::read(local_db_path).await?;

    let params = Params::fresh(label, blocksize);
    let compress = crate::compression::Algorithm::None;
    super::lifecycle::upload_snapshot(backend.as_ref(), &data_key, compress, &params, &dump).await?;

    let params_path = local_db_path.with_file_name(".params");
    tokio::fs::write(&params_path, params.to_bytes()?).await?;

    log::info!("mkfs: backend initialized, label={:?}, blocksize={blocksize}", params.label);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn mkfs_writes_seq_no_passphrase_and_metadata_markers() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let key = DataKey::generate();
        let dir = tempfile::tempdir().unwrap();
        mkfs(
            backend.clone(),
            key,
            "hunter2".to_string(),
            "myfs".to_string(),
            131072,
            &dir.path().join("t.db"),
        )
        .await
        .unwrap();

        assert!(backend.contains("s3ql_seq_no_1").await.unwrap());
        assert!(backend.contains(PASSPHRASE_KEY).await.unwrap());
        assert!(backend.contains(METADATA_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn mkfs_refuses_to_overwrite_without_force() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let dir = tempfile::tempdir().unwrap();
        mkfs(
            backend.clone(),
            DataKey::generate(),
            "a".to_string(),
            "x".to_string(),
            131072,
            &dir.path().join("t.db"),
        )
        .await
        .unwrap();

        let result = mkfs(
            backend.clone(),
            DataKey::generate(),
            "a".to_string(),
            "x".to_string(),
            131072,
            &dir.path().join("t2.db"),
        )
        .await;
        assert!(result.is_err());

        mkfs_forced(
            backend,
            DataKey::generate(),
            "a".to_string(),
            "x".to_string(),
            131072,
            true,
            &dir.path().join("t3.db"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn init_local_db_creates_root_and_ctrl_inodes() {
        let dir = tempfile::tempdir().unwrap();
        let db = init_local_db(&dir.path().join("t.db")).await.unwrap();
        assert!(inodes::exists(db.pool(), crate::fs::operations::ROOT_INODE).await.unwrap());
        assert!(inodes::exists(db.pool(), crate::fs::operations::CTRL_INODE).await.unwrap());
    }
}
