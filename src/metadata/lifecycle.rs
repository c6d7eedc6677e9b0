//! Seq\_no arbitration and the mount/unmount sequence (SPEC_FULL.md §4.6).
//!
//! The monotonic `seq_no` marker is the crate's defence against two mounts
//! of the same backend running at once: whichever mount bumps the backend's
//! highest `s3ql_seq_no_<N>` marker last wins, and anyone who notices their
//! local view is behind refuses to proceed rather than silently diverging.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, ObjectMetadata};
use crate::compression::{self, Algorithm};
use crate::crypto::DataKey;
use crate::database::MetadataDb;
use crate::error::{LifecycleError, LifecycleResult};

use super::params::Params;

const SEQ_NO_PREFIX: &str = "s3ql_seq_no_";
const METADATA_KEY: &str = "s3ql_metadata";
const METADATA_BAK_1: &str = "s3ql_metadata_bak_1";
const METADATA_BAK_2: &str = "s3ql_metadata_bak_2";

/// Wire format of an `s3ql_metadata` snapshot: the params blob travels with
/// the DB dump so a fresh mount on a new machine recovers both from a single
/// backend object.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    params: Params,
    db: Vec<u8>,
}

/// A live mount's handle on the lifecycle: the backend, the data key used to
/// encrypt metadata snapshots, the local on-disk paths, and the current
/// in-memory params (kept in sync with the `.params` file on disk).
pub struct Lifecycle {
    pub backend: Arc<dyn Backend>,
    pub data_key: DataKey,
    pub compress: Algorithm,
    pub cache_dir: PathBuf,
    pub params_path: PathBuf,
    pub db_path: PathBuf,
    pub params: Params,
}

/// Read the highest existing `s3ql_seq_no_<N>` marker on the backend. `0` if
/// the filesystem has never been mounted (shouldn't happen post-`mkfs`, but
/// treated as "no prior mount" rather than an error).
pub async fn backend_seq_no(backend: &dyn Backend) -> LifecycleResult<u64> {
    let keys = backend.list(SEQ_NO_PREFIX).await?;
    Ok(keys
        .iter()
        .filter_map(|k| k.strip_prefix(SEQ_NO_PREFIX))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .unwrap_or(0))
}

impl Lifecycle {
    /// Step 1-6 of the mount sequence. On success the local DB is ready to
    /// serve, `needs_fsck` is set for the duration of the mount, and a fresh
    /// `s3ql_seq_no_<N>` marker has been written.
    pub async fn mount(
        backend: Arc<dyn Backend>,
        data_key: DataKey,
        compress: Algorithm,
        cache_dir: PathBuf,
    ) -> LifecycleResult<(Self, MetadataDb)> {
        let params_path = cache_dir.join(".params");
        let db_path = cache_dir.join("metadata.db");
        tokio::fs::create_dir_all(&cache_dir).await?;

        let remote_seq_no = backend_seq_no(backend.as_ref()).await?;
        if remote_seq_no == 0 {
            return Err(LifecycleError::Quiet(
                "no seq_no markers found on backend; has mkfs been run?".to_string(),
            ));
        }

        let mut params = match tokio::fs::read(&params_path).await {
            Ok(bytes) => Params::from_bytes(&bytes)?,
            Err(_) => download_and_rebuild(backend.as_ref(), &data_key, &db_path).await?,
        };

        if params.seq_no < remote_seq_no {
            if !backend.is_get_consistent() {
                log::warn!("local seq_no {} behind backend {remote_seq_no}, but backend is eventually consistent; proceeding cautiously", params.seq_no);
            } else {
                return Err(LifecycleError::Quiet(format!(
                    "local seq_no {} is behind the backend's {remote_seq_no}; refusing to mount \
                     (likely a concurrent mount elsewhere). Run fsck.",
                    params.seq_no
                )));
            }
        }

        if params.needs_fsck {
            return Err(LifecycleError::Quiet(
                "filesystem needs fsck, refusing to mount".to_string(),
            ));
        }

        if params.revision > super::params::CURRENT_REVISION {
            return Err(LifecycleError::Quiet(format!(
                "filesystem revision {} is newer than this binary understands ({})",
                params.revision,
                super::params::CURRENT_REVISION
            )));
        }

        if !tokio::fs::try_exists(&db_path).await.unwrap_or(false) {
            download_and_rebuild(backend.as_ref(), &data_key, &db_path).await?;
        }
        let db = MetadataDb::open(&db_path).await?;

        params.seq_no = remote_seq_no.max(params.seq_no) + 1;
        params.needs_fsck = true;
        write_seq_no_marker(backend.as_ref(), params.seq_no).await?;
        write_params(&params_path, &params).await?;

        Ok((
            Lifecycle {
                backend,
                data_key,
                compress,
                cache_dir,
                params_path,
                db_path,
                params,
            },
            db,
        ))
    }

    /// Dump the DB to a temp file under lock, release the lock, re-check the
    /// backend seq\_no, and upload only if nothing else has mounted meanwhile.
    pub async fn periodic_upload(&mut self, db: &MetadataDb) -> LifecycleResult<()> {
        let snapshot = {
            let _writer = db.writer().await;
            dump_db(&self.db_path).await?
        };

        let remote_seq_no = backend_seq_no(self.backend.as_ref()).await?;
        if remote_seq_no != self.params.seq_no {
            log::warn!(
                "periodic metadata upload aborted: backend seq_no {remote_seq_no} != local {}",
                self.params.seq_no
            );
            return Ok(());
        }

        let mut uploaded = self.params.clone();
        uploaded.seq_no = self.params.seq_no.saturating_sub(1);
        uploaded.last_modified = crate::util::time::now_epoch();
        upload_snapshot(self.backend.as_ref(), &self.data_key, self.compress, &uploaded, &snapshot).await?;
        Ok(())
    }

    /// Step 1-3 of the unmount sequence: re-check the backend seq\_no and
    /// either upload a final snapshot or rotate local backups and demand
    /// `fsck`.
    pub async fn unmount(mut self, db: &MetadataDb) -> LifecycleResult<()> {
        let snapshot = {
            let _writer = db.writer().await;
            dump_db(&self.db_path).await?
        };

        let remote_seq_no = backend_seq_no(self.backend.as_ref()).await?;
        if remote_seq_no == self.params.seq_no {
            self.params.needs_fsck = false;
            self.params.last_modified = crate::util::time::now_epoch();
            cycle_metadata(self.backend.as_ref(), &self.data_key, self.compress, &self.params, &snapshot).await?;
            write_params(&self.params_path, &self.params).await?;
            Ok(())
        } else {
            log::error!(
                "backend seq_no {remote_seq_no} advanced past ours ({}) during unmount; \
                 another mount started. Rotating local backups, fsck required.",
                self.params.seq_no
            );
            rotate_local_backups(&self.params_path, &self.db_path).await?;
            Err(LifecycleError::Quiet(
                "concurrent mount detected at unmount; local metadata rotated, run fsck".to_string(),
            ))
        }
    }
}

async fn write_seq_no_marker(backend: &dyn Backend, seq_no: u64) -> LifecycleResult<()> {
    let key = format!("{SEQ_NO_PREFIX}{seq_no}");
    let mut wh = backend.open_write(&key, ObjectMetadata::default()).await?;
    tokio::io::AsyncWriteExt::write_all(&mut wh.stream, b"Empty").await?;
    tokio::io::AsyncWriteExt::shutdown(&mut wh.stream).await?;
    Ok(())
}

async fn write_params(path: &Path, params: &Params) -> LifecycleResult<()> {
    let bytes = params.to_bytes()?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

async fn dump_db(db_path: &Path) -> LifecycleResult<Vec<u8>> {
    Ok(tokio::fs::read(db_path).await?)
}

pub(crate) async fn encode_snapshot(
    data_key: &DataKey,
    compress: Algorithm,
    params: &Params,
    db_bytes: &[u8],
) -> LifecycleResult<Vec<u8>> {
    let payload = SnapshotPayload { params: params.clone(), db: db_bytes.to_vec() };
    let serialized = bincode::serialize(&payload)?;
    let compressed = compression::compress(&serialized, compress)?;
    Ok(data_key.encrypt(&compressed)?)
}

async fn decode_snapshot(data_key: &DataKey, compress: Algorithm, body: &[u8]) -> LifecycleResult<(Params, Vec<u8>)> {
    let compressed = data_key.decrypt(body)?;
    let serialized = compression::decompress(&compressed, compress)?;
    let payload: SnapshotPayload = bincode::deserialize(&serialized)?;
    Ok((payload.params, payload.db))
}

pub(crate) async fn upload_snapshot(
    backend: &dyn Backend,
    data_key: &DataKey,
    compress: Algorithm,
    params: &Params,
    db_bytes: &[u8],
) -> LifecycleResult<()> {
    let body = encode_snapshot(data_key, compress, params, db_bytes).await?;
    let mut metadata = ObjectMetadata::new();
    metadata.insert("compression".to_string(), compress.as_str().to_string());
    metadata.insert("seq_no".to_string(), params.seq_no.to_string());
    let mut wh = backend.open_write(METADATA_KEY, metadata).await?;
    tokio::io::AsyncWriteExt::write_all(&mut wh.stream, &body).await?;
    tokio::io::AsyncWriteExt::shutdown(&mut wh.stream).await?;
    Ok(())
}

/// `s3ql_metadata_bak_1 → s3ql_metadata_bak_2`, `s3ql_metadata →
/// s3ql_metadata_bak_1`, new snapshot → `s3ql_metadata`.
pub async fn cycle_metadata(
    backend: &dyn Backend,
    data_key: &DataKey,
    compress: Algorithm,
    params: &Params,
    db_bytes: &[u8],
) -> LifecycleResult<()> {
    if backend.contains(METADATA_BAK_1).await? {
        backend.rename(METADATA_BAK_1, METADATA_BAK_2).await?;
    }
    if backend.contains(METADATA_KEY).await? {
        backend.rename(METADATA_KEY, METADATA_BAK_1).await?;
    }
    upload_snapshot(backend, data_key, compress, params, db_bytes).await
}

/// Download `s3ql_metadata`, decrypt/decompress it using the compression
/// algorithm recorded in its own object metadata, write the DB bytes to
/// `db_path`, and return the recovered params.
pub(crate) async fn download_and_rebuild(backend: &dyn Backend, data_key: &DataKey, db_path: &Path) -> LifecycleResult<Params> {
    let mut rh = backend.open_read(METADATA_KEY).await?;
    let compress = rh
        .metadata
        .get("compression")
        .and_then(|s| Algorithm::parse(s).ok())
        .unwrap_or(Algorithm::None);
    let mut body = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut rh.stream, &mut body).await?;
    let (params, db_bytes) = decode_snapshot(data_key, compress, &body).await?;
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(db_path, db_bytes).await?;
    Ok(params)
}

/// Rotate `.params`/`.db` through four numbered backups (`.0`..`.3`) rather
/// than overwrite them, when unmount detects a concurrent mount.
async fn rotate_local_backups(params_path: &Path, db_path: &Path) -> LifecycleResult<()> {
    for path in [params_path, db_path] {
        for i in (0..3).rev() {
            let from = path.with_extension(format!("{}", i));
            let to = path.with_extension(format!("{}", i + 1));
            if tokio::fs::try_exists(&from).await.unwrap_or(false) {
                let _ = tokio::fs::rename(&from, &to).await;
            }
        }
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let _ = tokio::fs::rename(path, path.with_extension("0")).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn mount_bumps_seq_no_and_clean_unmount_clears_needs_fsck() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let key = DataKey::generate();

        super::super::mkfs::mkfs(
            backend.clone(),
            key.clone(),
            "hunter2".to_string(),
            "test".to_string(),
            131072,
            &dir.path().join("mkfs").join("t.db"),
        )
        .await
        .unwrap();

        let cache_dir = dir.path().join("a");
        let (lifecycle, db) = Lifecycle::mount(backend.clone(), key, Algorithm::None, cache_dir)
            .await
            .unwrap();
        assert_eq!(lifecycle.params.seq_no, 2);
        assert!(lifecycle.params.needs_fsck);
        assert_eq!(lifecycle.params.label, "test");

        lifecycle.unmount(&db).await.unwrap();
        assert_eq!(backend_seq_no(backend.as_ref()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cycle_metadata_rotates_backups() {
        let backend = MemoryBackend::new();
        let mut wh = backend.open_write(METADATA_KEY, Default::default()).await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut wh.stream).await.unwrap();
        let key = DataKey::generate();
        let params = Params::fresh("x".to_string(), 131072);
        cycle_metadata(&backend, &key, Algorithm::None, &params, b"db-bytes").await.unwrap();
        assert!(backend.contains(METADATA_BAK_1).await.unwrap());
        assert!(backend.contains(METADATA_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn mount_without_mkfs_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let result = Lifecycle::mount(backend, DataKey::generate(), Algorithm::None, dir.path().join("a")).await;
        assert!(result.is_err());
    }
}
