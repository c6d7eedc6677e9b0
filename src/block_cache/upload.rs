//! Upload pipeline: workers that compress, hash, dedup and upload dirty
//! blocks, plus the commit loop that finds blocks idle long enough to push
//! through the pipeline on its own (SPEC_FULL.md §4.4).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::entry::EntryState;
use super::{CacheError, Result, Shared};
use crate::database::{extents, objects};

const IDLE_THRESHOLD_SECS: i64 = 10;
const COMMIT_POLL: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 5;

pub(crate) fn spawn_workers(
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<(i64, i64)>,
    n_workers: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..n_workers.max(1))
        .map(|_| {
            let shared = shared.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match item {
                        Some((inode, blockno)) => {
                            if let Err(e) = upload_with_retries(&shared, inode, blockno).await {
                                log::error!("upload of ({inode}, {blockno}) failed permanently: {e}");
                            }
                        }
                        None => break,
                    }
                }
            })
        })
        .collect()
}

pub(crate) fn spawn_commit_loop(
    shared: Arc<Shared>,
    upload_tx: mpsc::UnboundedSender<(i64, i64)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(COMMIT_POLL).await;
            if shared.quit.load(Ordering::SeqCst) {
                break;
            }
            let due: Vec<(i64, i64)> = {
                let state = shared.state.lock().await;
                let now = crate::util::time::now_epoch();
                let mut due: Vec<_> = state
                    .order
                    .iter()
                    .filter_map(|key| {
                        let entry = state.entries.get(key)?;
                        if entry.state == EntryState::Dirty && now - entry.last_access > IDLE_THRESHOLD_SECS {
                            Some(*key)
                        } else {
                            None
                        }
                    })
                    .collect();
                due.sort_by_key(|key| state.entries.get(key).map(|e| e.last_access).unwrap_or(0));
                due
            };
            for key in due {
                let mut state = shared.state.lock().await;
                if let Some(e) = state.entries.get_mut(&key) {
                    if e.state == EntryState::Dirty {
                        e.state = EntryState::Uploading;
                    } else {
                        continue;
                    }
                }
                drop(state);
                let _ = upload_tx.send(key);
            }
        }
    })
}

async fn upload_with_retries(shared: &Arc<Shared>, inode: i64, blockno: i64) -> Result<()> {
    let mut attempt = 0;
    loop {
        match upload_one(shared, inode, blockno).await {
            Ok(()) => return Ok(()),
            Err(CacheError::Backend(crate::backend::BackendError::Transient(msg))) => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    return Err(CacheError::Backend(crate::backend::BackendError::Transient(msg)));
                }
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Compress, hash, dedup-or-upload, and mark clean a single dirty entry.
pub(crate) async fn upload_one(shared: &Arc<Shared>, inode: i64, blockno: i64) -> Result<()> {
    let payload = {
        let state = shared.state.lock().await;
        let entry = match state.entries.get(&(inode, blockno)) {
            Some(e) => e.clone(),
            None => return Ok(()),
        };
        drop(state);
        tokio::fs::read(&entry.path).await?
    };

    let hash = blake3::hash(&payload);
    let hash_bytes = hash.as_bytes().to_vec();

    let obj_id = match objects::by_hash(shared.db.pool(), &hash_bytes).await? {
        Some(existing) => {
            objects::incref(shared.db.pool(), existing.id).await?;
            existing.id
        }
        None => {
            let key = format!("s3ql_data_{}", hash.to_hex());
            let wh = shared.backend.open_write(&key, Default::default()).await;
            let mut wh = wh?;
            tokio::io::AsyncWriteExt::write_all(&mut wh.stream, &payload).await?;
            tokio::io::AsyncWriteExt::shutdown(&mut wh.stream).await?;
            objects::insert(shared.db.pool(), &hash_bytes, payload.len() as i64).await?
        }
    };

    let previous = extents::get(shared.db.pool(), inode, blockno).await?;
    extents::set(shared.db.pool(), inode, blockno, obj_id).await?;
    if let Some(prev) = previous {
        if prev.obj_id != obj_id {
            let refcount = objects::decref(shared.db.pool(), prev.obj_id).await?;
            if refcount <= 0 {
                if let Ok(old_obj) = objects::get(shared.db.pool(), prev.obj_id).await {
                    let key = format!("s3ql_data_{}", hex::encode(&old_obj.hash));
                    let _ = shared.backend.delete(&key, true).await;
                    let _ = objects::delete(shared.db.pool(), prev.obj_id).await;
                }
            }
        }
    }

    let mut state = shared.state.lock().await;
    if let Some(e) = state.entries.get_mut(&(inode, blockno)) {
        e.state = EntryState::Clean;
    }
    drop(state);
    shared.eviction_notify.notify_waiters();
    Ok(())
}
