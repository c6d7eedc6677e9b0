//! # Inode cache
//!
//! Bounded write-behind LRU over `inodes` rows (SPEC_FULL.md §4.3). Eviction
//! uses a ring-buffer pointer rather than tracking access recency — a
//! deliberate simplification the spec calls out, since the working set is
//! small relative to capacity.

use std::collections::HashMap;

use rand::RngCore;

use crate::database::models::Inode;
use crate::database::{inodes, ConnectionPool, DbError};
use crate::util::time::now_epoch;

const CAPACITY: usize = 100;
const MAX_RANDOM_RETRIES: u32 = 100;

/// Attributes for a freshly-created inode; timestamps default to "now".
#[derive(Debug, Clone)]
pub struct NewInode {
    pub mode: i64,
    pub uid: i64,
    pub gid: i64,
    pub rdev: i64,
}

struct Slot {
    inode: Inode,
    dirty: bool,
}

/// Write-behind cache of inode rows, backed by the metadata DB.
pub struct InodeCache {
    pool: ConnectionPool,
    slots: HashMap<i64, Slot>,
    /// Insertion order, used as the ring buffer for eviction.
    order: Vec<i64>,
    eviction_ptr: usize,
    nfs_mode: bool,
}

impl InodeCache {
    pub fn new(pool: ConnectionPool, nfs_mode: bool) -> Self {
        InodeCache {
            pool,
            slots: HashMap::with_capacity(CAPACITY),
            order: Vec::with_capacity(CAPACITY),
            eviction_ptr: 0,
            nfs_mode,
        }
    }

    /// Fetch a copy of the inode, populating the cache on miss.
    pub async fn get(&mut self, id: i64) -> Result<Inode, DbError> {
        if let Some(slot) = self.slots.get(&id) {
            return Ok(slot.inode.clone());
        }
        let inode = inodes::get(&self.pool, id).await?;
        self.insert_slot(id, inode.clone(), false).await?;
        Ok(inode)
    }

    /// Apply `mutate` to the cached inode (loading it first if necessary)
    /// and mark it dirty.
    pub async fn update<F>(&mut self, id: i64, mutate: F) -> Result<Inode, DbError>
    where
        F: FnOnce(&mut Inode),
    {
        let mut inode = self.get(id).await?;
        mutate(&mut inode);
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.inode = inode.clone();
            slot.dirty = true;
        }
        Ok(inode)
    }

    /// Create a new inode, choosing its id sequentially or, in NFS mode,
    /// randomly from `[0, 2^32)` with up to 100 retries on collision.
    pub async fn create(&mut self, attrs: NewInode) -> Result<Inode, DbError> {
        let id = if self.nfs_mode {
            self.allocate_random_id().await?
        } else {
            self.allocate_sequential_id().await?
        };

        let now = now_epoch();
        let inode = Inode {
            id,
            mode: attrs.mode,
            refcount: 1,
            uid: attrs.uid,
            gid: attrs.gid,
            size: 0,
            locked: 0,
            rdev: attrs.rdev,
            atime: now,
            mtime: now,
            ctime: now,
        };
        inodes::insert(&self.pool, &inode).await?;
        self.insert_slot(id, inode.clone(), false).await?;
        Ok(inode)
    }

    async fn allocate_sequential_id(&self) -> Result<i64, DbError> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM inodes")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    async fn allocate_random_id(&self) -> Result<i64, DbError> {
        for _ in 0..MAX_RANDOM_RETRIES {
            let candidate = (rand::rngs::OsRng.next_u32() as i64).max(1);
            if !inodes::exists(&self.pool, candidate).await? {
                return Ok(candidate);
            }
        }
        Err(DbError::Constraint("out of inode numbers".into()))
    }

    /// Delete an inode's row and drop it from the cache.
    pub async fn delete(&mut self, id: i64) -> Result<(), DbError> {
        inodes::delete(&self.pool, id).await?;
        self.slots.remove(&id);
        self.order.retain(|&x| x != id);
        Ok(())
    }

    /// Write every dirty entry back to the database without evicting.
    pub async fn flush(&mut self) -> Result<(), DbError> {
        for id in self.order.clone() {
            if let Some(slot) = self.slots.get_mut(&id) {
                if slot.dirty {
                    inodes::update(&self.pool, &slot.inode).await?;
                    slot.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Flush and release all entries. After this, the cache must not be used.
    pub async fn destroy(mut self) -> Result<(), DbError> {
        self.flush().await
    }

    async fn insert_slot(&mut self, id: i64, inode: Inode, dirty: bool) -> Result<(), DbError> {
        if self.slots.len() >= CAPACITY && !self.slots.contains_key(&id) {
            self.evict_one().await?;
        }
        if !self.slots.contains_key(&id) {
            self.order.push(id);
        }
        self.slots.insert(id, Slot { inode, dirty });
        Ok(())
    }

    async fn evict_one(&mut self) -> Result<(), DbError> {
        if self.order.is_empty() {
            return Ok(());
        }
        self.eviction_ptr %= self.order.len();
        let victim = self.order.remove(self.eviction_ptr);
        if let Some(slot) = self.slots.remove(&victim) {
            if slot.dirty {
                inodes::update(&self.pool, &slot.inode).await?;
            }
        }
        Ok(())
    }
}
