//! POSIX surface translator (SPEC_FULL.md §4.5). Backend-agnostic: talks
//! only to the inode cache, block cache and metadata DB, never to `fuser`
//! types, so it can be exercised directly in tests.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::block_cache::BlockCache;
use crate::database::{contents, extents, inodes, models::Inode, objects, ConnectionPool, MetadataDb};
use crate::error::FsError;
use crate::inode_cache::{InodeCache, NewInode};
use crate::util::time::now_epoch;

/// Reserved inode ids. The root directory is always inode 1 (the `fuser`
/// convention, `FUSE_ROOT_ID`); the control inode is a normal `inodes` row
/// created at `mkfs` time that `setxattr`/`getxattr` special-case.
pub const ROOT_INODE: i64 = 1;
pub const CTRL_INODE: i64 = 2;
pub const CTRL_NAME: &[u8] = b"s3ql_ctrl";

/// Per-mount options that replace the source's module-level globals
/// (SPEC_FULL.md §9).
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub nfs_mode: bool,
    pub blocksize: i64,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig { nfs_mode: false, blocksize: 128 * 1024 }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SetAttrs {
    pub mode: Option<i64>,
    pub uid: Option<i64>,
    pub gid: Option<i64>,
    pub size: Option<i64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub files: u64,
    pub bsize: u32,
    pub namelen: u32,
}

pub struct Operations {
    db: Arc<MetadataDb>,
    inode_cache: AsyncMutex<InodeCache>,
    block_cache: Arc<BlockCache>,
    /// Coarse filesystem lock: held for the duration of each VFS operation's
    /// metadata mutation, released around backend I/O (SPEC_FULL.md §5).
    fs_lock: parking_lot::Mutex<()>,
    config: MountConfig,
}

impl Operations {
    pub fn new(db: Arc<MetadataDb>, block_cache: Arc<BlockCache>, config: MountConfig) -> Self {
        let inode_cache = InodeCache::new(db.pool().clone(), config.nfs_mode);
        Operations {
            db,
            inode_cache: AsyncMutex::new(inode_cache),
            block_cache,
            fs_lock: parking_lot::Mutex::new(()),
            config,
        }
    }

    fn pool(&self) -> &ConnectionPool {
        self.db.pool()
    }

    pub async fn lookup(&self, parent: i64, name: &[u8]) -> Result<Inode, FsError> {
        if parent == ROOT_INODE && name == CTRL_NAME {
            return self.getattr(CTRL_INODE).await;
        }
        let _guard = self.fs_lock.lock();
        let entry = contents::lookup(self.pool(), parent, name)
            .await
            .map_err(|_| FsError::NotFound)?;
        let mut cache = self.inode_cache.lock().await;
        cache.get(entry.inode).await.map_err(FsError::from)
    }

    pub async fn getattr(&self, inode: i64) -> Result<Inode, FsError> {
        let mut cache = self.inode_cache.lock().await;
        cache.get(inode).await.map_err(|_| FsError::NotFound)
    }

    pub async fn setattr(&self, inode: i64, attrs: SetAttrs) -> Result<Inode, FsError> {
        let _guard = self.fs_lock.lock();
        let mut cache = self.inode_cache.lock().await;
        let now = now_epoch();
        let updated = cache
            .update(inode, |i| {
                if let Some(mode) = attrs.mode {
                    i.mode = mode;
                }
                if let Some(uid) = attrs.uid {
                    i.uid = uid;
                }
                if let Some(gid) = attrs.gid {
                    i.gid = gid;
                }
                if let Some(size) = attrs.size {
                    i.size = size;
                }
                if let Some(atime) = attrs.atime {
                    i.atime = atime;
                }
                if let Some(mtime) = attrs.mtime {
                    i.mtime = mtime;
                }
                i.ctime = now;
            })
            .await
            .map_err(|_| FsError::NotFound)?;
        drop(cache);

        if let Some(new_size) = attrs.size {
            self.truncate_extents(inode, new_size).await?;
        }
        Ok(updated)
    }

    async fn create_entry(
        &self,
        parent: i64,
        name: &[u8],
        mode: i64,
        rdev: i64,
        uid: i64,
        gid: i64,
    ) -> Result<Inode, FsError> {
        let _guard = self.fs_lock.lock();
        let parent_inode = {
            let mut cache = self.inode_cache.lock().await;
            cache.get(parent).await.map_err(|_| FsError::NotFound)?
        };
        if !parent_inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if contents::lookup(self.pool(), parent, name).await.is_ok() {
            return Err(FsError::AlreadyExists);
        }

        let mut cache = self.inode_cache.lock().await;
        let inode = cache
            .create(NewInode { mode, uid, gid, rdev })
            .await
            .map_err(|e| match e {
                crate::database::DbError::Constraint(_) => FsError::OutOfInodes,
                other => FsError::Database(other),
            })?;
        drop(cache);

        contents::insert(self.pool(), parent, name, inode.id)
            .await
            .map_err(FsError::from)?;
        Ok(inode)
    }

    pub async fn mknod(&self, parent: i64, name: &[u8], mode: i64, rdev: i64, uid: i64, gid: i64) -> Result<Inode, FsError> {
        self.create_entry(parent, name, mode, rdev, uid, gid).await
    }

    pub async fn mkdir(&self, parent: i64, name: &[u8], mode: i64, uid: i64, gid: i64) -> Result<Inode, FsError> {
        self.create_entry(parent, name, mode | libc::S_IFDIR as i64, 0, uid, gid).await
    }

    pub async fn symlink(&self, parent: i64, name: &[u8], target: &[u8], uid: i64, gid: i64) -> Result<Inode, FsError> {
        let inode = self
            .create_entry(parent, name, 0o777 | libc::S_IFLNK as i64, 0, uid, gid)
            .await?;
        self.block_cache
            .write(inode.id, 0, 0, target)
            .await
            .map_err(FsError::from)?;
        let mut cache = self.inode_cache.lock().await;
        let updated = cache
            .update(inode.id, |i| i.size = target.len() as i64)
            .await
            .map_err(FsError::from)?;
        Ok(updated)
    }

    pub async fn readlink(&self, inode: i64) -> Result<Vec<u8>, FsError> {
        let attr = self.getattr(inode).await?;
        let block = self.block_cache.get(inode, 0).await.map_err(FsError::from)?;
        Ok(block.into_iter().take(attr.size as usize).collect())
    }

    pub async fn unlink(&self, parent: i64, name: &[u8]) -> Result<(), FsError> {
        let _guard = self.fs_lock.lock();
        let entry = contents::lookup(self.pool(), parent, name).await.map_err(|_| FsError::NotFound)?;
        let attr = self.getattr(entry.inode).await?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if attr.locked != 0 {
            return Err(FsError::PermissionDenied);
        }

        contents::remove(self.pool(), parent, name).await.map_err(FsError::from)?;

        let mut cache = self.inode_cache.lock().await;
        let updated = cache.update(entry.inode, |i| i.refcount -= 1).await.map_err(FsError::from)?;
        if updated.refcount <= 0 {
            self.release_inode_storage(entry.inode).await?;
            cache.delete(entry.inode).await.map_err(FsError::from)?;
        }
        Ok(())
    }

    pub async fn rmdir(&self, parent: i64, name: &[u8]) -> Result<(), FsError> {
        let _guard = self.fs_lock.lock();
        let entry = contents::lookup(self.pool(), parent, name).await.map_err(|_| FsError::NotFound)?;
        let attr = self.getattr(entry.inode).await?;
        if !attr.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if !contents::is_empty(self.pool(), entry.inode).await.map_err(FsError::from)? {
            return Err(FsError::NotEmpty);
        }
        if attr.locked != 0 {
            return Err(FsError::PermissionDenied);
        }
        contents::remove(self.pool(), parent, name).await.map_err(FsError::from)?;
        let mut cache = self.inode_cache.lock().await;
        cache.delete(entry.inode).await.map_err(FsError::from)?;
        Ok(())
    }

    async fn release_inode_storage(&self, inode: i64) -> Result<(), FsError> {
        let extents = extents::list_for_inode(self.pool(), inode).await.map_err(FsError::from)?;
        for extent in extents {
            let refcount = objects::decref(self.pool(), extent.obj_id).await.map_err(FsError::from)?;
            if refcount <= 0 {
                objects::delete(self.pool(), extent.obj_id).await.map_err(FsError::from)?;
            }
        }
        extents::remove_all_for_inode(self.pool(), inode).await.map_err(FsError::from)?;
        self.block_cache.discard(inode).await.map_err(FsError::from)?;
        Ok(())
    }

    pub async fn rename(
        &self,
        old_parent: i64,
        old_name: &[u8],
        new_parent: i64,
        new_name: &[u8],
    ) -> Result<(), FsError> {
        let _guard = self.fs_lock.lock();
        contents::lookup(self.pool(), old_parent, old_name).await.map_err(|_| FsError::NotFound)?;
        if let Ok(existing) = contents::lookup(self.pool(), new_parent, new_name).await {
            let attr = self.getattr(existing.inode).await?;
            if attr.is_dir() && !contents::is_empty(self.pool(), existing.inode).await.map_err(FsError::from)? {
                return Err(FsError::NotEmpty);
            }
            contents::remove(self.pool(), new_parent, new_name).await.map_err(FsError::from)?;
        }
        contents::relocate(self.pool(), old_parent, old_name, new_parent, new_name)
            .await
            .map_err(FsError::from)
    }

    pub async fn link(&self, inode: i64, new_parent: i64, new_name: &[u8]) -> Result<Inode, FsError> {
        let _guard = self.fs_lock.lock();
        let attr = self.getattr(inode).await?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if contents::lookup(self.pool(), new_parent, new_name).await.is_ok() {
            return Err(FsError::AlreadyExists);
        }
        contents::insert(self.pool(), new_parent, new_name, inode).await.map_err(FsError::from)?;
        let mut cache = self.inode_cache.lock().await;
        cache.update(inode, |i| i.refcount += 1).await.map_err(FsError::from)
    }

    pub async fn read(&self, inode: i64, offset: i64, size: u32) -> Result<Vec<u8>, FsError> {
        let attr = self.getattr(inode).await?;
        let end = (offset + size as i64).min(attr.size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let bs = self.config.blocksize;
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let blockno = pos / bs;
            let in_block = (pos % bs) as usize;
            let want = ((end - pos) as usize).min((bs as usize) - in_block);
            let block = self.block_cache.get(inode, blockno).await.unwrap_or_default();
            let available = block.len().saturating_sub(in_block);
            let take = want.min(available);
            out.extend_from_slice(&block[in_block..in_block + take]);
            if take < want {
                out.resize(out.len() + (want - take), 0);
            }
            pos += want as i64;
        }
        Ok(out)
    }

    pub async fn write(&self, inode: i64, offset: i64, data: &[u8]) -> Result<u32, FsError> {
        let bs = self.config.blocksize;
        let mut pos = offset;
        let mut consumed = 0usize;
        while consumed < data.len() {
            let blockno = pos / bs;
            let in_block = (pos % bs) as usize;
            let take = (data.len() - consumed).min((bs as usize) - in_block);
            self.block_cache
                .write(inode, blockno, in_block, &data[consumed..consumed + take])
                .await
                .map_err(FsError::from)?;
            consumed += take;
            pos += take as i64;
        }

        let new_len = offset + data.len() as i64;
        let mut cache = self.inode_cache.lock().await;
        let now = now_epoch();
        cache
            .update(inode, |i| {
                if new_len > i.size {
                    i.size = new_len;
                }
                i.mtime = now;
                i.ctime = now;
            })
            .await
            .map_err(FsError::from)?;
        Ok(data.len() as u32)
    }

    async fn truncate_extents(&self, inode: i64, new_size: i64) -> Result<(), FsError> {
        let bs = self.config.blocksize;
        let keep_blocks = (new_size + bs - 1) / bs;
        let beyond = extents::list_beyond(self.pool(), inode, keep_blocks).await.map_err(FsError::from)?;
        for extent in beyond {
            let refcount = objects::decref(self.pool(), extent.obj_id).await.map_err(FsError::from)?;
            if refcount <= 0 {
                objects::delete(self.pool(), extent.obj_id).await.map_err(FsError::from)?;
            }
            extents::remove(self.pool(), inode, extent.blockno).await.map_err(FsError::from)?;
            self.block_cache.discard_block(inode, extent.blockno).await.map_err(FsError::from)?;
        }
        if new_size % bs != 0 {
            let last_block = new_size / bs;
            let keep = (new_size % bs) as usize;
            self.block_cache.truncate_block(inode, last_block, keep).await.map_err(FsError::from)?;
        }
        Ok(())
    }

    pub async fn readdir(&self, inode: i64) -> Result<Vec<(Vec<u8>, i64, i64)>, FsError> {
        let entries = contents::list(self.pool(), inode).await.map_err(FsError::from)?;
        let mut cache = self.inode_cache.lock().await;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let child = cache.get(entry.inode).await.map_err(FsError::from)?;
            out.push((entry.name, entry.inode, child.mode));
        }
        Ok(out)
    }

    pub async fn statfs(&self) -> Result<StatFs, FsError> {
        let files = inodes::count(self.pool()).await.map_err(FsError::from)?;
        Ok(StatFs {
            blocks: u64::MAX / 512,
            bfree: u64::MAX / 512,
            files: files.max(0) as u64,
            bsize: self.config.blocksize as u32,
            namelen: 255,
        })
    }

    pub async fn setxattr(&self, inode: i64, name: &[u8], value: &[u8]) -> Result<(), FsError> {
        if inode == CTRL_INODE {
            return self.handle_ctrl_command(name, value).await;
        }
        crate::database::ext_attributes::set(self.pool(), inode, name, value)
            .await
            .map_err(FsError::from)
    }

    pub async fn getxattr(&self, inode: i64, name: &[u8]) -> Result<Vec<u8>, FsError> {
        if inode == CTRL_INODE && name == b"pid?" {
            return Ok(std::process::id().to_string().into_bytes());
        }
        let attr = crate::database::ext_attributes::get(self.pool(), inode, name)
            .await
            .map_err(|_| FsError::NoAttribute)?;
        Ok(attr.value)
    }

    async fn handle_ctrl_command(&self, name: &[u8], _value: &[u8]) -> Result<(), FsError> {
        match name {
            b"flushcache" => {
                let entries = contents::list(self.pool(), ROOT_INODE).await.map_err(FsError::from)?;
                for entry in entries {
                    self.block_cache.flush(entry.inode).await.map_err(FsError::from)?;
                }
                Ok(())
            }
            _ => Err(FsError::NotSupported),
        }
    }

    /// Recursively mark `root` and everything reachable under it as locked,
    /// refusing further `unlink`/`rmdir` until [`Operations::unlock_tree`] or
    /// [`Operations::remove_tree`] clears it (the `s3qllock`/`s3qlrm` tools'
    /// behavior, SPEC_FULL.md §8 scenario 7).
    pub async fn lock_tree(&self, root: i64) -> Result<(), FsError> {
        let _guard = self.fs_lock.lock();
        self.set_locked(root, true).await
    }

    /// Inverse of [`Operations::lock_tree`].
    pub async fn unlock_tree(&self, root: i64) -> Result<(), FsError> {
        let _guard = self.fs_lock.lock();
        self.set_locked(root, false).await
    }

    async fn set_locked(&self, root: i64, locked: bool) -> Result<(), FsError> {
        let mut stack = vec![root];
        while let Some(inode) = stack.pop() {
            let attr = self.getattr(inode).await?;
            {
                let mut cache = self.inode_cache.lock().await;
                cache.update(inode, |i| i.locked = locked as i64).await.map_err(FsError::from)?;
            }
            if attr.is_dir() {
                let entries = contents::list(self.pool(), inode).await.map_err(FsError::from)?;
                stack.extend(entries.into_iter().map(|e| e.inode));
            }
        }
        Ok(())
    }

    /// Force-delete `name` under `parent` and everything beneath it,
    /// ignoring the `locked` flag (the `s3qlrm` tool's escape hatch for a
    /// tree that [`Operations::lock_tree`] protected).
    pub async fn remove_tree(&self, parent: i64, name: &[u8]) -> Result<(), FsError> {
        let _guard = self.fs_lock.lock();
        let root_entry = contents::lookup(self.pool(), parent, name).await.map_err(|_| FsError::NotFound)?;

        // Pre-order walk collecting (parent_inode, name, inode, is_dir);
        // deleting in reverse visits leaves before their parent directories.
        let mut to_visit = vec![(parent, name.to_vec(), root_entry.inode)];
        let mut order = Vec::new();
        while let Some((parent_inode, entry_name, inode)) = to_visit.pop() {
            let attr = self.getattr(inode).await?;
            if attr.is_dir() {
                let children = contents::list(self.pool(), inode).await.map_err(FsError::from)?;
                for child in children {
                    to_visit.push((inode, child.name, child.inode));
                }
            }
            order.push((parent_inode, entry_name, inode, attr.is_dir()));
        }

        for (parent_inode, entry_name, inode, is_dir) in order.into_iter().rev() {
            contents::remove(self.pool(), parent_inode, &entry_name).await.map_err(FsError::from)?;
            if !is_dir {
                self.release_inode_storage(inode).await?;
            }
            let mut cache = self.inode_cache.lock().await;
            cache.delete(inode).await.map_err(FsError::from)?;
        }
        Ok(())
    }

    /// Flush the inode cache and the block cache. Must be called with no
    /// further operations in flight.
    pub async fn destroy(self) -> Result<(), FsError> {
        let cache = self.inode_cache.into_inner();
        cache.destroy().await.map_err(FsError::from)?;
        Arc::try_unwrap(self.block_cache)
            .map_err(|_| ())
            .expect("block cache must have no other owners at shutdown")
            .destroy()
            .await
            .map_err(FsError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    async fn fixture() -> Operations {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MetadataDb::open(&dir.path().join("t.db")).await.unwrap());
        inodes::insert(
            db.pool(),
            &Inode {
                id: ROOT_INODE,
                mode: 0o40755,
                refcount: 2,
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
        inodes::insert(
            db.pool(),
            &Inode {
                id: CTRL_INODE,
                mode: 0o100600,
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

        let backend: Arc<dyn crate::backend::Backend> = Arc::new(MemoryBackend::new());
        let block_cache = Arc::new(
            BlockCache::new(dir.path().join("cache"), 16, 1 << 20, 2, backend, db.clone())
                .await
                .unwrap(),
        );
        Operations::new(db, block_cache, MountConfig { nfs_mode: false, blocksize: 64 })
    }

    #[tokio::test]
    async fn mkdir_then_rmdir() {
        let ops = fixture().await;
        let dir = ops.mkdir(ROOT_INODE, b"sub", 0o755, 0, 0).await.unwrap();
        assert!(dir.is_dir());
        ops.rmdir(ROOT_INODE, b"sub").await.unwrap();
        assert!(ops.lookup(ROOT_INODE, b"sub").await.is_err());
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let ops = fixture().await;
        let file = ops.mknod(ROOT_INODE, b"a.txt", 0o100644, 0, 0, 0).await.unwrap();
        ops.write(file.id, 0, b"hello world").await.unwrap();
        let data = ops.read(file.id, 0, 11).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn write_spanning_multiple_blocks() {
        let ops = fixture().await;
        let file = ops.mknod(ROOT_INODE, b"a.txt", 0o100644, 0, 0, 0).await.unwrap();
        let payload = vec![7u8; 200];
        ops.write(file.id, 0, &payload).await.unwrap();
        let data = ops.read(file.id, 0, 200).await.unwrap();
        assert_eq!(data, payload);
    }

    #[tokio::test]
    async fn link_and_unlink_track_nlink() {
        let ops = fixture().await;
        let a = ops.mknod(ROOT_INODE, b"a", 0o100644, 0, 0, 0).await.unwrap();
        ops.link(a.id, ROOT_INODE, b"b").await.unwrap();
        let attr = ops.getattr(a.id).await.unwrap();
        assert_eq!(attr.st_nlink(), 2);

        ops.unlink(ROOT_INODE, b"b").await.unwrap();
        let attr = ops.getattr(a.id).await.unwrap();
        assert_eq!(attr.st_nlink(), 1);
    }

    #[tokio::test]
    async fn chown_reflected_in_getattr() {
        let ops = fixture().await;
        let dir = ops.mkdir(ROOT_INODE, b"d", 0o755, 0, 0).await.unwrap();
        ops.setattr(dir.id, SetAttrs { uid: Some(1), gid: Some(1), ..Default::default() })
            .await
            .unwrap();
        let attr = ops.getattr(dir.id).await.unwrap();
        assert_eq!(attr.uid, 1);
        assert_eq!(attr.gid, 1);
    }

    #[tokio::test]
    async fn truncate_up_then_down() {
        let ops = fixture().await;
        let file = ops.mknod(ROOT_INODE, b"a", 0o100644, 0, 0, 0).await.unwrap();
        ops.write(file.id, 0, b"hi").await.unwrap();

        ops.setattr(file.id, SetAttrs { size: Some(130), ..Default::default() }).await.unwrap();
        let attr = ops.getattr(file.id).await.unwrap();
        assert_eq!(attr.size, 130);

        ops.setattr(file.id, SetAttrs { size: Some(2), ..Default::default() }).await.unwrap();
        let attr = ops.getattr(file.id).await.unwrap();
        assert_eq!(attr.size, 2);
        let data = ops.read(file.id, 0, 2).await.unwrap();
        assert_eq!(data, b"hi");
    }

    #[tokio::test]
    async fn symlink_round_trips_target() {
        let ops = fixture().await;
        let link = ops.symlink(ROOT_INODE, b"l", b"/etc/passwd", 0, 0).await.unwrap();
        let target = ops.readlink(link.id).await.unwrap();
        assert_eq!(target, b"/etc/passwd");
    }

    #[tokio::test]
    async fn rename_moves_entry_between_directories() {
        let ops = fixture().await;
        let file = ops.mknod(ROOT_INODE, b"a", 0o100644, 0, 0, 0).await.unwrap();
        let dir = ops.mkdir(ROOT_INODE, b"d", 0o755, 0, 0).await.unwrap();
        ops.rename(ROOT_INODE, b"a", dir.id, b"b").await.unwrap();
        assert!(ops.lookup(ROOT_INODE, b"a").await.is_err());
        assert_eq!(ops.lookup(dir.id, b"b").await.unwrap().id, file.id);
    }
}
