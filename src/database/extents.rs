//! Repository for the `extents` table: `(inode, blockno) -> object`.

use super::models::Extent;
use super::{ConnectionPool, Result};

pub async fn get(pool: &ConnectionPool, inode: i64, blockno: i64) -> Result<Option<Extent>> {
    Ok(sqlx::query_as::<_, Extent>("SELECT * FROM extents WHERE inode = ? AND blockno = ?")
        .bind(inode)
        .bind(blockno)
        .fetch_optional(pool.inner())
        .await?)
}

/// Insert or replace the extent for `(inode, blockno)`, pointing at `obj_id`.
pub async fn set(pool: &ConnectionPool, inode: i64, blockno: i64, obj_id: i64) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO extents (inode, blockno, obj_id) VALUES (?, ?, ?)")
        .bind(inode)
        .bind(blockno)
        .bind(obj_id)
        .execute(pool.inner())
        .await?;
    Ok(())
}

pub async fn remove(pool: &ConnectionPool, inode: i64, blockno: i64) -> Result<()> {
    sqlx::query("DELETE FROM extents WHERE inode = ? AND blockno = ?")
        .bind(inode)
        .bind(blockno)
        .execute(pool.inner())
        .await?;
    Ok(())
}

/// All extents for `inode`, e.g. so `unlink`/`truncate` can decref their objects.
pub async fn list_for_inode(pool: &ConnectionPool, inode: i64) -> Result<Vec<Extent>> {
    Ok(
        sqlx::query_as::<_, Extent>("SELECT * FROM extents WHERE inode = ? ORDER BY blockno")
            .bind(inode)
            .fetch_all(pool.inner())
            .await?,
    )
}

/// Extents past `keep_blocks` blocks (used by truncate-down).
pub async fn list_beyond(pool: &ConnectionPool, inode: i64, keep_blocks: i64) -> Result<Vec<Extent>> {
    Ok(sqlx::query_as::<_, Extent>(
        "SELECT * FROM extents WHERE inode = ? AND blockno >= ? ORDER BY blockno",
    )
    .bind(inode)
    .bind(keep_blocks)
    .fetch_all(pool.inner())
    .await?)
}

pub async fn remove_all_for_inode(pool: &ConnectionPool, inode: i64) -> Result<()> {
    sqlx::query("DELETE FROM extents WHERE inode = ?")
        .bind(inode)
        .execute(pool.inner())
        .await?;
    Ok(())
}

/// Count of extents pointing at `obj_id` — should equal that object's
/// refcount at all times (SPEC_FULL.md §8 property test).
pub async fn count_for_object(pool: &ConnectionPool, obj_id: i64) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM extents WHERE obj_id = ?")
        .bind(obj_id)
        .fetch_one(pool.inner())
        .await?;
    Ok(n)
}

/// Extents with no matching object row (fsck: dangling-extent scan).
pub async fn dangling(pool: &ConnectionPool) -> Result<Vec<Extent>> {
    Ok(sqlx::query_as::<_, Extent>(
        "SELECT e.* FROM extents e LEFT JOIN objects o ON e.obj_id = o.id WHERE o.id IS NULL",
    )
    .fetch_all(pool.inner())
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{inodes, models::Inode, objects, MetadataDb};

    async fn setup() -> (MetadataDb, i64) {
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
        let obj_id = objects::insert(db.pool(), b"hash", 10).await.unwrap();
        (db, obj_id)
    }

    #[tokio::test]
    async fn set_then_get() {
        let (db, obj_id) = setup().await;
        set(db.pool(), 1, 0, obj_id).await.unwrap();
        let extent = get(db.pool(), 1, 0).await.unwrap().unwrap();
        assert_eq!(extent.obj_id, obj_id);
    }

    #[tokio::test]
    async fn refcount_matches_extent_count() {
        let (db, obj_id) = setup().await;
        set(db.pool(), 1, 0, obj_id).await.unwrap();
        set(db.pool(), 1, 1, obj_id).await.unwrap();
        objects::incref(db.pool(), obj_id).await.unwrap();

        let count = count_for_object(db.pool(), obj_id).await.unwrap();
        let obj = objects::get(db.pool(), obj_id).await.unwrap();
        assert_eq!(count, obj.refcount);
    }

    #[tokio::test]
    async fn list_beyond_filters_by_blockno() {
        let (db, obj_id) = setup().await;
        for b in 0..4 {
            set(db.pool(), 1, b, obj_id).await.unwrap();
        }
        let beyond = list_beyond(db.pool(), 1, 2).await.unwrap();
        assert_eq!(beyond.len(), 2);
        assert_eq!(beyond[0].blockno, 2);
    }
}
