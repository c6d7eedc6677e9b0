//! Repository for the `inodes` table.

use super::models::Inode;
use super::{ConnectionPool, DbError, Result};

pub async fn get(pool: &ConnectionPool, id: i64) -> Result<Inode> {
    sqlx::query_as::<_, Inode>("SELECT * FROM inodes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool.inner())
        .await?
        .ok_or(DbError::NotFound)
}

/// Insert a new inode row with an explicit id (used by both sequential and
/// NFS-mode randomized id allocation in the inode cache).
pub async fn insert(pool: &ConnectionPool, inode: &Inode) -> Result<()> {
    sqlx::query(
        "INSERT INTO inodes (id, mode, refcount, uid, gid, size, locked, rdev, atime, mtime, ctime)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(inode.id)
    .bind(inode.mode)
    .bind(inode.refcount)
    .bind(inode.uid)
    .bind(inode.gid)
    .bind(inode.size)
    .bind(inode.locked)
    .bind(inode.rdev)
    .bind(inode.atime)
    .bind(inode.mtime)
    .bind(inode.ctime)
    .execute(pool.inner())
    .await?;
    Ok(())
}

pub async fn exists(pool: &ConnectionPool, id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM inodes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool.inner())
        .await?;
    Ok(row.is_some())
}

/// Write back a (possibly dirty) inode view, in full. Mirrors the inode
/// cache's write-behind flush (SPEC_FULL.md §4.3).
pub async fn update(pool: &ConnectionPool, inode: &Inode) -> Result<()> {
    sqlx::query(
        "UPDATE inodes SET mode=?, refcount=?, uid=?, gid=?, size=?, locked=?, rdev=?,
         atime=?, mtime=?, ctime=? WHERE id=?",
    )
    .bind(inode.mode)
    .bind(inode.refcount)
    .bind(inode.uid)
    .bind(inode.gid)
    .bind(inode.size)
    .bind(inode.locked)
    .bind(inode.rdev)
    .bind(inode.atime)
    .bind(inode.mtime)
    .bind(inode.ctime)
    .bind(inode.id)
    .execute(pool.inner())
    .await?;
    Ok(())
}

pub async fn delete(pool: &ConnectionPool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM inodes WHERE id = ?")
        .bind(id)
        .execute(pool.inner())
        .await?;
    Ok(())
}

pub async fn count(pool: &ConnectionPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM inodes")
        .fetch_one(pool.inner())
        .await?;
    Ok(n)
}
