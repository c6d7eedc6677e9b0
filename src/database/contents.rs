//! Repository for the `contents` table (directory entries).

use super::models::DirEntry;
use super::{ConnectionPool, DbError, Result};

pub async fn lookup(pool: &ConnectionPool, parent_inode: i64, name: &[u8]) -> Result<DirEntry> {
    sqlx::query_as::<_, DirEntry>("SELECT * FROM contents WHERE parent_inode = ? AND name = ?")
        .bind(parent_inode)
        .bind(name)
        .fetch_optional(pool.inner())
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn insert(pool: &ConnectionPool, parent_inode: i64, name: &[u8], inode: i64) -> Result<()> {
    sqlx::query("INSERT INTO contents (name, inode, parent_inode) VALUES (?, ?, ?)")
        .bind(name)
        .bind(inode)
        .bind(parent_inode)
        .execute(pool.inner())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("2067") => {
                DbError::Constraint("entry already exists".into())
            }
            _ => DbError::Sqlx(e),
        })?;
    Ok(())
}

pub async fn remove(pool: &ConnectionPool, parent_inode: i64, name: &[u8]) -> Result<()> {
    let result = sqlx::query("DELETE FROM contents WHERE parent_inode = ? AND name = ?")
        .bind(parent_inode)
        .bind(name)
        .execute(pool.inner())
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Rename/move a directory entry in place (used by `rename(2)`).
pub async fn relocate(
    pool: &ConnectionPool,
    old_parent: i64,
    old_name: &[u8],
    new_parent: i64,
    new_name: &[u8],
) -> Result<()> {
    sqlx::query("UPDATE contents SET parent_inode = ?, name = ? WHERE parent_inode = ? AND name = ?")
        .bind(new_parent)
        .bind(new_name)
        .bind(old_parent)
        .bind(old_name)
        .execute(pool.inner())
        .await?;
    Ok(())
}

pub async fn list(pool: &ConnectionPool, parent_inode: i64) -> Result<Vec<DirEntry>> {
    Ok(
        sqlx::query_as::<_, DirEntry>("SELECT * FROM contents WHERE parent_inode = ? ORDER BY rowid")
            .bind(parent_inode)
            .fetch_all(pool.inner())
            .await?,
    )
}

pub async fn is_empty(pool: &ConnectionPool, parent_inode: i64) -> Result<bool> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contents WHERE parent_inode = ?")
        .bind(parent_inode)
        .fetch_one(pool.inner())
        .await?;
    Ok(n == 0)
}
