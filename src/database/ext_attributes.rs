//! Repository for the `ext_attributes` table.

use super::models::ExtAttribute;
use super::{ConnectionPool, DbError, Result};

pub async fn get(pool: &ConnectionPool, inode: i64, name: &[u8]) -> Result<ExtAttribute> {
    sqlx::query_as::<_, ExtAttribute>("SELECT * FROM ext_attributes WHERE inode = ? AND name = ?")
        .bind(inode)
        .bind(name)
        .fetch_optional(pool.inner())
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn set(pool: &ConnectionPool, inode: i64, name: &[u8], value: &[u8]) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO ext_attributes (inode, name, value) VALUES (?, ?, ?)")
        .bind(inode)
        .bind(name)
        .bind(value)
        .execute(pool.inner())
        .await?;
    Ok(())
}

pub async fn remove(pool: &ConnectionPool, inode: i64, name: &[u8]) -> Result<()> {
    let result = sqlx::query("DELETE FROM ext_attributes WHERE inode = ? AND name = ?")
        .bind(inode)
        .bind(name)
        .execute(pool.inner())
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn list(pool: &ConnectionPool, inode: i64) -> Result<Vec<ExtAttribute>> {
    Ok(
        sqlx::query_as::<_, ExtAttribute>("SELECT * FROM ext_attributes WHERE inode = ?")
            .bind(inode)
            .fetch_all(pool.inner())
            .await?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{inodes, models::Inode, MetadataDb};

    async fn setup() -> MetadataDb {
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
        db
    }

    #[tokio::test]
    async fn set_then_get() {
        let db = setup().await;
        set(db.pool(), 1, b"user.s3ql_ctrl", b"flushcache").await.unwrap();
        let attr = get(db.pool(), 1, b"user.s3ql_ctrl").await.unwrap();
        assert_eq!(attr.value, b"flushcache");
    }

    #[tokio::test]
    async fn remove_then_missing() {
        let db = setup().await;
        set(db.pool(), 1, b"user.x", b"1").await.unwrap();
        remove(db.pool(), 1, b"user.x").await.unwrap();
        assert!(get(db.pool(), 1, b"user.x").await.is_err());
    }
}
