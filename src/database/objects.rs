//! Repository for the `objects` table (content-addressed, refcounted blobs).

use super::models::Object;
use super::{ConnectionPool, DbError, Result};

pub async fn by_hash(pool: &ConnectionPool, hash: &[u8]) -> Result<Option<Object>> {
    Ok(sqlx::query_as::<_, Object>("SELECT * FROM objects WHERE hash = ?")
        .bind(hash)
        .fetch_optional(pool.inner())
        .await?)
}

pub async fn get(pool: &ConnectionPool, id: i64) -> Result<Object> {
    sqlx::query_as::<_, Object>("SELECT * FROM objects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool.inner())
        .await?
        .ok_or(DbError::NotFound)
}

/// Insert a brand-new object with `refcount = 1`, returning its row id.
pub async fn insert(pool: &ConnectionPool, hash: &[u8], size: i64) -> Result<i64> {
    let result = sqlx::query("INSERT INTO objects (hash, refcount, size) VALUES (?, 1, ?)")
        .bind(hash)
        .bind(size)
        .execute(pool.inner())
        .await?;
    Ok(result.last_insert_rowid())
}

/// Bump an existing object's refcount by one (dedup path, SPEC_FULL.md §4.4 step 2).
pub async fn incref(pool: &ConnectionPool, id: i64) -> Result<()> {
    sqlx::query("UPDATE objects SET refcount = refcount + 1 WHERE id = ?")
        .bind(id)
        .execute(pool.inner())
        .await?;
    Ok(())
}

/// Decrement an object's refcount by one, returning the refcount afterwards.
/// A caller observing `0` should schedule the object for backend deletion.
pub async fn decref(pool: &ConnectionPool, id: i64) -> Result<i64> {
    sqlx::query("UPDATE objects SET refcount = refcount - 1 WHERE id = ?")
        .bind(id)
        .execute(pool.inner())
        .await?;
    let obj = get(pool, id).await?;
    Ok(obj.refcount)
}

pub async fn delete(pool: &ConnectionPool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM objects WHERE id = ?")
        .bind(id)
        .execute(pool.inner())
        .await?;
    Ok(())
}

/// Objects with `refcount <= 0`: orphans due for backend deletion (fsck and
/// the lazy orphan-collection path of SPEC_FULL.md §4.4's in-transit note).
pub async fn orphans(pool: &ConnectionPool) -> Result<Vec<Object>> {
    Ok(sqlx::query_as::<_, Object>("SELECT * FROM objects WHERE refcount <= 0")
        .fetch_all(pool.inner())
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MetadataDb;

    #[tokio::test]
    async fn insert_then_dedup_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(&dir.path().join("t.db")).await.unwrap();
        let id = insert(db.pool(), b"deadbeef", 4096).await.unwrap();

        let found = by_hash(db.pool(), b"deadbeef").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.refcount, 1);
    }

    #[tokio::test]
    async fn incref_decref_refcount_tracks_extents() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(&dir.path().join("t.db")).await.unwrap();
        let id = insert(db.pool(), b"hash", 10).await.unwrap();

        incref(db.pool(), id).await.unwrap();
        assert_eq!(get(db.pool(), id).await.unwrap().refcount, 2);

        assert_eq!(decref(db.pool(), id).await.unwrap(), 1);
        assert_eq!(decref(db.pool(), id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_refcount_objects_are_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(&dir.path().join("t.db")).await.unwrap();
        let id = insert(db.pool(), b"hash", 10).await.unwrap();
        decref(db.pool(), id).await.unwrap();

        let found = orphans(db.pool()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }
}
