//! # Metadata database
//!
//! The local relational store: `inodes`, `contents` (directory entries),
//! `extents` (block → object mapping), `objects` (content-addressed,
//! refcounted blobs) and `ext_attributes`. Schema and invariants are
//! SPEC_FULL.md §3; connection management is §4.2, grounded in the
//! teacher's `connection_pool.rs` (kept nearly as-is: WAL mode, health
//! checks, a single-writer semaphore).

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

pub mod connection_pool;
pub mod contents;
pub mod ext_attributes;
pub mod extents;
pub mod inodes;
pub mod models;
pub mod objects;

pub use connection_pool::{ConnectionPool, DatabaseConfig};
pub use models::{ExtAttribute, Extent, Inode, Object};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("connection pool error: {0}")]
    ConnectionPool(String),

    #[error("query execution error: {0}")]
    QueryExecution(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("no such row")]
    NotFound,

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

const SCHEMA: &str = include_str!("schema.sql");

/// The metadata database: a connection pool plus a single-writer permit,
/// matching SPEC_FULL.md §4.2's "max 1 writer connection enforced by a
/// `tokio::sync::Semaphore`, extra read-only connections allowed".
pub struct MetadataDb {
    pool: ConnectionPool,
    writer: Arc<Semaphore>,
}

/// RAII guard proving exclusive write access; held for the duration of a
/// mutating transaction.
pub struct WriterGuard<'a> {
    db: &'a MetadataDb,
    _permit: tokio::sync::SemaphorePermit<'a>,
}

impl<'a> WriterGuard<'a> {
    pub fn pool(&self) -> &ConnectionPool {
        self.db.pool()
    }
}

impl MetadataDb {
    /// Open (creating if missing) the SQLite database at `path` and apply
    /// the schema. Idempotent: `CREATE TABLE IF NOT EXISTS` throughout.
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        let config = DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            ..Default::default()
        };
        let pool = ConnectionPool::new(config)
            .await
            .map_err(|e| DbError::ConnectionPool(e.to_string()))?;

        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            sqlx::query(stmt)
                .execute(pool.inner())
                .await
                .map_err(|e| DbError::Migration(e.to_string()))?;
        }

        Ok(MetadataDb {
            pool,
            writer: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Acquire exclusive write access. Callers must hold this for the
    /// duration of any statement that mutates `inodes`/`contents`/
    /// `extents`/`objects`/`ext_attributes`.
    pub async fn writer(&self) -> WriterGuard<'_> {
        let permit = self.writer.acquire().await.expect("semaphore never closed");
        WriterGuard { db: self, _permit: permit }
    }

    /// `PRAGMA integrity_check(20)`, used by fsck (SPEC_FULL.md §4.6).
    pub async fn integrity_check(&self) -> Result<Vec<String>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            integrity_check: String,
        }
        let rows: Vec<Row> = sqlx::query_as("PRAGMA integrity_check(20)")
            .fetch_all(self.pool.inner())
            .await?;
        Ok(rows.into_iter().map(|r| r.integrity_check).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_applies_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(&dir.path().join("test.db")).await.unwrap();
        let report = db.integrity_check().await.unwrap();
        assert_eq!(report, vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        MetadataDb::open(&path).await.unwrap();
        let db2 = MetadataDb::open(&path).await.unwrap();
        assert!(db2.integrity_check().await.is_ok());
    }
}
