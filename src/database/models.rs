//! Row types for the metadata schema (SPEC_FULL.md §3).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `128 KiB`, the constant `st_blksize` derived accessors report (SPEC_FULL.md §4.3).
pub const ST_BLKSIZE: i64 = 128 * 1024;
/// Constant attr/entry cache timeout, seconds (SPEC_FULL.md §4.3).
pub const ATTR_TIMEOUT_SECS: u64 = 3600;
/// Constant `generation` derived accessors report (SPEC_FULL.md §4.3).
pub const GENERATION: u64 = 1;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Inode {
    pub id: i64,
    pub mode: i64,
    pub refcount: i64,
    pub uid: i64,
    pub gid: i64,
    pub size: i64,
    pub locked: i64,
    pub rdev: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Inode {
    /// `st_nlink`, derived from `refcount` (SPEC_FULL.md §4.3: no `__getattr__` fallback).
    pub fn st_nlink(&self) -> u32 {
        self.refcount.max(0) as u32
    }

    /// `st_blocks`, 512-byte units.
    pub fn st_blocks(&self) -> u64 {
        (self.size.max(0) as u64) / 512
    }

    pub fn st_blksize(&self) -> u32 {
        ST_BLKSIZE as u32
    }

    pub fn attr_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(ATTR_TIMEOUT_SECS)
    }

    pub fn entry_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(ATTR_TIMEOUT_SECS)
    }

    pub fn generation(&self) -> u64 {
        GENERATION
    }

    pub fn is_dir(&self) -> bool {
        (self.mode as u32) & libc::S_IFMT == libc::S_IFDIR
    }
}

/// A directory entry, `(parent_inode, name) -> inode` (the `contents` table).
#[derive(Debug, Clone, FromRow)]
pub struct DirEntry {
    pub rowid: i64,
    pub name: Vec<u8>,
    pub inode: i64,
    pub parent_inode: i64,
}

/// A content-addressed, refcounted backend object (the `objects` table).
#[derive(Debug, Clone, FromRow)]
pub struct Object {
    pub id: i64,
    pub hash: Vec<u8>,
    pub refcount: i64,
    pub size: i64,
}

/// `(inode, blockno) -> object`, the `extents` table.
#[derive(Debug, Clone, FromRow)]
pub struct Extent {
    pub inode: i64,
    pub blockno: i64,
    pub obj_id: i64,
}

/// An extended attribute, `(inode, name) -> value`.
#[derive(Debug, Clone, FromRow)]
pub struct ExtAttribute {
    pub inode: i64,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}
