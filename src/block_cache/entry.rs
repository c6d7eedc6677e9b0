//! Cache entry bookkeeping for the block cache (SPEC_FULL.md §4.4).

use std::path::PathBuf;

/// Lifecycle state of a cached block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// On disk, matches the last-uploaded backend object.
    Clean,
    /// On disk, not yet (or no longer) reflected in the backend.
    Dirty,
    /// A worker has a frozen snapshot in flight; writers fork a new entry.
    Uploading,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub inode: i64,
    pub blockno: i64,
    pub path: PathBuf,
    pub size: u64,
    pub state: EntryState,
    pub last_access: i64,
}

impl CacheEntry {
    pub fn key(&self) -> (i64, i64) {
        (self.inode, self.blockno)
    }

    pub fn is_evictable(&self) -> bool {
        matches!(self.state, EntryState::Clean)
    }
}
