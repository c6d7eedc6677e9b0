//! Filesystem-wide params blob: the small bit of state that lives outside
//! the SQLite DB proper (SPEC_FULL.md §3/§4.6 GLOSSARY "Params").

use serde::{Deserialize, Serialize};

use crate::util::time::now_epoch;

/// Current on-disk/on-backend format revision. `mount` refuses a params blob
/// with a newer revision than this binary understands.
pub const CURRENT_REVISION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    pub revision: u32,
    pub seq_no: u64,
    pub blocksize: u64,
    pub label: String,
    pub needs_fsck: bool,
    pub last_fsck: i64,
    pub last_modified: i64,
}

impl Params {
    pub fn fresh(label: String, blocksize: u64) -> Self {
        let now = now_epoch();
        Params {
            revision: CURRENT_REVISION,
            seq_no: 1,
            blocksize,
            label,
            needs_fsck: false,
            last_fsck: now,
            last_modified: now,
        }
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}
