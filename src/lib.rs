//! # s3ql
//!
//! A FUSE filesystem backed by a content-addressed object store.
//!
//! ## Architecture
//!
//! - `error`: crate-wide `FsError`/`LifecycleError` and the errno mapping the
//!   FUSE adapter needs.
//! - `util`: small cross-cutting helpers (key escaping, epoch time).
//! - `backend`: the object-store trait plus the local-directory and
//!   in-memory drivers, and the encrypting/compressing wrapper.
//! - `crypto`: AES-256-GCM block/metadata encryption and Argon2id
//!   passphrase-wrapped data keys.
//! - `compression`: zlib/bzip2/lzma/none codecs.
//! - `database`: the embedded SQLite metadata store (inodes, directory
//!   entries, extents, objects, extended attributes).
//! - `inode_cache`: the bounded write-behind inode cache.
//! - `block_cache`: the on-disk LRU block cache with dedup and a background
//!   upload pipeline.
//! - `fs`: the POSIX operations translator and its `fuser` binding.
//! - `metadata`: the params blob, seq\_no-arbitrated mount/unmount sequence,
//!   `mkfs` and `fsck`.
//! - `cli`: the `mkfs`/`mount`/`umount`/`fsck` command-line surface.

pub mod error;
pub mod util;

pub mod backend;
pub mod compression;
pub mod crypto;

pub mod database;

pub mod block_cache;
pub mod inode_cache;

pub mod fs;
pub mod metadata;

pub mod cli;

/// Re-export version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
