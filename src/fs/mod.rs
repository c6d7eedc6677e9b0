//! # Filesystem operations translator
//!
//! [`operations::Operations`] implements the POSIX surface (SPEC_FULL.md
//! §4.5) against the inode cache, block cache and metadata DB, independent
//! of `fuser`. [`fuse_adapter::FuseAdapter`] is the thin `fuser::Filesystem`
//! binding that translates kernel requests into `Operations` calls and
//! `FsError`s into `reply.error(errno)`.

pub mod fuse_adapter;
pub mod operations;

pub use fuse_adapter::FuseAdapter;
pub use operations::{MountConfig, Operations};
