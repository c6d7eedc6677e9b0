//! Thin `fuser::Filesystem` binding. Parses kernel request arguments,
//! delegates to [`super::operations::Operations`], and maps `FsError` back
//! to `reply.error(errno)` (SPEC_FULL.md §4.5).

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request,
};
use tokio::runtime::Handle;

use crate::database::models::Inode;
use crate::error::FsError;

use super::operations::{Operations, SetAttrs};

const TTL: Duration = Duration::from_secs(3600);

fn file_type(mode: i64) -> FileType {
    match (mode as u32) & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn to_file_attr(inode: &Inode) -> FileAttr {
    FileAttr {
        ino: inode.id as u64,
        size: inode.size.max(0) as u64,
        blocks: inode.st_blocks(),
        atime: crate::util::time::epoch_to_system_time(inode.atime),
        mtime: crate::util::time::epoch_to_system_time(inode.mtime),
        ctime: crate::util::time::epoch_to_system_time(inode.ctime),
        crtime: crate::util::time::epoch_to_system_time(inode.ctime),
        kind: file_type(inode.mode),
        perm: (inode.mode as u32 & 0o7777) as u16,
        nlink: inode.st_nlink(),
        uid: inode.uid as u32,
        gid: inode.gid as u32,
        rdev: inode.rdev as u32,
        blksize: inode.st_blksize(),
        flags: 0,
    }
}

/// Binds an [`Operations`] translator to the `fuser` kernel interface.
/// Each trait method blocks the calling (dedicated FUSE request) thread on
/// the shared `tokio` runtime, matching the teacher's pattern of keeping
/// edge-facing code (there: `wgpu`/`egui`; here: `fuser`) a thin shell
/// around backend-agnostic core logic.
pub struct FuseAdapter {
    ops: Arc<Operations>,
    runtime: Handle,
}

impl FuseAdapter {
    pub fn new(ops: Arc<Operations>, runtime: Handle) -> Self {
        FuseAdapter { ops, runtime }
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}

impl Filesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.as_encoded_bytes().to_vec();
        match self.block_on(self.ops.lookup(parent as i64, &name)) {
            Ok(inode) => reply.entry(&TTL, &to_file_attr(&inode), inode.generation()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.block_on(self.ops.getattr(ino as i64)) {
            Ok(inode) => reply.attr(&TTL, &to_file_attr(&inode)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attrs = SetAttrs {
            mode: mode.map(|m| m as i64),
            uid: uid.map(|u| u as i64),
            gid: gid.map(|g| g as i64),
            size: size.map(|s| s as i64),
            atime: None,
            mtime: None,
        };
        match self.block_on(self.ops.setattr(ino as i64, attrs)) {
            Ok(inode) => reply.attr(&TTL, &to_file_attr(&inode)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.block_on(self.ops.readlink(ino as i64)) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.as_encoded_bytes().to_vec();
        let result = self.block_on(self.ops.mknod(
            parent as i64,
            &name,
            mode as i64,
            rdev as i64,
            req.uid() as i64,
            req.gid() as i64,
        ));
        match result {
            Ok(inode) => reply.entry(&TTL, &to_file_attr(&inode), inode.generation()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.as_encoded_bytes().to_vec();
        let result = self.block_on(self.ops.mknod(
            parent as i64,
            &name,
            mode as i64 | libc::S_IFREG as i64,
            0,
            req.uid() as i64,
            req.gid() as i64,
        ));
        match result {
            Ok(inode) => reply.created(&TTL, &to_file_attr(&inode), inode.generation(), 0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(&mut self, req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let name = name.as_encoded_bytes().to_vec();
        let result = self.block_on(self.ops.mkdir(
            parent as i64,
            &name,
            mode as i64,
            req.uid() as i64,
            req.gid() as i64,
        ));
        match result {
            Ok(inode) => reply.entry(&TTL, &to_file_attr(&inode), inode.generation()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(&mut self, req: &Request, parent: u64, name: &OsStr, link: &std::path::Path, reply: ReplyEntry) {
        let name = name.as_encoded_bytes().to_vec();
        let target = link.as_os_str().as_encoded_bytes().to_vec();
        let result = self.block_on(self.ops.symlink(
            parent as i64,
            &name,
            &target,
            req.uid() as i64,
            req.gid() as i64,
        ));
        match result {
            Ok(inode) => reply.entry(&TTL, &to_file_attr(&inode), inode.generation()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.as_encoded_bytes().to_vec();
        match self.block_on(self.ops.unlink(parent as i64, &name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.as_encoded_bytes().to_vec();
        match self.block_on(self.ops.rmdir(parent as i64, &name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.as_encoded_bytes().to_vec();
        let newname = newname.as_encoded_bytes().to_vec();
        let result = self.block_on(self.ops.rename(parent as i64, &name, newparent as i64, &newname));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let newname = newname.as_encoded_bytes().to_vec();
        match self.block_on(self.ops.link(ino as i64, newparent as i64, &newname)) {
            Ok(inode) => reply.entry(&TTL, &to_file_attr(&inode), inode.generation()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.block_on(self.ops.read(ino as i64, offset, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.block_on(self.ops.write(ino as i64, offset, data)) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = match self.block_on(self.ops.readdir(ino as i64)) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let mut all = vec![
            (ino as i64, FileType::Directory, ".".to_string()),
            (ino as i64, FileType::Directory, "..".to_string()),
        ];
        for (name, child, mode) in entries {
            all.push((child, file_type(mode), String::from_utf8_lossy(&name).into_owned()));
        }
        for (i, (child, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child as u64, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.block_on(self.ops.statfs()) {
            Ok(s) => reply.statfs(s.blocks, s.bfree, s.bfree, s.files, 0, s.bsize, s.namelen, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.as_encoded_bytes().to_vec();
        match self.block_on(self.ops.setxattr(ino as i64, &name, value)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = name.as_encoded_bytes().to_vec();
        match self.block_on(self.ops.getxattr(ino as i64, &name)) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if (value.len() as u32) > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Err(e) => match e {
                FsError::NoAttribute => reply.error(libc::ENODATA),
                other => reply.error(other.to_errno()),
            },
        }
    }
}
