//! Glue between the kernel FUSE dispatch and the path-level handler.
//!
//! fuser speaks inodes; the handler speaks virtual paths. The bridge keeps
//! a two-way inode ↔ path table (root pinned at 1, the rest assigned on
//! first sight) and forwards every callback, turning handler errors into
//! errnos and backing metadata into `FileAttr`s.

use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::prelude::*;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bimap::BiMap;
use fuser::FileType::{Directory, RegularFile};
use fuser::{
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::ENOENT;
use log::warn;

use crate::fs::handler::{EntryKind, TagDirFs};

const TTL: Duration = Duration::new(0, 0);
const ROOT_INO: u64 = 1;

macro_rules! err {
    ($reply:expr, $err:expr) => {{
        $reply.error($err);
        return;
    }};
}

pub struct FuseBridge {
    fs: TagDirFs,
    paths: BiMap<u64, String>,
    next_ino: u64,
}

impl FuseBridge {
    pub fn new(fs: TagDirFs) -> FuseBridge {
        let mut paths = BiMap::new();
        paths.insert(ROOT_INO, "/".to_string());
        FuseBridge {
            fs,
            paths,
            next_ino: ROOT_INO,
        }
    }

    fn intern(&mut self, vpath: &str) -> u64 {
        if let Some(ino) = self.paths.get_by_right(vpath) {
            return *ino;
        }
        self.next_ino += 1;
        self.paths.insert(self.next_ino, vpath.to_string());
        self.next_ino
    }

    fn vpath(&self, ino: u64) -> Option<String> {
        self.paths.get_by_left(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.vpath(parent)?;
        // Display names and tags are plain text; anything else never
        // entered the index in the first place.
        let name = name.to_str()?;
        Some(crate::fs::resolve::join(&parent, name))
    }

    fn attr(&mut self, vpath: &str, md: &Metadata) -> FileAttr {
        file_attr(self.intern(vpath), md)
    }
}

impl Filesystem for FuseBridge {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(vpath) = self.child_path(parent, name) else {
            err!(reply, ENOENT);
        };
        match self.fs.getattr(&vpath) {
            Ok(md) => reply.entry(&TTL, &self.attr(&vpath, &md), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(vpath) = self.vpath(ino) else {
            err!(reply, ENOENT);
        };
        match self.fs.getattr(&vpath) {
            Ok(md) => reply.attr(&TTL, &file_attr(ino, &md)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(vpath) = self.vpath(ino) else {
            err!(reply, ENOENT);
        };

        if let Some(mode) = mode {
            if let Err(e) = self.fs.chmod(&vpath, mode) {
                err!(reply, e.errno());
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = self.fs.chown(&vpath, uid, gid) {
                err!(reply, e.errno());
            }
        }
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate(&vpath, fh, size) {
                err!(reply, e.errno());
            }
        }
        if atime.is_some() || mtime.is_some() {
            let result = self
                .fs
                .utimens(&vpath, atime.map(resolve_time), mtime.map(resolve_time));
            if let Err(e) = result {
                err!(reply, e.errno());
            }
        }

        match self.fs.getattr(&vpath) {
            Ok(md) => reply.attr(&TTL, &file_attr(ino, &md)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(vpath) = self.child_path(parent, name) else {
            err!(reply, ENOENT);
        };
        if let Err(e) = self.fs.mkdir(&vpath, mode & !umask) {
            err!(reply, e.errno());
        }
        match self.fs.getattr(&vpath) {
            Ok(md) => reply.entry(&TTL, &self.attr(&vpath, &md), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(vpath) = self.child_path(parent, name) else {
            err!(reply, ENOENT);
        };
        match self.fs.unlink(&vpath) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(vpath) = self.child_path(parent, name) else {
            err!(reply, ENOENT);
        };
        match self.fs.rmdir(&vpath) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(vpath) = self.vpath(ino) else {
            err!(reply, ENOENT);
        };
        match self.fs.open(&vpath, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(vpath) = self.child_path(parent, name) else {
            err!(reply, ENOENT);
        };
        let fh = match self.fs.create(&vpath, mode & !umask, flags) {
            Ok(fh) => fh,
            Err(e) => err!(reply, e.errno()),
        };
        match self.fs.getattr(&vpath) {
            Ok(md) => {
                let attr = self.attr(&vpath, &md);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => {
                warn!("created `{vpath}` but cannot stat it back: {e}");
                self.fs.release(fh);
                reply.error(e.errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(fh, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(vpath) = self.vpath(ino) else {
            err!(reply, ENOENT);
        };
        let entries = match self.fs.readdir(&vpath) {
            Ok(entries) => entries,
            Err(e) => err!(reply, e.errno()),
        };

        let mut listing: Vec<(u64, fuser::FileType, String)> = Vec::with_capacity(entries.len() + 2);
        listing.push((ino, Directory, ".".to_string()));
        listing.push((ino, Directory, "..".to_string()));
        for entry in entries {
            let child = crate::fs::resolve::join(&vpath, &entry.name);
            let kind = match entry.kind {
                EntryKind::TagDir => Directory,
                EntryKind::File => RegularFile,
            };
            listing.push((self.intern(&child), kind, entry.name));
        }

        for (i, (ino, kind, name)) in listing.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            // i + 1 is the offset of the next entry.
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(vpath) = self.vpath(ino) else {
            err!(reply, ENOENT);
        };
        match self.fs.access(&vpath, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn file_attr(ino: u64, md: &Metadata) -> FileAttr {
    let kind = if md.is_dir() { Directory } else { RegularFile };
    let ctime = md.created().unwrap_or(UNIX_EPOCH);
    FileAttr {
        ino,
        size: md.size(),
        blocks: md.blocks(),
        atime: md.accessed().unwrap_or(UNIX_EPOCH),
        mtime: md.modified().unwrap_or(UNIX_EPOCH),
        ctime,
        crtime: ctime,
        kind,
        perm: md.permissions().mode() as u16,
        nlink: md.nlink() as u32,
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev() as u32,
        flags: 0,
        blksize: md.blksize() as u32,
    }
}
