//! Translates filesystem callbacks into index operations and backing I/O.
//!
//! Everything here is path-based; the kernel bridge owns the inode
//! bookkeeping and hands virtual paths down. All tag semantics live in the
//! index; this layer decides when to mutate it, when to touch the backing
//! filesystem, and in which order: index first, backing second. A failed
//! backing mutation leaves an orphan for offline cleanup, never a rollback.

use std::cmp::min;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{chown, DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::config::{Config, CoverMode};
use crate::error::{FsError, FsResult};
use crate::fs::resolve::{self, ReaddirCache};
use crate::index::{FileRecord, ListingMode, Tag, TagIndex};
use crate::seq::{self, Sequence};
use crate::store::Store;
use crate::{DEFAULT_DIR_MODE, MISSING_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    TagDir,
    File,
}

#[derive(Debug)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// The tag-directory filesystem behind one backing root.
pub struct TagDirFs {
    root: PathBuf,
    config: Config,
    index: TagIndex,
    index_store: Store<TagIndex>,
    seq: Sequence,
    cache: ReaddirCache,
    open_files: HashMap<u64, File>,
    next_fh: u64,
}

impl TagDirFs {
    /// Open a previously set-up backing root.
    pub fn new(config: Config) -> FsResult<TagDirFs> {
        let root = config.root.clone();
        let index_store = TagIndex::open_store(&root);
        let index = TagIndex::load(&index_store)?;
        debug!(
            "loaded index from {}: {} tags",
            root.display(),
            index.all_tags().len()
        );
        Ok(TagDirFs {
            seq: Sequence::open(&root),
            root,
            config,
            index,
            index_store,
            cache: ReaddirCache::default(),
            open_files: HashMap::new(),
            next_fh: 0,
        })
    }

    /// Initialize the persisted state under `root`; with `force`, wipe
    /// whatever the root currently holds first.
    pub fn setup(root: &Path, force: bool) -> FsResult<()> {
        if force {
            for entry in fs::read_dir(root)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        TagIndex::init(&mut TagIndex::open_store(root), force)?;
        Sequence::open(root).init(force)
    }

    pub fn is_setup(root: &Path) -> bool {
        TagIndex::load(&TagIndex::open_store(root)).is_ok() && Sequence::open(root).is_setup()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> &TagIndex {
        &self.index
    }

    fn resolve(&self, vpath: &str) -> PathBuf {
        resolve::backing_path(&self.root, &self.index, &self.cache, vpath)
    }

    fn persist(&mut self) -> FsResult<()> {
        self.index_store.store(&self.index)
    }

    pub fn getattr(&self, vpath: &str) -> FsResult<fs::Metadata> {
        Ok(fs::symlink_metadata(self.resolve(vpath))?)
    }

    /// List a tag directory: the files selected by the path's tag set,
    /// then the child tags worth descending into. Repopulates the cache.
    pub fn readdir(&mut self, vpath: &str) -> FsResult<Vec<DirEntry>> {
        let tags: Vec<Tag> = resolve::components(vpath)
            .into_iter()
            .filter_map(|c| Tag::new(c).ok())
            .collect();
        let (child_tags, files) = self.listing(&tags);

        self.cache.clear();
        for file in &files {
            self.cache
                .insert(resolve::join(vpath, &file.name), self.root.join(&file.location));
        }
        for tag in &child_tags {
            self.cache
                .insert(resolve::join(vpath, tag.name()), resolve::tag_dir(&self.root, tag.name()));
        }

        let mut entries: Vec<DirEntry> = files
            .into_iter()
            .map(|f| DirEntry {
                name: f.name,
                kind: EntryKind::File,
            })
            .collect();
        entries.extend(child_tags.into_iter().map(|t| DirEntry {
            name: t.name().to_string(),
            kind: EntryKind::TagDir,
        }));
        Ok(entries)
    }

    // Restrictive first; swap in the covering listing when the result is
    // degenerate (fewer than two files) or when child tags exist and the
    // total spills past max_dir_entries. The cover-mode override forces
    // either branch.
    fn listing(&self, tags: &[Tag]) -> (Vec<Tag>, Vec<FileRecord>) {
        if self.config.cover_mode == CoverMode::Always {
            return self.index.query(tags, ListingMode::Cover);
        }
        let (dirs, files) = self.index.query(tags, ListingMode::Restrictive);
        let too_many = !dirs.is_empty()
            && dirs.len() + files.len() > self.config.max_dir_entries as usize
            && self.config.cover_mode != CoverMode::Never;
        if files.len() < 2 || too_many {
            self.index.query(tags, ListingMode::Cover)
        } else {
            (dirs, files)
        }
    }

    /// Every non-empty component of the path becomes a tag with a physical
    /// `t_` directory. Already-registered tags are no-ops.
    pub fn mkdir(&mut self, vpath: &str, mode: u32) -> FsResult<()> {
        let tags: Vec<Tag> = resolve::components(vpath)
            .into_iter()
            .map(Tag::new)
            .collect::<FsResult<_>>()?;
        self.register_tags(&tags, mode)?;
        self.persist()
    }

    fn register_tags(&mut self, tags: &[Tag], mode: u32) -> FsResult<()> {
        for tag in tags {
            if self.index.contains_tag(tag.name()) {
                continue;
            }
            self.index.attach(&[], std::slice::from_ref(tag))?;
            let dir = resolve::tag_dir(&self.root, tag.name());
            if !dir.is_dir() {
                fs::DirBuilder::new().mode(mode).create(&dir)?;
            }
        }
        Ok(())
    }

    /// Remove the final component's tag, however many files carry it.
    /// Files left without tags stay reachable through the root listing.
    pub fn rmdir(&mut self, vpath: &str) -> FsResult<()> {
        let name = resolve::basename(vpath);
        if !self.index.contains_tag(name) {
            return Err(FsError::NotFound(vpath.to_string()));
        }
        let tag = Tag::new(name)?;
        self.index
            .detach_tags_from_files(std::slice::from_ref(&tag), None);
        self.persist()?;

        let dir = resolve::tag_dir(&self.root, tag.name());
        if dir.is_dir() {
            fs::remove_dir(dir)?;
        }
        Ok(())
    }

    /// Detach the file from the parent path's tags only. Losing the last
    /// tag removes the record and deletes the backing file.
    pub fn unlink(&mut self, vpath: &str) -> FsResult<()> {
        let tags = resolve::parent_tags(vpath);
        let name = resolve::basename(vpath);
        let Some(file) = self
            .index
            .files_of_tags(&tags)
            .into_iter()
            .find(|f| f.name == name)
        else {
            return Err(FsError::NotFound(vpath.to_string()));
        };

        self.index
            .detach_tags_from_files(&tags, Some(std::slice::from_ref(&file)));
        let orphaned = self
            .index
            .tags_of_files(std::slice::from_ref(&file))
            .is_empty();
        if orphaned {
            self.index.detach_files(std::slice::from_ref(&file));
        }
        self.persist()?;
        self.cache.remove(vpath);

        if orphaned {
            debug!("last tag gone, deleting backing file for `{}`", file.name);
            fs::remove_file(self.root.join(&file.location))?;
        }
        Ok(())
    }

    /// Open an existing virtual file.
    pub fn open(&mut self, vpath: &str, flags: i32) -> FsResult<u64> {
        let backing = self.resolve(vpath);
        if is_sentinel(&backing) {
            return Err(FsError::NotFound(vpath.to_string()));
        }
        let file = open_options(flags).open(&backing)?;
        Ok(self.track(file))
    }

    /// Open-for-create. A resolution miss is the allocation signal: mint
    /// the next opaque backing name, create the file there, and index the
    /// record under the parent path's tags.
    pub fn create(&mut self, vpath: &str, mode: u32, flags: i32) -> FsResult<u64> {
        let backing = self.resolve(vpath);
        if !is_sentinel(&backing) {
            // An existing virtual file; create-on-existing opens in place.
            let file = open_options(flags).create(true).mode(mode).open(&backing)?;
            return Ok(self.track(file));
        }

        let location = PathBuf::from(seq::backing_name(self.seq.next()?));
        let backing = self.root.join(&location);
        debug!("allocating `{}` for `{vpath}`", location.display());
        // The record's backing file must exist before the record does.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&backing)?;

        let record = FileRecord::new(location, resolve::basename(vpath));
        let tags = resolve::parent_tags(vpath);
        self.index.attach(std::slice::from_ref(&record), &tags)?;
        self.persist()?;
        Ok(self.track(file))
    }

    fn track(&mut self, file: File) -> u64 {
        self.next_fh += 1;
        self.open_files.insert(self.next_fh, file);
        self.next_fh
    }

    fn file(&self, fh: u64) -> FsResult<&File> {
        self.open_files
            .get(&fh)
            .ok_or_else(|| FsError::Io(io::Error::from_raw_os_error(libc::EBADF)))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let file = self.file(fh)?;
        let len = file.metadata()?.len();
        let size = min(size as u64, len.saturating_sub(offset));

        let mut buf = vec![0; size as usize];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.file(fh)?.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    pub fn truncate(&mut self, vpath: &str, fh: Option<u64>, size: u64) -> FsResult<()> {
        match fh {
            Some(fh) => self.file(fh)?.set_len(size)?,
            None => {
                let backing = self.resolve(vpath);
                OpenOptions::new().write(true).open(backing)?.set_len(size)?;
            }
        }
        Ok(())
    }

    pub fn flush(&self, fh: u64) -> FsResult<()> {
        self.file(fh)?;
        Ok(())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()> {
        let file = self.file(fh)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn release(&mut self, fh: u64) {
        self.open_files.remove(&fh);
    }

    pub fn chmod(&self, vpath: &str, mode: u32) -> FsResult<()> {
        Ok(fs::set_permissions(
            self.resolve(vpath),
            fs::Permissions::from_mode(mode),
        )?)
    }

    pub fn chown(&self, vpath: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        Ok(chown(self.resolve(vpath), uid, gid)?)
    }

    pub fn utimens(
        &self,
        vpath: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<()> {
        let backing = cpath(&self.resolve(vpath))?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, backing.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn access(&self, vpath: &str, mask: i32) -> FsResult<()> {
        let backing = cpath(&self.resolve(vpath))?;
        let rc = unsafe { libc::access(backing.as_ptr(), mask) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(if err.kind() == io::ErrorKind::PermissionDenied {
                FsError::Permission(vpath.to_string())
            } else {
                err.into()
            });
        }
        Ok(())
    }

    pub fn statfs(&self) -> FsResult<libc::statvfs> {
        let root = cpath(&self.root)?;
        let mut st: libc::statvfs = unsafe { mem::zeroed() };
        let rc = unsafe { libc::statvfs(root.as_ptr(), &mut st) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(st)
    }

    /// Index an existing backing file under `tags`, registering unknown
    /// tags along the way. The location must be a regular file right now;
    /// anything else never enters the index.
    pub fn import(&mut self, record: FileRecord, tags: &[Tag]) -> FsResult<()> {
        let backing = self.root.join(&record.location);
        if !backing.is_file() {
            return Err(FsError::Invalid(format!(
                "{} is not a regular file",
                backing.display()
            )));
        }
        self.register_tags(tags, DEFAULT_DIR_MODE)?;
        self.index.attach(std::slice::from_ref(&record), tags)
    }

    /// Write the in-memory index out. Bulk importers call this once at the
    /// end instead of after every record.
    pub fn persist_index(&mut self) -> FsResult<()> {
        self.persist()
    }
}

impl Drop for TagDirFs {
    fn drop(&mut self) {
        if let Err(e) = self.persist() {
            warn!("final index persist failed: {e}");
        }
    }
}

fn is_sentinel(backing: &Path) -> bool {
    backing.file_name().map(|n| n == MISSING_FILE).unwrap_or(false)
}

fn open_options(flags: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    opts
}

fn cpath(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::Invalid(format!("{} contains NUL", path.display())))
}

fn to_timespec(time: Option<SystemTime>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(time) => {
            let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: since_epoch.as_secs() as libc::time_t,
                tv_nsec: since_epoch.subsec_nanos() as _,
            }
        }
    }
}
