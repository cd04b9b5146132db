//! The FUSE-facing dispatcher.
//!
//! Every handler follows the same discipline: borrow a connection from the
//! pool, begin a transaction, run the operation's semantics from
//! `pgblockfs_core::ops`, then commit on success or roll back on any
//! failure, and translate the error into a negative errno for the kernel.
//! That all lives in [`PgBlockFs::with_store`]; the handlers themselves
//! are thin adapters between `fuse_mt`'s types and the core's.
//!
//! Durability needs no extra work here: every operation commits before it
//! replies, so `flush`, `release` and the `fsync` family are no-ops.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fuse_mt::{
    CallbackResult, CreatedEntry, DirectoryEntry, FileAttr, FileType, FilesystemMT, RequestInfo,
    ResultCreate, ResultData, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice,
    ResultStatfs, ResultWrite, Statfs,
};
use log::{debug, error, info};

use pgblockfs_core::error::FsError;
use pgblockfs_core::ops::{self, Caller};
use pgblockfs_core::pg::{PgManager, PgStore};
use pgblockfs_core::pool::Pool;
use pgblockfs_core::store::MetaStore;
use pgblockfs_core::types::{FileKind, FsConfig, InodeMeta, MAX_FILENAME_LENGTH};

/// How long the kernel may cache attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// Reported count of free inodes; there is no real cap on inode rows.
const FREE_INODES: u64 = i64::MAX as u64;

/// The mounted filesystem: configuration plus the connection pool.
pub struct PgBlockFs {
    cfg: FsConfig,
    mountpoint: PathBuf,
    pool: Pool<PgManager>,
}

impl PgBlockFs {
    /// Build the filesystem state for one mount.
    pub fn new(conninfo: &str, mountpoint: &Path, cfg: FsConfig, connections: usize) -> PgBlockFs {
        PgBlockFs {
            cfg,
            mountpoint: mountpoint.to_path_buf(),
            pool: Pool::new(PgManager::new(conninfo), connections),
        }
    }

    /// Run one operation inside one transaction on one pooled connection.
    /// Commits on success; rolls back and maps the error to an errno on
    /// failure. Pool and commit failures surface as `EIO`.
    fn with_store<T>(
        &self,
        op: &str,
        work: impl FnOnce(&mut PgStore<'_>) -> Result<T, FsError>,
    ) -> Result<T, libc::c_int> {
        let mut conn = self.pool.acquire().map_err(|e| {
            error!("{}: no database connection: {}", op, e);
            libc::EIO
        })?;
        let mut store = PgStore::begin(&mut conn).map_err(|e| {
            error!("{}: begin failed: {}", op, e);
            libc::EIO
        })?;

        match work(&mut store) {
            Ok(value) => match store.commit() {
                Ok(()) => Ok(value),
                Err(e) => {
                    error!("{}: commit failed: {}", op, e);
                    Err(libc::EIO)
                }
            },
            Err(e) => {
                if e.errno() == libc::EIO {
                    error!("{}: {}", op, e);
                } else {
                    debug!("{}: {}", op, e);
                }
                if let Err(rollback_err) = store.rollback() {
                    error!("{}: rollback failed: {}", op, rollback_err);
                }
                Err(e.errno())
            }
        }
    }

    fn attr(&self, meta: &InodeMeta) -> FileAttr {
        FileAttr {
            size: meta.size,
            blocks: meta.block_count(self.cfg.block_size),
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            crtime: meta.ctime,
            kind: file_type(meta.kind()),
            perm: (meta.mode & 0o7777) as u16,
            nlink: 1,
            uid: meta.uid,
            gid: meta.gid,
            rdev: 0,
            flags: 0,
        }
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
    }
}

fn caller(req: &RequestInfo) -> Caller {
    Caller {
        uid: req.uid,
        gid: req.gid,
    }
}

/// Names arrive as `OsStr`; the store keeps them as UTF-8 text.
fn name_str(name: &OsStr) -> Result<&str, libc::c_int> {
    name.to_str().ok_or(libc::EINVAL)
}

fn wants_write(flags: u32) -> bool {
    (flags as i32 & libc::O_ACCMODE) != libc::O_RDONLY
}

fn tid() -> String {
    format!("{:?}", std::thread::current().id())
}

impl FilesystemMT for PgBlockFs {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        info!(
            "mounting filesystem on '{}' ({}), {} connection(s)",
            self.mountpoint.display(),
            if self.cfg.read_only {
                "read-only"
            } else {
                "read-write"
            },
            self.pool.capacity()
        );
        Ok(())
    }

    fn destroy(&self) {
        info!("unmounting filesystem on '{}'", self.mountpoint.display());
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        info!("getattr '{}', thread {}", path.display(), tid());
        let (id, meta) = self.with_store("getattr", |store| match fh {
            Some(fh) => ops::getattr_handle(store, fh),
            None => ops::getattr(store, path),
        })?;
        debug!("id for '{}' is {}", path.display(), id);
        Ok((TTL, self.attr(&meta)))
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>, mode: u32) -> ResultEmpty {
        info!("chmod '{}' to {:o}, thread {}", path.display(), mode, tid());
        self.with_store("chmod", |store| ops::chmod(store, &self.cfg, path, mode))
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        info!("chown '{}' to {:?}:{:?}, thread {}", path.display(), uid, gid, tid());
        self.with_store("chown", |store| ops::chown(store, &self.cfg, path, uid, gid))
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        info!("truncate '{}' to {}, thread {}", path.display(), size, tid());
        self.with_store("truncate", |store| match fh {
            Some(fh) => ops::truncate_handle(store, &self.cfg, fh, size),
            None => ops::truncate(store, &self.cfg, path, size),
        })
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        info!("utimens '{}', thread {}", path.display(), tid());
        self.with_store("utimens", |store| {
            ops::utimens(store, &self.cfg, path, atime, mtime)
        })
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> ResultData {
        info!("readlink '{}', thread {}", path.display(), tid());
        self.with_store("readlink", |store| {
            ops::readlink(store, &self.cfg, path, libc::PATH_MAX as usize)
        })
    }

    fn mkdir(&self, req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        let name = name_str(name)?;
        info!(
            "mkdir '{}' in '{}' mode {:o}, thread {}",
            name,
            parent.display(),
            mode,
            tid()
        );
        let (_, meta) = self.with_store("mkdir", |store| {
            ops::mkdir(store, &self.cfg, parent, name, mode, caller(&req))
        })?;
        Ok((TTL, self.attr(&meta)))
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let name = name_str(name)?;
        info!("unlink '{}' in '{}', thread {}", name, parent.display(), tid());
        self.with_store("unlink", |store| ops::unlink(store, &self.cfg, parent, name))
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let name = name_str(name)?;
        info!("rmdir '{}' in '{}', thread {}", name, parent.display(), tid());
        self.with_store("rmdir", |store| ops::rmdir(store, &self.cfg, parent, name))
    }

    fn symlink(
        &self,
        req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        let name = name_str(name)?;
        let target = target.to_str().ok_or(libc::EINVAL)?;
        info!(
            "symlink '{}' in '{}' to '{}', thread {}",
            name,
            parent.display(),
            target,
            tid()
        );
        let (_, meta) = self.with_store("symlink", |store| {
            ops::symlink(store, &self.cfg, parent, name, target, caller(&req))
        })?;
        Ok((TTL, self.attr(&meta)))
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        new_parent: &Path,
        new_name: &OsStr,
    ) -> ResultEmpty {
        let name = name_str(name)?;
        let new_name = name_str(new_name)?;
        info!(
            "rename '{}' to '{}', thread {}",
            parent.join(name).display(),
            new_parent.join(new_name).display(),
            tid()
        );
        self.with_store("rename", |store| {
            ops::rename(store, &self.cfg, parent, name, new_parent, new_name)
        })
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        info!("open '{}' flags {:#x}, thread {}", path.display(), flags, tid());
        let id = self.with_store("open", |store| {
            ops::open(store, &self.cfg, path, wants_write(flags))
        })?;
        debug!("id for opened '{}' is {}", path.display(), id);
        Ok((id as u64, flags))
    }

    fn read(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        info!(
            "read '{}' offset {} size {}, thread {}",
            path.display(),
            offset,
            size,
            tid()
        );
        match self.with_store("read", |store| ops::read(store, &self.cfg, fh, offset, size)) {
            Ok(data) => callback(Ok(&data)),
            Err(errno) => callback(Err(errno)),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        info!(
            "write '{}' offset {} size {}, thread {}",
            path.display(),
            offset,
            data.len(),
            tid()
        );
        self.with_store("write", |store| {
            ops::write(store, &self.cfg, fh, offset, &data)
        })
    }

    fn flush(&self, _req: RequestInfo, _path: &Path, _fh: u64, _lock_owner: u64) -> ResultEmpty {
        // Data is durable the moment the write's transaction commits.
        Ok(())
    }

    fn release(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        info!("release '{}', thread {}", path.display(), tid());
        Ok(())
    }

    fn fsync(&self, _req: RequestInfo, path: &Path, fh: u64, datasync: bool) -> ResultEmpty {
        info!(
            "{} '{}', thread {}",
            if datasync { "fdatasync" } else { "fsync" },
            path.display(),
            tid()
        );
        if self.cfg.read_only {
            return Err(libc::EROFS);
        }
        if fh == 0 {
            return Err(libc::EBADF);
        }
        // Nothing to flush beyond the per-operation commits.
        Ok(())
    }

    fn opendir(&self, _req: RequestInfo, _path: &Path, _flags: u32) -> ResultOpen {
        Ok((0, 0))
    }

    fn readdir(&self, _req: RequestInfo, path: &Path, _fh: u64) -> ResultReaddir {
        info!("readdir '{}', thread {}", path.display(), tid());
        let children = self.with_store("readdir", |store| ops::readdir(store, path))?;

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(DirectoryEntry {
            name: ".".into(),
            kind: FileType::Directory,
        });
        entries.push(DirectoryEntry {
            name: "..".into(),
            kind: FileType::Directory,
        });
        entries.extend(children.into_iter().map(|entry| DirectoryEntry {
            name: entry.name.into(),
            kind: file_type(entry.kind),
        }));
        Ok(entries)
    }

    fn releasedir(&self, _req: RequestInfo, _path: &Path, _fh: u64, _flags: u32) -> ResultEmpty {
        Ok(())
    }

    fn fsyncdir(&self, _req: RequestInfo, _path: &Path, _fh: u64, _datasync: bool) -> ResultEmpty {
        Ok(())
    }

    fn statfs(&self, _req: RequestInfo, path: &Path) -> ResultStatfs {
        info!("statfs '{}', thread {}", path.display(), tid());
        let block_size = self.cfg.block_size;
        let (blocks_used, inodes_used, free, avail) = self.with_store("statfs", |store| {
            let locations = store.tablespace_locations()?;
            let blocks_used = store.blocks_used()?;
            let inodes_used = store.inodes_used()?;
            let (free, avail) = crate::freespace::worst_case(&locations, block_size)?;
            Ok((blocks_used, inodes_used, free, avail))
        })?;
        debug!(
            "statfs: {} blocks used, {} free, {} available, {} inodes used",
            blocks_used, free, avail, inodes_used
        );

        Ok(Statfs {
            blocks: blocks_used.saturating_add(avail),
            bfree: avail,
            bavail: avail,
            files: inodes_used.saturating_add(FREE_INODES),
            ffree: FREE_INODES,
            bsize: block_size as u32,
            namelen: MAX_FILENAME_LENGTH,
            frsize: block_size as u32,
        })
    }

    fn access(&self, _req: RequestInfo, path: &Path, _mask: u32) -> ResultEmpty {
        // Access is always granted; permission checking is out of scope.
        debug!("access '{}', thread {}", path.display(), tid());
        Ok(())
    }

    fn create(
        &self,
        req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> ResultCreate {
        let name = name_str(name)?;
        info!(
            "create '{}' in '{}' mode {:o}, thread {}",
            name,
            parent.display(),
            mode,
            tid()
        );
        let (id, meta) = self.with_store("create", |store| {
            ops::create(store, &self.cfg, parent, name, mode, caller(&req))
        })?;
        debug!("id for created '{}' is {}", parent.join(name).display(), id);
        Ok(CreatedEntry {
            ttl: TTL,
            attr: self.attr(&meta),
            fh: id as u64,
            flags,
        })
    }
}
