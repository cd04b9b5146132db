//! Operation semantics: one function per filesystem operation, written
//! against the storage traits.
//!
//! These functions do everything except transaction control. The FUSE
//! adapter wraps each call in acquire → begin → call → commit/rollback and
//! translates [`FsError`] to a negative errno; the functions here only
//! decide *what* happens inside the transaction. Keeping them generic over
//! the store means the whole POSIX surface is exercised by the in-memory
//! tests below, byte for byte the same code that runs against PostgreSQL.

use std::path::Path;
use std::time::SystemTime;

use log::{debug, error};

use crate::engine;
use crate::error::{FsError, Result};
use crate::paths;
use crate::store::{MetaStore, Store};
use crate::types::{DirEntry, FileKind, FsConfig, InodeId, InodeMeta};

/// Identity of the requesting process, as reported by the bridge.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    /// Requesting user id; owns newly created objects.
    pub uid: u32,
    /// Requesting group id.
    pub gid: u32,
}

fn entry_path(parent: &Path, name: &str) -> String {
    parent.join(name).display().to_string()
}

/// Validate a file handle and recover the inode id it carries.
fn handle_id(fh: u64) -> Result<InodeId> {
    if fh == 0 || fh > i64::MAX as u64 {
        return Err(FsError::BadHandle(fh));
    }
    Ok(fh as InodeId)
}

/// `getattr`: resolve a path and return its id and metadata.
pub fn getattr<S: MetaStore + ?Sized>(store: &mut S, path: &Path) -> Result<(InodeId, InodeMeta)> {
    paths::resolve(store, path)
}

/// `fgetattr`: like [`getattr`] but addressed by an open file handle. The
/// id in the handle is authoritative; metadata is still re-read from the
/// store.
pub fn getattr_handle<S: MetaStore + ?Sized>(
    store: &mut S,
    fh: u64,
) -> Result<(InodeId, InodeMeta)> {
    let id = handle_id(fh)?;
    let meta = store.read_meta(id)?;
    Ok((id, meta))
}

/// `open`: confirm the object is not a directory, reject write access on a
/// read-only mount, touch the metadata and hand back the id for the file
/// handle.
pub fn open<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    path: &Path,
    wants_write: bool,
) -> Result<InodeId> {
    let (id, meta) = paths::resolve(store, path)?;
    if meta.is_dir() {
        return Err(FsError::IsDirectory(path.display().to_string()));
    }
    if cfg.read_only && wants_write {
        return Err(FsError::ReadOnly);
    }
    store.write_meta(id, &meta)?;
    Ok(id)
}

/// `create`: make a new empty regular file owned by the caller.
pub fn create<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    parent: &Path,
    name: &str,
    mode: u32,
    caller: Caller,
) -> Result<(InodeId, InodeMeta)> {
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    let (parent_id, parent_meta) = paths::resolve(store, parent)?;
    if !parent_meta.is_dir() {
        return Err(FsError::NotDirectory(parent.display().to_string()));
    }
    if let Some((_, victim)) = store.lookup_child(parent_id, name)? {
        // An existing directory wins the more specific error.
        return Err(if victim.is_dir() {
            FsError::IsDirectory(entry_path(parent, name))
        } else {
            FsError::Exists(entry_path(parent, name))
        });
    }

    let meta = InodeMeta::new(FileKind::RegularFile, mode, caller.uid, caller.gid);
    let id = store.create_file(parent_id, name, &meta)?;
    debug!("created file '{}' as inode {}", entry_path(parent, name), id);
    Ok((id, store.read_meta(id)?))
}

/// `mkdir`: as [`create`], with the directory type bit forced regardless
/// of the caller's mode. Name collisions surface as `Exists` from the
/// store's unique constraint.
pub fn mkdir<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    parent: &Path,
    name: &str,
    mode: u32,
    caller: Caller,
) -> Result<(InodeId, InodeMeta)> {
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    let (parent_id, parent_meta) = paths::resolve(store, parent)?;
    if !parent_meta.is_dir() {
        return Err(FsError::NotDirectory(parent.display().to_string()));
    }

    let meta = InodeMeta::new(FileKind::Directory, mode, caller.uid, caller.gid);
    let id = store
        .create_dir(parent_id, name, &meta)
        .map_err(|e| match e {
            FsError::Exists(_) => FsError::Exists(entry_path(parent, name)),
            other => other,
        })?;
    debug!("created directory '{}' as inode {}", entry_path(parent, name), id);
    Ok((id, store.read_meta(id)?))
}

/// `unlink`: remove a file or symlink together with its blocks.
/// Directories are refused with `EPERM`.
pub fn unlink<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    parent: &Path,
    name: &str,
) -> Result<()> {
    let (parent_id, _) = paths::resolve_dir(store, parent)?;
    let (id, meta) = store
        .lookup_child(parent_id, name)?
        .ok_or_else(|| FsError::NotFound(entry_path(parent, name)))?;
    if meta.is_dir() {
        return Err(FsError::UnlinkDirectory(entry_path(parent, name)));
    }
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    debug!("unlinking '{}' (inode {})", entry_path(parent, name), id);
    store.delete_file(id)
}

/// `rmdir`: remove an empty directory.
pub fn rmdir<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    parent: &Path,
    name: &str,
) -> Result<()> {
    let (parent_id, _) = paths::resolve_dir(store, parent)?;
    let (id, meta) = store
        .lookup_child(parent_id, name)?
        .ok_or_else(|| FsError::NotFound(entry_path(parent, name)))?;
    if !meta.is_dir() {
        return Err(FsError::NotDirectory(entry_path(parent, name)));
    }
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    store.delete_dir(id).map_err(|e| match e {
        FsError::NotEmpty(_) => FsError::NotEmpty(entry_path(parent, name)),
        other => other,
    })
}

/// `rename`: re-parent and rename in one update.
///
/// A destination that exists as a regular file is only overwritten when it
/// *is* the source (`from == to`, a successful no-op); otherwise `EEXIST`.
/// A destination of any other kind is `EINVAL`, as is moving a directory
/// into its own subtree, which would detach it from the root.
pub fn rename<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    parent: &Path,
    name: &str,
    new_parent: &Path,
    new_name: &str,
) -> Result<()> {
    let (from_parent_id, _) = paths::resolve_dir(store, parent)?;
    let (from_id, from_meta) = store
        .lookup_child(from_parent_id, name)?
        .ok_or_else(|| FsError::NotFound(entry_path(parent, name)))?;

    let (to_parent_id, to_parent_meta) = paths::resolve(store, new_parent)?;
    if !to_parent_meta.is_dir() {
        error!(
            "rename destination parent '{}' resolved to a non-directory",
            new_parent.display()
        );
        return Err(FsError::Corrupt(format!(
            "parent '{}' is not a directory",
            new_parent.display()
        )));
    }

    if let Some((to_id, to_meta)) = store.lookup_child(to_parent_id, new_name)? {
        if to_id == from_id {
            return Ok(());
        }
        return match to_meta.kind() {
            FileKind::RegularFile => Err(FsError::Exists(entry_path(new_parent, new_name))),
            _ => Err(FsError::Invalid(format!(
                "rename onto existing '{}'",
                entry_path(new_parent, new_name)
            ))),
        };
    }

    // A directory must not become its own ancestor. Walk the destination's
    // parent chain; it terminates at the root's self-edge.
    if from_meta.is_dir() {
        let mut cursor = to_parent_id;
        loop {
            if cursor == from_id {
                return Err(FsError::Invalid(format!(
                    "cannot move '{}' into its own subtree",
                    entry_path(parent, name)
                )));
            }
            let meta = store.read_meta(cursor)?;
            if meta.parent_id == cursor {
                break;
            }
            cursor = meta.parent_id;
        }
    }

    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    store.rename(from_id, from_parent_id, to_parent_id, new_name)
}

/// `symlink`: create a link inode with permission bits `0777` and store the
/// target as its content, `size = len(target)`.
pub fn symlink<S: Store + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    parent: &Path,
    name: &str,
    target: &str,
    caller: Caller,
) -> Result<(InodeId, InodeMeta)> {
    let (parent_id, parent_meta) = paths::resolve(store, parent)?;
    if !parent_meta.is_dir() {
        return Err(FsError::NotDirectory(parent.display().to_string()));
    }
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }

    let mut meta = InodeMeta::new(FileKind::Symlink, 0o777, caller.uid, caller.gid);
    meta.size = target.len() as u64;
    let id = store.create_file(parent_id, name, &meta).map_err(|e| match e {
        FsError::Exists(_) => FsError::Exists(entry_path(parent, name)),
        other => other,
    })?;

    let stored = engine::write_range(store, cfg.block_size, id, 0, target.as_bytes())?;
    if stored != target.len() {
        return Err(FsError::ShortWrite {
            expected: target.len(),
            stored,
        });
    }
    Ok((id, store.read_meta(id)?))
}

/// `readlink`: return the target bytes of a symlink.
///
/// Mirrors the C bridge contract: the caller supplies the reply buffer
/// capacity and a target that does not fit (with its terminating NUL) is
/// refused with `ENAMETOOLONG`. Anything that is not a symlink reports
/// `ENOENT`.
pub fn readlink<S: Store + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    path: &Path,
    buf_len: usize,
) -> Result<Vec<u8>> {
    let (id, meta) = paths::resolve(store, path)?;
    if !meta.is_symlink() {
        return Err(FsError::not_found(path));
    }
    if (buf_len as u64) < meta.size + 1 {
        return Err(FsError::TargetTooLong(path.display().to_string()));
    }
    engine::read_range(store, cfg.block_size, id, 0, meta.size as u32, meta.size)
}

/// `read`: clamped sparse read through the block engine, addressed by an
/// open file handle.
pub fn read<S: Store + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    fh: u64,
    offset: u64,
    size: u32,
) -> Result<Vec<u8>> {
    let id = handle_id(fh)?;
    let meta = store.read_meta(id)?;
    engine::read_range(store, cfg.block_size, id, offset, size, meta.size)
}

/// `write`: store a byte range through the block engine and grow the
/// recorded size when the range extends the file. A short write is
/// escalated so the caller rolls the transaction back.
pub fn write<S: Store + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    fh: u64,
    offset: u64,
    data: &[u8],
) -> Result<u32> {
    let id = handle_id(fh)?;
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    let mut meta = store.read_meta(id)?;

    let stored = engine::write_range(store, cfg.block_size, id, offset, data)?;
    if stored != data.len() {
        error!(
            "short write on inode {}: submitted {} bytes, stored {}",
            id,
            data.len(),
            stored
        );
        return Err(FsError::ShortWrite {
            expected: data.len(),
            stored,
        });
    }

    let end = offset + data.len() as u64;
    if !data.is_empty() && end > meta.size {
        meta.size = end;
        store.write_meta(id, &meta)?;
    }
    Ok(stored as u32)
}

/// `truncate`: set a file's length by path.
pub fn truncate<S: Store + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    path: &Path,
    new_size: u64,
) -> Result<()> {
    let (id, meta) = paths::resolve(store, path)?;
    if meta.is_dir() {
        return Err(FsError::IsDirectory(path.display().to_string()));
    }
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    apply_truncate(store, cfg, id, meta, new_size)
}

/// `ftruncate`: set a file's length by open handle.
pub fn truncate_handle<S: Store + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    fh: u64,
    new_size: u64,
) -> Result<()> {
    let id = handle_id(fh)?;
    let meta = store.read_meta(id)?;
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    apply_truncate(store, cfg, id, meta, new_size)
}

fn apply_truncate<S: Store + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    id: InodeId,
    mut meta: InodeMeta,
    new_size: u64,
) -> Result<()> {
    engine::truncate(store, cfg.block_size, id, new_size)?;
    meta.size = new_size;
    store.write_meta(id, &meta)
}

/// `chmod`: replace the mode bits.
pub fn chmod<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    path: &Path,
    mode: u32,
) -> Result<()> {
    let (id, mut meta) = paths::resolve(store, path)?;
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    meta.mode = mode;
    store.write_meta(id, &meta)
}

/// `chown`: change owner and/or group; `None` leaves a field untouched.
pub fn chown<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    path: &Path,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<()> {
    let (id, mut meta) = paths::resolve(store, path)?;
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    if let Some(uid) = uid {
        meta.uid = uid;
    }
    if let Some(gid) = gid {
        meta.gid = gid;
    }
    store.write_meta(id, &meta)
}

/// `utimens`: set access and/or modification time.
pub fn utimens<S: MetaStore + ?Sized>(
    store: &mut S,
    cfg: &FsConfig,
    path: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
) -> Result<()> {
    let (id, mut meta) = paths::resolve(store, path)?;
    if cfg.read_only {
        return Err(FsError::ReadOnly);
    }
    if let Some(atime) = atime {
        meta.atime = atime;
    }
    if let Some(mtime) = mtime {
        meta.mtime = mtime;
    }
    store.write_meta(id, &meta)
}

/// `readdir`: list a directory's children. `.` and `..` are the bridge's
/// business.
pub fn readdir<S: MetaStore + ?Sized>(store: &mut S, path: &Path) -> Result<Vec<DirEntry>> {
    let (id, _) = paths::resolve_dir(store, path)?;
    store.list_dir(id)
}
