//! Plain data types shared by every layer: inode metadata records, file
//! kinds, directory entries and the process-wide configuration.
//!
//! All of these are deliberately dumb values. The storage traits in
//! [`store`](../store/index.html) pass them around by reference; nothing in
//! here talks to the database.

use std::time::SystemTime;

/// Stable identifier of an inode row. Matches the `BIGINT` key column, so it
/// is signed; the schema never hands out non-positive ids.
pub type InodeId = i64;

/// Inode id of the root directory. The root is created by the schema
/// installer and is the only inode whose parent is itself.
pub const ROOT_ID: InodeId = 1;

/// Block size used when none is given on the command line, in bytes.
/// Must agree with the value the installer recorded in the database.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Upper bound on simultaneously open database connections in
/// multi-threaded mode.
pub const MAX_DB_CONNECTIONS: usize = 16;

/// Longest accepted name of a single path component, reported through
/// `statfs` as `f_namemax`.
pub const MAX_FILENAME_LENGTH: u32 = 255;

/// The three kinds of filesystem object this store knows about.
///
/// Hard links, devices, sockets and pipes are not representable; `mknod` is
/// absent from the operation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A directory; its `size` counts its direct children.
    Directory,
    /// A regular file backed by zero or more block rows.
    RegularFile,
    /// A symbolic link; the target is stored as content bytes.
    Symlink,
}

impl FileKind {
    /// Classify a raw `st_mode` value. Unknown type bits are treated as a
    /// regular file, mirroring how the mode checks in the handlers only
    /// ever test for directories and symlinks.
    pub fn from_mode(mode: u32) -> FileKind {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            _ => FileKind::RegularFile,
        }
    }

    /// The `S_IFMT` bits for this kind.
    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Directory => libc::S_IFDIR,
            FileKind::RegularFile => libc::S_IFREG,
            FileKind::Symlink => libc::S_IFLNK,
        }
    }
}

/// One inode's metadata, as stored in (and re-read from) the database.
///
/// The id is not part of the record: it is either the lookup key or is
/// returned alongside the record, exactly once, by the operation that found
/// the row.
#[derive(Debug, Clone, PartialEq)]
pub struct InodeMeta {
    /// Id of the containing directory; equal to the inode's own id only for
    /// the root.
    pub parent_id: InodeId,
    /// File type and permission bits.
    pub mode: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Size in bytes for files and symlinks; number of direct children for
    /// directories.
    pub size: u64,
    /// Time of last access.
    pub atime: SystemTime,
    /// Time of last content modification.
    pub mtime: SystemTime,
    /// Time of last metadata change.
    pub ctime: SystemTime,
}

impl InodeMeta {
    /// Fresh metadata for a new object: empty, owned by the caller, with
    /// all three timestamps set to now. The parent id is filled in by the
    /// insert.
    pub fn new(kind: FileKind, perm: u32, uid: u32, gid: u32) -> InodeMeta {
        let now = SystemTime::now();
        InodeMeta {
            parent_id: 0,
            mode: (perm & !libc::S_IFMT) | kind.type_bits(),
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// The kind encoded in the mode bits.
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Whether this inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// Whether this inode is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind() == FileKind::Symlink
    }

    /// Number of blocks the content occupies at the given block size,
    /// counting a trailing partial block as a whole one.
    pub fn block_count(&self, block_size: u64) -> u64 {
        self.size.div_ceil(block_size)
    }
}

/// One name inside a directory, as produced by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The child's name (a single path component).
    pub name: String,
    /// The child's kind.
    pub kind: FileKind,
}

/// Process-wide configuration, fixed at mount time and passed by reference
/// into every handler.
#[derive(Debug, Clone, Copy)]
pub struct FsConfig {
    /// Fixed content block size in bytes; must match the database.
    pub block_size: u64,
    /// Whether the mount rejects every mutating operation.
    pub read_only: bool,
}

impl FsConfig {
    /// Configuration for a read-write mount with the given block size.
    pub fn new(block_size: u64, read_only: bool) -> FsConfig {
        FsConfig {
            block_size,
            read_only,
        }
    }
}
