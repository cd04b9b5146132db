//! The storage seam: every query the filesystem core issues, as two traits.
//!
//! The engines above this layer (block engine, path resolver, operation
//! semantics) are written against these traits and never see SQL. The
//! production implementation is [`PgStore`](../pg/struct.PgStore.html),
//! which wraps one open database transaction; the tests drive the same code
//! through an in-memory store.
//!
//! Every method takes `&mut self`: the PostgreSQL transaction API is
//! exclusive, and the in-memory store mutates maps. Implementations must
//! guarantee that either all effects of the enclosing transaction become
//! visible (commit) or none do (rollback) — callers rely on that to leave
//! no partial state behind on error paths.

use std::path::PathBuf;

use crate::error::Result;
use crate::types::{DirEntry, InodeId, InodeMeta};

/// Metadata and directory-tree operations (component C1, metadata half).
pub trait MetaStore {
    /// Read one inode record by id. Errors with `NotFound` when the row
    /// does not exist.
    fn read_meta(&mut self, id: InodeId) -> Result<InodeMeta>;

    /// Find a child of `parent` by name. `Ok(None)` when there is no such
    /// entry; the root's self-edge is never returned as a child.
    fn lookup_child(&mut self, parent: InodeId, name: &str) -> Result<Option<(InodeId, InodeMeta)>>;

    /// Overwrite mode, uid, gid, size and all three timestamps of an
    /// existing inode.
    fn write_meta(&mut self, id: InodeId, meta: &InodeMeta) -> Result<()>;

    /// Insert a new regular-file or symlink inode under `parent` and bump
    /// the parent's child count. Errors with `Exists` when `(parent, name)`
    /// is already taken. Returns the new id.
    fn create_file(&mut self, parent: InodeId, name: &str, meta: &InodeMeta) -> Result<InodeId>;

    /// Insert a new directory inode under `parent`; otherwise as
    /// [`create_file`](MetaStore::create_file).
    fn create_dir(&mut self, parent: InodeId, name: &str, meta: &InodeMeta) -> Result<InodeId>;

    /// Delete a file or symlink inode together with all of its blocks, and
    /// decrement the parent's child count.
    fn delete_file(&mut self, id: InodeId) -> Result<()>;

    /// Delete an empty directory inode. Errors with `NotEmpty` when the
    /// directory still has children.
    fn delete_dir(&mut self, id: InodeId) -> Result<()>;

    /// All children of a directory, in unspecified order.
    fn list_dir(&mut self, parent: InodeId) -> Result<Vec<DirEntry>>;

    /// Re-parent and rename an inode in one update, adjusting both parents'
    /// child counts. Errors with `Exists` when the destination name is
    /// already taken.
    fn rename(
        &mut self,
        id: InodeId,
        from_parent: InodeId,
        to_parent: InodeId,
        new_name: &str,
    ) -> Result<()>;

    /// Total number of stored block rows, for `statfs`.
    fn blocks_used(&mut self) -> Result<u64>;

    /// Total number of inode rows, for `statfs`.
    fn inodes_used(&mut self) -> Result<u64>;

    /// On-disk directories backing the database, for free-space estimation.
    fn tablespace_locations(&mut self) -> Result<Vec<PathBuf>>;
}

/// Content block operations (component C1, content half).
///
/// Blocks are opaque fixed-length payloads keyed by `(inode, block_no)`;
/// a missing row represents an all-zero block.
pub trait BlockStore {
    /// Fetch one block, `Ok(None)` when the block was never materialized.
    fn read_block(&mut self, id: InodeId, block_no: u64) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite one block with exactly `block_size` bytes.
    fn write_block(&mut self, id: InodeId, block_no: u64, data: &[u8]) -> Result<()>;

    /// Remove every block of the inode with index `>= first_block_no`.
    fn delete_blocks_from(&mut self, id: InodeId, first_block_no: u64) -> Result<()>;
}

/// Convenience bound for code that needs both halves of the store.
pub trait Store: MetaStore + BlockStore {}

impl<T: MetaStore + BlockStore> Store for T {}
