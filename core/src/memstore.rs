//! In-memory implementation of the storage traits, for tests.
//!
//! Mirrors the semantics the PostgreSQL store gets from its schema: a root
//! row whose parent is itself, `(parent, name)` uniqueness, parent child
//! counts, and block rows keyed by `(inode, block_no)`. Tests for the
//! engine, the resolver and the operation layer all run against this.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{FsError, Result};
use crate::store::{BlockStore, MetaStore};
use crate::types::{DirEntry, FileKind, InodeId, InodeMeta, ROOT_ID};

/// Hash-map backed store with the same observable behaviour as `PgStore`.
pub struct MemStore {
    metas: HashMap<InodeId, InodeMeta>,
    names: HashMap<(InodeId, String), InodeId>,
    blocks: HashMap<(InodeId, u64), Vec<u8>>,
    next_id: InodeId,
}

impl MemStore {
    /// A store containing only the root directory, as the schema installer
    /// would leave it.
    pub fn new() -> MemStore {
        let mut root = InodeMeta::new(FileKind::Directory, 0o755, 0, 0);
        root.parent_id = ROOT_ID;
        let mut metas = HashMap::new();
        metas.insert(ROOT_ID, root);
        MemStore {
            metas,
            names: HashMap::new(),
            blocks: HashMap::new(),
            next_id: ROOT_ID + 1,
        }
    }

    /// Number of materialized block rows for one inode.
    pub fn block_rows(&self, id: InodeId) -> usize {
        self.blocks.keys().filter(|(i, _)| *i == id).count()
    }

    /// Whether an inode row exists.
    pub fn has_inode(&self, id: InodeId) -> bool {
        self.metas.contains_key(&id)
    }

    fn insert(&mut self, parent: InodeId, name: &str, meta: &InodeMeta) -> Result<InodeId> {
        let key = (parent, name.to_string());
        if self.names.contains_key(&key) {
            return Err(FsError::Exists(name.to_string()));
        }
        let id = self.next_id;
        self.next_id += 1;
        let mut meta = meta.clone();
        meta.parent_id = parent;
        self.metas.insert(id, meta);
        self.names.insert(key, id);
        self.bump_children(parent, 1);
        Ok(id)
    }

    fn remove(&mut self, id: InodeId) -> Result<()> {
        let meta = self
            .metas
            .remove(&id)
            .ok_or_else(|| FsError::NotFound(format!("inode {}", id)))?;
        self.names.retain(|_, v| *v != id);
        self.blocks.retain(|(i, _), _| *i != id);
        self.bump_children(meta.parent_id, -1);
        Ok(())
    }

    fn bump_children(&mut self, parent: InodeId, delta: i64) {
        if let Some(meta) = self.metas.get_mut(&parent) {
            meta.size = (meta.size as i64 + delta) as u64;
        }
    }
}

impl MetaStore for MemStore {
    fn read_meta(&mut self, id: InodeId) -> Result<InodeMeta> {
        self.metas
            .get(&id)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("inode {}", id)))
    }

    fn lookup_child(&mut self, parent: InodeId, name: &str) -> Result<Option<(InodeId, InodeMeta)>> {
        match self.names.get(&(parent, name.to_string())) {
            Some(&id) => Ok(Some((id, self.metas[&id].clone()))),
            None => Ok(None),
        }
    }

    fn write_meta(&mut self, id: InodeId, meta: &InodeMeta) -> Result<()> {
        let current = self
            .metas
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(format!("inode {}", id)))?;
        // The parent edge is owned by create/rename, not by write_meta.
        let parent_id = current.parent_id;
        *current = meta.clone();
        current.parent_id = parent_id;
        Ok(())
    }

    fn create_file(&mut self, parent: InodeId, name: &str, meta: &InodeMeta) -> Result<InodeId> {
        self.insert(parent, name, meta)
    }

    fn create_dir(&mut self, parent: InodeId, name: &str, meta: &InodeMeta) -> Result<InodeId> {
        self.insert(parent, name, meta)
    }

    fn delete_file(&mut self, id: InodeId) -> Result<()> {
        self.remove(id)
    }

    fn delete_dir(&mut self, id: InodeId) -> Result<()> {
        if self.names.keys().any(|(p, _)| *p == id) {
            return Err(FsError::NotEmpty(format!("inode {}", id)));
        }
        self.remove(id)
    }

    fn list_dir(&mut self, parent: InodeId) -> Result<Vec<DirEntry>> {
        Ok(self
            .names
            .iter()
            .filter(|((p, _), _)| *p == parent)
            .map(|((_, name), id)| DirEntry {
                name: name.clone(),
                kind: self.metas[id].kind(),
            })
            .collect())
    }

    fn rename(
        &mut self,
        id: InodeId,
        from_parent: InodeId,
        to_parent: InodeId,
        new_name: &str,
    ) -> Result<()> {
        let to_key = (to_parent, new_name.to_string());
        if self.names.contains_key(&to_key) {
            return Err(FsError::Exists(new_name.to_string()));
        }
        self.names.retain(|(p, _), v| !(*p == from_parent && *v == id));
        self.names.insert(to_key, id);
        if let Some(meta) = self.metas.get_mut(&id) {
            meta.parent_id = to_parent;
        }
        if from_parent != to_parent {
            self.bump_children(from_parent, -1);
            self.bump_children(to_parent, 1);
        }
        Ok(())
    }

    fn blocks_used(&mut self) -> Result<u64> {
        Ok(self.blocks.len() as u64)
    }

    fn inodes_used(&mut self) -> Result<u64> {
        Ok(self.metas.len() as u64)
    }

    fn tablespace_locations(&mut self) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

impl BlockStore for MemStore {
    fn read_block(&mut self, id: InodeId, block_no: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.get(&(id, block_no)).cloned())
    }

    fn write_block(&mut self, id: InodeId, block_no: u64, data: &[u8]) -> Result<()> {
        self.blocks.insert((id, block_no), data.to_vec());
        Ok(())
    }

    fn delete_blocks_from(&mut self, id: InodeId, first_block_no: u64) -> Result<()> {
        self.blocks
            .retain(|(i, no), _| !(*i == id && *no >= first_block_no));
        Ok(())
    }
}
