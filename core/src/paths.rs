//! Path resolution: absolute path to inode id, one child lookup per
//! component, walking down from the root.
//!
//! Nothing is cached. The tree is represented purely by `parent_id` edges
//! in the database, so resolution is the only place path strings exist, and
//! a rename of a directory never invalidates anything.

use std::path::{Component, Path};

use crate::error::{FsError, Result};
use crate::store::MetaStore;
use crate::types::{InodeId, InodeMeta, ROOT_ID};

/// Resolve an absolute path to `(id, metadata)`.
///
/// Errors with `NotFound` when any component is missing and with
/// `NotDirectory` when a component other than the last resolves to a
/// non-directory. The empty path and `/` resolve to the root.
pub fn resolve<S: MetaStore + ?Sized>(store: &mut S, path: &Path) -> Result<(InodeId, InodeMeta)> {
    let mut id = ROOT_ID;
    let mut meta = store.read_meta(ROOT_ID)?;

    for component in path.components() {
        let name = match component {
            Component::RootDir | Component::CurDir => continue,
            Component::Normal(name) => name.to_str().ok_or_else(|| {
                FsError::Invalid(format!("non-UTF-8 component in '{}'", path.display()))
            })?,
            // The kernel hands us normalized absolute paths; anything else
            // is a caller bug.
            _ => {
                return Err(FsError::Invalid(format!(
                    "unsupported component in '{}'",
                    path.display()
                )))
            }
        };

        if !meta.is_dir() {
            return Err(FsError::NotDirectory(path.display().to_string()));
        }
        match store.lookup_child(id, name)? {
            Some((child_id, child_meta)) => {
                id = child_id;
                meta = child_meta;
            }
            None => return Err(FsError::not_found(path)),
        }
    }
    Ok((id, meta))
}

/// Resolve an absolute path that must name a directory.
pub fn resolve_dir<S: MetaStore + ?Sized>(
    store: &mut S,
    path: &Path,
) -> Result<(InodeId, InodeMeta)> {
    let (id, meta) = resolve(store, path)?;
    if !meta.is_dir() {
        return Err(FsError::NotDirectory(path.display().to_string()));
    }
    Ok((id, meta))
}
