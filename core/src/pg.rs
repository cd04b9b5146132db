//! The PostgreSQL storage backend: the one place SQL lives.
//!
//! [`PgStore`] wraps a single open transaction and implements the storage
//! traits against the `inodes` and `blocks` tables (see `schema.sql`).
//! Every handler builds one `PgStore`, does its work through the traits,
//! and then either commits or rolls back; a dropped transaction rolls back
//! on the server, so no error path can leak partial state.
//!
//! [`PgManager`] teaches the connection pool how to open and health-check
//! connections, and [`preflight`] performs the startup checks that gate
//! mounting.

use std::path::PathBuf;

use log::debug;
use postgres::error::SqlState;
use postgres::{Client, NoTls, Row, Transaction};

use crate::error::{FsError, Result};
use crate::pool::ManageConnection;
use crate::store::{BlockStore, MetaStore};
use crate::types::{DirEntry, FileKind, InodeId, InodeMeta};

const META_COLUMNS: &str = "parent_id, mode, uid, gid, size, atime, mtime, ctime";

fn meta_from_row(row: &Row) -> InodeMeta {
    InodeMeta {
        parent_id: row.get("parent_id"),
        mode: row.get::<_, i32>("mode") as u32,
        uid: row.get::<_, i32>("uid") as u32,
        gid: row.get::<_, i32>("gid") as u32,
        size: row.get::<_, i64>("size") as u64,
        atime: row.get("atime"),
        mtime: row.get("mtime"),
        ctime: row.get("ctime"),
    }
}

/// Map a unique-constraint violation on `(parent_id, name)` to `Exists`,
/// leaving every other database error untouched.
fn exists_on_conflict(err: postgres::Error, name: &str) -> FsError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        FsError::Exists(name.to_string())
    } else {
        FsError::Database(err)
    }
}

/// One database transaction, viewed through the storage traits.
pub struct PgStore<'a> {
    tx: Transaction<'a>,
}

impl<'a> PgStore<'a> {
    /// Begin a transaction on the given connection.
    pub fn begin(client: &'a mut Client) -> Result<PgStore<'a>> {
        Ok(PgStore {
            tx: client.transaction()?,
        })
    }

    /// Commit the transaction, making this handler's work durable.
    pub fn commit(self) -> Result<()> {
        Ok(self.tx.commit()?)
    }

    /// Roll the transaction back explicitly. Dropping the store does the
    /// same on the server; the explicit form reports rollback failures.
    pub fn rollback(self) -> Result<()> {
        Ok(self.tx.rollback()?)
    }

    fn bump_child_count(&mut self, parent: InodeId, delta: i64) -> Result<()> {
        self.tx.execute(
            "UPDATE inodes SET size = size + $2 WHERE id = $1",
            &[&parent, &delta],
        )?;
        Ok(())
    }

    fn insert_inode(&mut self, parent: InodeId, name: &str, meta: &InodeMeta) -> Result<InodeId> {
        let row = self
            .tx
            .query_one(
                "INSERT INTO inodes (parent_id, name, mode, uid, gid, size, atime, mtime, ctime) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
                &[
                    &parent,
                    &name,
                    &(meta.mode as i32),
                    &(meta.uid as i32),
                    &(meta.gid as i32),
                    &(meta.size as i64),
                    &meta.atime,
                    &meta.mtime,
                    &meta.ctime,
                ],
            )
            .map_err(|e| exists_on_conflict(e, name))?;
        self.bump_child_count(parent, 1)?;
        Ok(row.get(0))
    }

    fn delete_inode(&mut self, id: InodeId) -> Result<()> {
        self.delete_blocks_from(id, 0)?;
        let row = self
            .tx
            .query_opt("DELETE FROM inodes WHERE id = $1 RETURNING parent_id", &[&id])?
            .ok_or_else(|| FsError::NotFound(format!("inode {}", id)))?;
        let parent: InodeId = row.get(0);
        self.bump_child_count(parent, -1)
    }
}

impl MetaStore for PgStore<'_> {
    fn read_meta(&mut self, id: InodeId) -> Result<InodeMeta> {
        let query = format!("SELECT {} FROM inodes WHERE id = $1", META_COLUMNS);
        let row = self
            .tx
            .query_opt(query.as_str(), &[&id])?
            .ok_or_else(|| FsError::NotFound(format!("inode {}", id)))?;
        Ok(meta_from_row(&row))
    }

    fn lookup_child(&mut self, parent: InodeId, name: &str) -> Result<Option<(InodeId, InodeMeta)>> {
        let query = format!(
            "SELECT id, {} FROM inodes \
             WHERE parent_id = $1 AND name = $2 AND id <> parent_id",
            META_COLUMNS
        );
        let row = self.tx.query_opt(query.as_str(), &[&parent, &name])?;
        Ok(row.map(|row| (row.get("id"), meta_from_row(&row))))
    }

    fn write_meta(&mut self, id: InodeId, meta: &InodeMeta) -> Result<()> {
        let updated = self.tx.execute(
            "UPDATE inodes SET mode = $2, uid = $3, gid = $4, size = $5, \
             atime = $6, mtime = $7, ctime = $8 WHERE id = $1",
            &[
                &id,
                &(meta.mode as i32),
                &(meta.uid as i32),
                &(meta.gid as i32),
                &(meta.size as i64),
                &meta.atime,
                &meta.mtime,
                &meta.ctime,
            ],
        )?;
        if updated == 0 {
            return Err(FsError::NotFound(format!("inode {}", id)));
        }
        Ok(())
    }

    fn create_file(&mut self, parent: InodeId, name: &str, meta: &InodeMeta) -> Result<InodeId> {
        self.insert_inode(parent, name, meta)
    }

    fn create_dir(&mut self, parent: InodeId, name: &str, meta: &InodeMeta) -> Result<InodeId> {
        self.insert_inode(parent, name, meta)
    }

    fn delete_file(&mut self, id: InodeId) -> Result<()> {
        self.delete_inode(id)
    }

    fn delete_dir(&mut self, id: InodeId) -> Result<()> {
        let children: i64 = self
            .tx
            .query_one(
                "SELECT count(*) FROM inodes WHERE parent_id = $1 AND id <> parent_id",
                &[&id],
            )?
            .get(0);
        if children > 0 {
            return Err(FsError::NotEmpty(format!("inode {}", id)));
        }
        self.delete_inode(id)
    }

    fn list_dir(&mut self, parent: InodeId) -> Result<Vec<DirEntry>> {
        let rows = self.tx.query(
            "SELECT name, mode FROM inodes WHERE parent_id = $1 AND id <> parent_id",
            &[&parent],
        )?;
        Ok(rows
            .iter()
            .map(|row| DirEntry {
                name: row.get("name"),
                kind: FileKind::from_mode(row.get::<_, i32>("mode") as u32),
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
        self.tx
            .execute(
                "UPDATE inodes SET parent_id = $2, name = $3 WHERE id = $1",
                &[&id, &to_parent, &new_name],
            )
            .map_err(|e| exists_on_conflict(e, new_name))?;
        if from_parent != to_parent {
            self.bump_child_count(from_parent, -1)?;
            self.bump_child_count(to_parent, 1)?;
        }
        Ok(())
    }

    fn blocks_used(&mut self) -> Result<u64> {
        let count: i64 = self.tx.query_one("SELECT count(*) FROM blocks", &[])?.get(0);
        Ok(count as u64)
    }

    fn inodes_used(&mut self) -> Result<u64> {
        let count: i64 = self.tx.query_one("SELECT count(*) FROM inodes", &[])?.get(0);
        Ok(count as u64)
    }

    fn tablespace_locations(&mut self) -> Result<Vec<PathBuf>> {
        let rows = self
            .tx
            .query("SELECT pg_tablespace_location(oid) FROM pg_tablespace", &[])?;
        let mut locations = Vec::with_capacity(rows.len());
        let mut need_data_dir = false;
        for row in &rows {
            let location: String = row.get(0);
            // pg_default and pg_global report an empty location; they live
            // in the cluster data directory.
            if location.is_empty() {
                need_data_dir = true;
            } else {
                locations.push(PathBuf::from(location));
            }
        }
        if need_data_dir {
            let data_dir: String = self
                .tx
                .query_one("SELECT current_setting('data_directory')", &[])?
                .get(0);
            locations.push(PathBuf::from(data_dir));
        }
        locations.sort();
        locations.dedup();
        debug!("tablespace locations: {:?}", locations);
        Ok(locations)
    }
}

impl BlockStore for PgStore<'_> {
    fn read_block(&mut self, id: InodeId, block_no: u64) -> Result<Option<Vec<u8>>> {
        let row = self.tx.query_opt(
            "SELECT data FROM blocks WHERE inode_id = $1 AND block_no = $2",
            &[&id, &(block_no as i64)],
        )?;
        Ok(row.map(|row| row.get("data")))
    }

    fn write_block(&mut self, id: InodeId, block_no: u64, data: &[u8]) -> Result<()> {
        self.tx.execute(
            "INSERT INTO blocks (inode_id, block_no, data) VALUES ($1, $2, $3) \
             ON CONFLICT (inode_id, block_no) DO UPDATE SET data = EXCLUDED.data",
            &[&id, &(block_no as i64), &data],
        )?;
        Ok(())
    }

    fn delete_blocks_from(&mut self, id: InodeId, first_block_no: u64) -> Result<()> {
        self.tx.execute(
            "DELETE FROM blocks WHERE inode_id = $1 AND block_no >= $2",
            &[&id, &(first_block_no as i64)],
        )?;
        Ok(())
    }
}

/// Opens pooled connections and recognizes dead ones.
pub struct PgManager {
    conninfo: String,
}

impl PgManager {
    /// Manager for the given `libpq`-style connection string.
    pub fn new(conninfo: impl Into<String>) -> PgManager {
        PgManager {
            conninfo: conninfo.into(),
        }
    }
}

impl ManageConnection for PgManager {
    type Conn = Client;

    fn connect(&self) -> Result<Client> {
        Ok(Client::connect(&self.conninfo, NoTls)?)
    }

    fn is_broken(&self, conn: &mut Client) -> bool {
        conn.is_closed()
    }
}

/// Startup checks, run on a temporary connection before mounting.
///
/// Verifies that the server stores timestamps as 64-bit integer
/// microseconds and that the block size recorded by the schema installer
/// matches the one requested on the command line. Returns the confirmed
/// block size.
pub fn preflight(conninfo: &str, block_size: u64) -> Result<u64> {
    let mut client = Client::connect(conninfo, NoTls)?;

    let integer_datetimes: String = client
        .query_one("SELECT current_setting('integer_datetimes')", &[])?
        .get(0);
    if integer_datetimes != "on" {
        return Err(FsError::Preflight(
            "server does not store timestamps as 64-bit integers \
             (integer_datetimes is off); refusing to mount"
                .into(),
        ));
    }

    let recorded: i64 = client
        .query_one("SELECT block_size FROM config", &[])?
        .get(0);
    if recorded as u64 != block_size {
        return Err(FsError::Preflight(format!(
            "block size mismatch: mount requested {} but the database was \
             installed with {}",
            block_size, recorded
        )));
    }
    Ok(recorded as u64)
}
