//! Storage engine for a filesystem that lives entirely inside PostgreSQL.
//!
//! Every durable thing — the directory tree, inode metadata, symlink
//! targets and file contents — is rows in two tables. This crate owns the
//! machinery between the FUSE bridge and those rows:
//!
//! - [`types`]: the metadata records and process-wide configuration.
//! - [`error`]: one error type for all layers, with errno translation.
//! - [`store`]: the storage seam — every query the core issues, as traits.
//! - [`pg`]: the PostgreSQL implementation of that seam, one transaction
//!   per operation, plus the startup preflight.
//! - [`pool`]: a fixed-size blocking connection pool.
//! - [`engine`]: the block engine mapping byte ranges onto fixed-size
//!   block rows (sparse reads, read-modify-write, truncation).
//! - [`paths`]: absolute-path resolution over parent-id edges.
//! - [`ops`]: the semantics of each filesystem operation, generic over the
//!   store so they are testable without a server.
//!
//! The FUSE-facing binary lives in the sibling `pgblockfs` crate; it wires
//! these pieces to `fuse_mt` and adds the host-side free-space probing.

#![deny(missing_docs)]

pub mod engine;
pub mod error;
pub mod ops;
pub mod paths;
pub mod pg;
pub mod pool;
pub mod store;
pub mod types;

#[cfg(test)]
mod memstore;
