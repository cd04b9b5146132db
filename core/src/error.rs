//! The error type shared by every layer, and its translation to POSIX
//! error codes at the FUSE boundary.
//!
//! Internally everything is `Result<T, FsError>`; only the dispatcher turns
//! an error into a negative errno. Database and I/O failures are wrapped via
//! `#[from]`, so the `?` operator composes the layers without explicit
//! mapping.

use std::path::Path;

use thiserror::Error;

/// Everything that can go wrong between a handler entry point and the
/// database.
#[derive(Error, Debug)]
pub enum FsError {
    /// A path or id did not resolve to an inode.
    #[error("no such entry: '{0}'")]
    NotFound(String),

    /// A directory was required but something else was found.
    #[error("not a directory: '{0}'")]
    NotDirectory(String),

    /// A non-directory was required but a directory was found.
    #[error("is a directory: '{0}'")]
    IsDirectory(String),

    /// `unlink` was asked to remove a directory.
    #[error("refusing to unlink directory '{0}'")]
    UnlinkDirectory(String),

    /// An entry with the same `(parent, name)` already exists.
    #[error("entry already exists: '{0}'")]
    Exists(String),

    /// `rmdir` on a directory that still has children.
    #[error("directory not empty: '{0}'")]
    NotEmpty(String),

    /// A mutating operation on a read-only mount.
    #[error("filesystem mounted read-only")]
    ReadOnly,

    /// An operation was invoked with a zero or stale file handle.
    #[error("bad file handle {0}")]
    BadHandle(u64),

    /// A symlink target does not fit the caller's buffer.
    #[error("symlink target of '{0}' exceeds the reply buffer")]
    TargetTooLong(String),

    /// `offset + length` overflows the representable file size.
    #[error("write range overflows file size limit")]
    TooBig,

    /// A name or rename destination the store cannot represent.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Fewer bytes reached the store than were submitted; the transaction
    /// must be rolled back to avoid torn content.
    #[error("short write: expected {expected} bytes, stored {stored}")]
    ShortWrite {
        /// Bytes the caller handed in.
        expected: usize,
        /// Bytes the store acknowledged.
        stored: usize,
    },

    /// An internal invariant did not hold (e.g. a parent row that is not a
    /// directory). Logged at ERROR by the caller and surfaced as I/O error.
    #[error("storage invariant violated: {0}")]
    Corrupt(String),

    /// A startup check against the database failed; the mount is refused.
    #[error("preflight failed: {0}")]
    Preflight(String),

    /// Any database-level failure.
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),

    /// Host-side I/O failure (mount table, statvfs).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Shorthand for [`FsError::NotFound`] from a path.
    pub fn not_found(path: &Path) -> FsError {
        FsError::NotFound(path.display().to_string())
    }

    /// The POSIX error code this error maps to at the FUSE boundary
    /// (positive; the bridge negates it).
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::NotDirectory(_) => libc::ENOTDIR,
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::UnlinkDirectory(_) => libc::EPERM,
            FsError::Exists(_) => libc::EEXIST,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::ReadOnly => libc::EROFS,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::TargetTooLong(_) => libc::ENAMETOOLONG,
            FsError::TooBig => libc::EFBIG,
            FsError::Invalid(_) => libc::EINVAL,
            FsError::ShortWrite { .. } => libc::EIO,
            FsError::Corrupt(_) => libc::EIO,
            FsError::Preflight(_) => libc::EIO,
            FsError::Database(_) => libc::EIO,
            FsError::Io(_) => libc::EIO,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::not_found(&PathBuf::from("/a")).errno(), libc::ENOENT);
        assert_eq!(FsError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(FsError::NotEmpty("/d".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::BadHandle(0).errno(), libc::EBADF);
        assert_eq!(
            FsError::ShortWrite {
                expected: 10,
                stored: 4
            }
            .errno(),
            libc::EIO
        );
        assert_eq!(FsError::TargetTooLong("/l".into()).errno(), libc::ENAMETOOLONG);
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert_eq!(fails().unwrap_err().errno(), libc::EIO);
    }
}
