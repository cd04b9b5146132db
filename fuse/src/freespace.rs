//! Host-side free-space estimation for `statfs`.
//!
//! The database's tablespace directories live on ordinary host
//! filesystems, and whichever of those fills up first limits how much more
//! data the mount can take. We read the host mount table, match every
//! tablespace directory to its longest-prefix mount point, ask `statvfs`
//! for that filesystem's free and available bytes, and keep the minimum
//! across all tablespaces, converted to content-block units.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use log::{debug, error};
use pgblockfs_core::error::{FsError, Result};

const MOUNT_TABLE: &str = "/proc/mounts";

/// Worst-case `(free, available)` block counts, in units of `block_size`,
/// across the filesystems backing the given tablespace directories.
///
/// Directories that match no mount entry are skipped (their free space is
/// unknowable); when nothing matches at all, both counts stay at the
/// "unlimited" sentinel and the caller's arithmetic saturates.
pub fn worst_case(locations: &[PathBuf], block_size: u64) -> Result<(u64, u64)> {
    let table = std::fs::read_to_string(MOUNT_TABLE)?;
    let mounts = parse_mount_table(&table);

    let mut free = u64::MAX;
    let mut avail = u64::MAX;
    for location in locations {
        // Tablespace locations may be symlinks into other filesystems.
        let location = match std::fs::canonicalize(location) {
            Ok(real) => real,
            Err(e) => {
                error!("realpath for '{}' failed: {}", location.display(), e);
                location.clone()
            }
        };
        let mount = match longest_prefix(&mounts, &location) {
            Some(mount) => mount,
            None => continue,
        };
        let (free_bytes, avail_bytes) = statvfs_bytes(mount)?;
        debug!(
            "tablespace '{}' on mount '{}': {} bytes free, {} available",
            location.display(),
            mount.display(),
            free_bytes,
            avail_bytes
        );
        free = free.min(free_bytes / block_size);
        avail = avail.min(avail_bytes / block_size);
    }
    Ok((free, avail))
}

/// Mount points from `/proc/mounts` content, with octal escapes decoded.
fn parse_mount_table(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .collect()
}

/// `/proc/mounts` escapes whitespace and backslashes in mount points as
/// `\ooo` octal sequences.
fn unescape_mount_path(s: &str) -> PathBuf {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Some(value) = s
                .get(i + 1..i + 4)
                .and_then(|octal| u8::from_str_radix(octal, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(std::ffi::OsStr::from_bytes(&out).to_os_string())
}

/// The mount point that is the longest component-wise prefix of `dir`.
fn longest_prefix<'a>(mounts: &'a [PathBuf], dir: &Path) -> Option<&'a PathBuf> {
    mounts
        .iter()
        .filter(|mount| dir.starts_with(mount))
        .max_by_key(|mount| mount.as_os_str().len())
}

/// Free and available byte counts of the filesystem holding `path`.
fn statvfs_bytes(path: &Path) -> Result<(u64, u64)> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::Invalid(format!("mount point '{}' contains NUL", path.display())))?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
    if rc != 0 {
        return Err(FsError::Io(std::io::Error::last_os_error()));
    }
    let fragment = if vfs.f_frsize > 0 {
        vfs.f_frsize as u64
    } else {
        vfs.f_bsize as u64
    };
    Ok((
        (vfs.f_bfree as u64) * fragment,
        (vfs.f_bavail as u64) * fragment,
    ))
}
