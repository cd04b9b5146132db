//! The block engine: translates byte ranges inside a file into operations
//! on fixed-size content blocks.
//!
//! Files are stored as rows of exactly `block_size` bytes keyed by block
//! index. A row that was never written does not exist and reads as zeros,
//! which is what makes sparse files free. The engine owns three jobs:
//! clamping reads to the current file size, turning partial-block writes
//! into read-modify-write cycles, and trimming block rows on truncation.
//!
//! The engine never touches inode metadata. Updating `size` after a write
//! or truncate is the caller's responsibility, inside the same transaction.

use crate::error::{FsError, Result};
use crate::store::BlockStore;
use crate::types::InodeId;

/// Read up to `len` bytes starting at `offset` from a file whose current
/// size is `size`.
///
/// Returns `min(len, max(0, size - offset))` bytes; a read starting at or
/// past the end of the file (and a zero-length read) yields an empty
/// buffer. Holes contribute zeros. Bytes past `size` are never exposed,
/// even when the trailing block row carries stale tail data.
pub fn read_range<S: BlockStore + ?Sized>(
    store: &mut S,
    block_size: u64,
    id: InodeId,
    offset: u64,
    len: u32,
    size: u64,
) -> Result<Vec<u8>> {
    if len == 0 || offset >= size {
        return Ok(Vec::new());
    }
    let end = size.min(offset.saturating_add(len as u64));
    let mut out = vec![0u8; (end - offset) as usize];

    let first = offset / block_size;
    let last = (end - 1) / block_size;
    for block_no in first..=last {
        let block_start = block_no * block_size;
        let lo = offset.max(block_start);
        let hi = end.min(block_start + block_size);
        if let Some(data) = store.read_block(id, block_no)? {
            let src_lo = (lo - block_start) as usize;
            // Rows hold exactly block_size bytes; never index past a short one.
            let src_hi = ((hi - block_start) as usize).min(data.len());
            if src_lo < src_hi {
                let dst_lo = (lo - offset) as usize;
                out[dst_lo..dst_lo + (src_hi - src_lo)].copy_from_slice(&data[src_lo..src_hi]);
            }
        }
    }
    Ok(out)
}

/// Write `data` starting at `offset`, materializing or overwriting every
/// touched block.
///
/// A block fully covered by the range is replaced outright. A partially
/// covered block is fetched (or synthesized as all zeros when absent), the
/// covered span is overlaid, and exactly `block_size` bytes are stored
/// back, so invariant tails beyond the write stay intact and holes become
/// zero-filled rows.
///
/// Returns the number of bytes written, which equals `data.len()` unless an
/// error occurred first; the caller escalates any mismatch.
pub fn write_range<S: BlockStore + ?Sized>(
    store: &mut S,
    block_size: u64,
    id: InodeId,
    offset: u64,
    data: &[u8],
) -> Result<usize> {
    let end = offset
        .checked_add(data.len() as u64)
        .filter(|e| *e <= i64::MAX as u64)
        .ok_or(FsError::TooBig)?;
    if data.is_empty() {
        return Ok(0);
    }

    let mut written = 0;
    let first = offset / block_size;
    let last = (end - 1) / block_size;
    for block_no in first..=last {
        let block_start = block_no * block_size;
        let lo = offset.max(block_start);
        let hi = end.min(block_start + block_size);
        let src = &data[(lo - offset) as usize..(hi - offset) as usize];

        if src.len() as u64 == block_size {
            store.write_block(id, block_no, src)?;
        } else {
            let mut block = store
                .read_block(id, block_no)?
                .unwrap_or_else(|| vec![0; block_size as usize]);
            block.resize(block_size as usize, 0);
            let at = (lo - block_start) as usize;
            block[at..at + src.len()].copy_from_slice(src);
            store.write_block(id, block_no, &block)?;
        }
        written += src.len();
    }
    Ok(written)
}

/// Shrink or grow the content to `new_size` bytes.
///
/// Blocks wholly past the new end are deleted. When the new end falls
/// inside a materialized block, that block's tail is zeroed so a later
/// grow-by-truncate reads zeros there. Growing past the current end is a
/// pure metadata change; no blocks are created.
pub fn truncate<S: BlockStore + ?Sized>(
    store: &mut S,
    block_size: u64,
    id: InodeId,
    new_size: u64,
) -> Result<()> {
    if new_size == 0 {
        return store.delete_blocks_from(id, 0);
    }

    let last = (new_size - 1) / block_size;
    store.delete_blocks_from(id, last + 1)?;

    let keep = (new_size - last * block_size) as usize;
    if (keep as u64) < block_size {
        if let Some(mut block) = store.read_block(id, last)? {
            block.resize(block_size as usize, 0);
            block[keep..].fill(0);
            store.write_block(id, last, &block)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemStore;

    const B: u64 = 4096;
    const INO: InodeId = 42;

    fn write_all(store: &mut MemStore, offset: u64, data: &[u8]) -> u64 {
        let n = write_range(store, B, INO, offset, data).unwrap();
        assert_eq!(n, data.len());
        offset + n as u64
    }

    #[test]
    fn empty_and_past_end_reads() {
        let mut store = MemStore::new();
        assert!(read_range(&mut store, B, INO, 0, 100, 0).unwrap().is_empty());
        write_all(&mut store, 0, b"hello");
        assert!(read_range(&mut store, B, INO, 5, 100, 5).unwrap().is_empty());
        assert!(read_range(&mut store, B, INO, 1000, 100, 5).unwrap().is_empty());
        assert!(read_range(&mut store, B, INO, 0, 0, 5).unwrap().is_empty());
    }

    #[test]
    fn read_clamps_to_size() {
        let mut store = MemStore::new();
        let size = write_all(&mut store, 0, b"hello world");
        let got = read_range(&mut store, B, INO, 0, 100, size).unwrap();
        assert_eq!(got, b"hello world");
        let got = read_range(&mut store, B, INO, 6, 100, size).unwrap();
        assert_eq!(got, b"world");
    }

    #[test]
    fn sparse_write_reads_zeros_and_stores_one_block() {
        // Spec scenario: one byte at offset 1_000_000 of an empty file.
        let mut store = MemStore::new();
        let size = write_all(&mut store, 1_000_000, b"X");
        assert_eq!(size, 1_000_001);
        assert_eq!(store.block_rows(INO), 1);

        let head = read_range(&mut store, B, INO, 0, 1000, size).unwrap();
        assert_eq!(head, vec![0u8; 1000]);
        let tail = read_range(&mut store, B, INO, 1_000_000, 10, size).unwrap();
        assert_eq!(tail, b"X");
        // A hole in the middle also reads as zeros.
        let hole = read_range(&mut store, B, INO, 500_000, 16, size).unwrap();
        assert_eq!(hole, vec![0u8; 16]);
    }

    #[test]
    fn partial_overwrite_across_block_boundary() {
        // Spec scenario: 4096 'A's, then 4 'B's at offset 4094.
        let mut store = MemStore::new();
        write_all(&mut store, 0, &[b'A'; 4096]);
        let size = write_all(&mut store, 4094, &[b'B'; 4]);
        assert_eq!(size, 4098);
        assert_eq!(store.block_rows(INO), 2);

        let got = read_range(&mut store, B, INO, 0, 4100, size).unwrap();
        assert_eq!(got.len(), 4098);
        assert_eq!(&got[..4094], &[b'A'; 4094][..]);
        assert_eq!(&got[4094..], b"BBBB");
    }

    #[test]
    fn full_block_write_skips_read_modify_write() {
        let mut store = MemStore::new();
        // Preload a block, then replace it exactly; contents must be the
        // new bytes with no trace of the old.
        write_all(&mut store, 0, &[1u8; 4096]);
        write_all(&mut store, 0, &[2u8; 4096]);
        let got = read_range(&mut store, B, INO, 0, 4096, 4096).unwrap();
        assert_eq!(got, vec![2u8; 4096]);
        assert_eq!(store.block_rows(INO), 1);
    }

    #[test]
    fn rmw_preserves_neighbouring_bytes() {
        let mut store = MemStore::new();
        write_all(&mut store, 0, &[b'a'; 100]);
        let end = write_all(&mut store, 10, b"ZZZZ");
        assert_eq!(end, 14);
        let got = read_range(&mut store, B, INO, 0, 100, 100).unwrap();
        assert_eq!(&got[..10], &[b'a'; 10][..]);
        assert_eq!(&got[10..14], b"ZZZZ");
        assert_eq!(&got[14..], &[b'a'; 86][..]);
    }

    #[test]
    fn truncate_to_zero_drops_all_blocks() {
        let mut store = MemStore::new();
        write_all(&mut store, 0, &[7u8; 10_000]);
        assert_eq!(store.block_rows(INO), 3);
        truncate(&mut store, B, INO, 0).unwrap();
        assert_eq!(store.block_rows(INO), 0);
    }

    #[test]
    fn truncate_shrink_then_grow_reads_zeros() {
        // Spec scenario: "hello world", shrink to 5, grow to 8.
        let mut store = MemStore::new();
        write_all(&mut store, 0, b"hello world");
        truncate(&mut store, B, INO, 5).unwrap();
        let got = read_range(&mut store, B, INO, 0, 100, 5).unwrap();
        assert_eq!(got, b"hello");

        truncate(&mut store, B, INO, 8).unwrap();
        let got = read_range(&mut store, B, INO, 0, 8, 8).unwrap();
        assert_eq!(got, b"hello\0\0\0");
    }

    #[test]
    fn truncate_on_block_boundary_keeps_last_block_intact() {
        let mut store = MemStore::new();
        write_all(&mut store, 0, &[9u8; 2 * 4096 + 5]);
        assert_eq!(store.block_rows(INO), 3);
        truncate(&mut store, B, INO, 4096).unwrap();
        assert_eq!(store.block_rows(INO), 1);
        let got = read_range(&mut store, B, INO, 0, 4096, 4096).unwrap();
        assert_eq!(got, vec![9u8; 4096]);
    }

    #[test]
    fn truncate_past_end_is_metadata_only() {
        let mut store = MemStore::new();
        write_all(&mut store, 0, b"ab");
        truncate(&mut store, B, INO, 1_000_000).unwrap();
        assert_eq!(store.block_rows(INO), 1);
        let got = read_range(&mut store, B, INO, 0, 10, 1_000_000).unwrap();
        assert_eq!(got, b"ab\0\0\0\0\0\0\0\0");
    }

    #[test]
    fn write_overflow_is_rejected() {
        let mut store = MemStore::new();
        let err = write_range(&mut store, B, INO, u64::MAX - 2, b"abcd").unwrap_err();
        assert_eq!(err.errno(), libc::EFBIG);
        // Past the signed 64-bit ceiling counts as overflow too.
        let err = write_range(&mut store, B, INO, i64::MAX as u64, b"x").unwrap_err();
        assert_eq!(err.errno(), libc::EFBIG);
        assert_eq!(store.block_rows(INO), 0);
    }
}
