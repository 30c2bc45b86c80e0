#![forbid(unsafe_code)]
//! Block allocation.
//!
//! A packed allocation bitmap lives in block 0 (bit i set means block i
//! is allocated) and is mutated through the buffer cache like any other
//! block. Allocation is strict first-fit: the lowest clear bit wins.

use loam_block::{BlockDevice, BufferCache};
use loam_error::{LoamError, Result};
use loam_types::{BITMAP_BLOCK, BlockNumber, InodeNumber};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice, LSB-first within each byte.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u64) -> u64 {
    (0..count).filter(|idx| !bitmap_get(bitmap, *idx)).count() as u64
}

/// First free (zero) bit in the first `count` bits of `bitmap`,
/// scanning left to right.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u64) -> Option<u64> {
    (0..count).find(|idx| !bitmap_get(bitmap, *idx))
}

/// Render the first `count` bits as a diagnostic string of 0s and 1s.
#[must_use]
pub fn bitmap_render(bitmap: &[u8], count: u64) -> String {
    (0..count)
        .map(|idx| if bitmap_get(bitmap, idx) { '1' } else { '0' })
        .collect()
}

// ── Block allocator ─────────────────────────────────────────────────────────

/// Allocate the first free block on `dev`, marking it in the bitmap.
///
/// The bitmap block is read and mutated through `cache` and marked
/// dirty there; durability follows the cache's sync rules.
pub fn alloc_block(dev: &dyn BlockDevice, cache: &mut BufferCache) -> Result<BlockNumber> {
    let total = dev.block_count();
    let found = {
        let bitmap = cache.get(dev, InodeNumber(0), BITMAP_BLOCK)?;
        let Some(idx) = bitmap_find_free(bitmap, total) else {
            return Err(LoamError::NoSpace);
        };
        bitmap_set(bitmap, idx);
        idx
    };
    cache.mark_dirty(BITMAP_BLOCK)?;
    debug!(target: "loam::alloc", event = "alloc", block = found);
    Ok(BlockNumber(found))
}

/// Return `block` to the free pool.
pub fn free_block(
    dev: &dyn BlockDevice,
    cache: &mut BufferCache,
    block: BlockNumber,
) -> Result<()> {
    if block.0 >= dev.block_count() {
        return Err(LoamError::InvalidArgument(format!(
            "block out of range: block={block} block_count={}",
            dev.block_count()
        )));
    }
    {
        let bitmap = cache.get(dev, InodeNumber(0), BITMAP_BLOCK)?;
        bitmap_clear(bitmap, block.0);
    }
    cache.mark_dirty(BITMAP_BLOCK)?;
    trace!(target: "loam::alloc", event = "free", block = block.0);
    Ok(())
}

/// Count of unallocated blocks on `dev`.
pub fn free_block_count(dev: &dyn BlockDevice, cache: &mut BufferCache) -> Result<u64> {
    let total = dev.block_count();
    let bitmap = cache.get(dev, InodeNumber(0), BITMAP_BLOCK)?;
    Ok(bitmap_count_free(bitmap, total))
}

// ── Tests ───────────────────────────────────────────────────────────────────
