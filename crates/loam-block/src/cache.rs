//! Write-back buffer cache over a block device.
//!
//! `BufferCache` owns a fixed array of slots, each able to hold one
//! block. Residency is tracked by a chained hash index, recency by an
//! arena linked list, and dirtiness by a global dirty list plus
//! per-inode sets for data blocks. Misses evict from the LRU tail with
//! write-back; pinned slots are never evicted.
//!
//! The cache is single-threaded by construction: every operation takes
//! `&mut self` and completes before returning, and the buffer borrow
//! returned by [`BufferCache::get`] keeps the cache locked out of
//! eviction for its whole lifetime.

use crate::device::BlockDevice;
use crate::dirty::DirtyIndex;
use crate::free_list::FreeSlotList;
use crate::hash_index::HashIndex;
use crate::link_list::{Handle, LinkList};
use loam_error::{LoamError, Result};
use loam_types::{BLOCK_SIZE, BlockNumber, BlockTag, InodeNumber};
use serde::Serialize;
use std::fs;
use tracing::{debug, trace, warn};

/// Slot count used when the host's memory size cannot be determined.
pub const DEFAULT_SLOT_COUNT: usize = 16 * 1024;

/// Upper bound on auto-sized caches: 8 GiB worth of blocks.
const MAX_SLOT_COUNT: usize = 2 * 1024 * 1024;

const GIB: u64 = 1024 * 1024 * 1024;

/// Derive the slot count from total system RAM.
///
/// Hosts under 2 GiB get a fixed 64 MiB cache; up to 16 GiB the cache
/// takes an eighth of RAM; beyond that the eighth is capped.
#[must_use]
pub fn slot_count_for_ram(total_ram_bytes: u64) -> usize {
    if total_ram_bytes < 2 * GIB {
        return DEFAULT_SLOT_COUNT;
    }
    let eighth = (total_ram_bytes / 8) / BLOCK_SIZE as u64;
    let capped = if total_ram_bytes <= 16 * GIB {
        eighth
    } else {
        eighth.min(MAX_SLOT_COUNT as u64)
    };
    usize::try_from(capped).unwrap_or(MAX_SLOT_COUNT)
}

/// Total RAM reported by `/proc/meminfo`, if readable.
#[must_use]
pub fn detect_total_ram() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    kib.checked_mul(1024)
}

/// Snapshot of cache counters. All monotonic counters cover the cache's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups satisfied from a resident slot.
    pub hits: u64,
    /// Lookups that required a device read.
    pub misses: u64,
    /// Slots recycled to make room for another block.
    pub evictions: u64,
    /// Dirty buffers written to the device (eviction or sync).
    pub write_backs: u64,
    /// Currently resident blocks.
    pub resident: usize,
    /// Currently unused slots.
    pub free: usize,
    /// Currently dirty slots.
    pub dirty: usize,
    /// Total slot count.
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct Slot {
    dirty: bool,
    pin_count: u32,
    block: BlockNumber,
    inode: InodeNumber,
    buffer: Option<Box<[u8]>>,
    lru: Option<Handle>,
    gdl: Option<Handle>,
}

impl Slot {
    fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer
            .get_or_insert_with(|| vec![0_u8; BLOCK_SIZE].into_boxed_slice())
    }
}

/// Fixed-slot block cache with LRU write-back eviction.
#[derive(Debug)]
pub struct BufferCache {
    slots: Vec<Slot>,
    index: HashIndex,
    free: FreeSlotList,
    lru: LinkList,
    gdl: LinkList,
    dirty: DirtyIndex,
    hits: u64,
    misses: u64,
    evictions: u64,
    write_backs: u64,
}

impl BufferCache {
    /// Build a cache sized from detected system RAM.
    #[must_use]
    pub fn new() -> Self {
        Self::build(detect_total_ram().map_or(DEFAULT_SLOT_COUNT, slot_count_for_ram))
    }

    /// Build a cache with an explicit slot count.
    pub fn with_slot_count(slot_count: usize) -> Result<Self> {
        if slot_count == 0 {
            return Err(LoamError::InvalidArgument(
                "cache needs at least one slot".to_owned(),
            ));
        }
        Ok(Self::build(slot_count))
    }

    fn build(slot_count: usize) -> Self {
        let mut free = FreeSlotList::new();
        let mut slots = Vec::with_capacity(slot_count);
        for idx in 0..slot_count {
            slots.push(Slot::default());
            free.push(idx);
        }
        debug!(target: "loam::cache", event = "alloc_cache", slots = slot_count);
        Self {
            slots,
            index: HashIndex::new(),
            free,
            lru: LinkList::new(),
            gdl: LinkList::new(),
            dirty: DirtyIndex::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            write_backs: 0,
        }
    }

    /// Total slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether `block` currently occupies a slot.
    #[must_use]
    pub fn is_resident(&self, block: BlockNumber) -> bool {
        self.index.lookup(block).is_some()
    }

    /// Number of dirty slots awaiting write-back.
    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.gdl.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            write_backs: self.write_backs,
            resident: self.lru.len(),
            free: self.free.len(),
            dirty: self.gdl.len(),
            capacity: self.slots.len(),
        }
    }

    /// Fetch `block`, loading it from `dev` on a miss, and return its
    /// buffer. The slot moves to the front of the recency list.
    pub fn get(
        &mut self,
        dev: &dyn BlockDevice,
        inode: InodeNumber,
        block: BlockNumber,
    ) -> Result<&mut [u8]> {
        let idx = self.slot_of(dev, inode, block)?;
        debug_assert!(self.accounting_holds());
        Ok(self.slots[idx].buffer_mut())
    }

    /// Replace `block`'s contents with `buf` and mark it dirty.
    ///
    /// Loads the block first if it is not resident. Data blocks
    /// (`buf[0]` decodes to [`BlockTag::Data`]) additionally enter the
    /// per-inode dirty set for `inode`.
    pub fn write(
        &mut self,
        dev: &dyn BlockDevice,
        buf: &[u8],
        inode: InodeNumber,
        block: BlockNumber,
    ) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(LoamError::InvalidArgument(format!(
                "buffer size mismatch: got {}, expected {BLOCK_SIZE}",
                buf.len()
            )));
        }
        let idx = self.slot_of(dev, inode, block)?;
        self.slots[idx].buffer_mut().copy_from_slice(buf);
        self.mark_slot_dirty(idx, inode, block, buf[0]);
        trace!(
            target: "loam::cache",
            event = "write",
            block = block.0,
            inode = inode.0
        );
        debug_assert!(self.accounting_holds());
        Ok(())
    }

    /// Mark a resident block dirty after its buffer was mutated in
    /// place through [`BufferCache::get`].
    pub fn mark_dirty(&mut self, block: BlockNumber) -> Result<()> {
        let Some(idx) = self.index.lookup(block) else {
            return Err(LoamError::InvalidArgument(format!(
                "block {block} is not resident"
            )));
        };
        let inode = self.slots[idx].inode;
        let first_byte = self.slots[idx].buffer_mut()[0];
        self.mark_slot_dirty(idx, inode, block, first_byte);
        debug_assert!(self.accounting_holds());
        Ok(())
    }

    /// Write back every dirty block owned by `inode`, then sync the
    /// device. Idempotent: a second call finds nothing to flush.
    pub fn fsync(&mut self, dev: &dyn BlockDevice, inode: InodeNumber) -> Result<()> {
        let blocks = self.dirty.blocks(inode);
        let flushed = blocks.len();
        for block in blocks {
            let Some(idx) = self.index.lookup(block) else {
                panic!("dirty block {block} for inode {inode} is not resident");
            };
            self.write_back(dev, idx)?;
        }
        dev.sync()?;
        debug!(
            target: "loam::cache",
            event = "fsync",
            inode = inode.0,
            flushed = flushed
        );
        debug_assert!(self.accounting_holds());
        Ok(())
    }

    /// Write back every dirty block in the cache, then sync the device.
    pub fn sync_all(&mut self, dev: &dyn BlockDevice) -> Result<()> {
        let mut flushed = 0_usize;
        while let Some(idx) = self.gdl.back() {
            self.write_back(dev, idx)?;
            flushed += 1;
        }
        dev.sync()?;
        debug!(target: "loam::cache", event = "sync_all", flushed = flushed);
        debug_assert!(self.accounting_holds());
        Ok(())
    }

    /// Pin `block` against eviction. The block must be resident.
    pub fn pin(&mut self, block: BlockNumber) -> Result<()> {
        let Some(idx) = self.index.lookup(block) else {
            return Err(LoamError::InvalidArgument(format!(
                "block {block} is not resident"
            )));
        };
        self.slots[idx].pin_count += 1;
        Ok(())
    }

    /// Release one pin on `block`.
    pub fn unpin(&mut self, block: BlockNumber) -> Result<()> {
        let Some(idx) = self.index.lookup(block) else {
            return Err(LoamError::InvalidArgument(format!(
                "block {block} is not resident"
            )));
        };
        if self.slots[idx].pin_count == 0 {
            return Err(LoamError::InvalidArgument(format!(
                "block {block} is not pinned"
            )));
        }
        self.slots[idx].pin_count -= 1;
        Ok(())
    }

    fn slot_of(
        &mut self,
        dev: &dyn BlockDevice,
        inode: InodeNumber,
        block: BlockNumber,
    ) -> Result<usize> {
        if block.0 >= dev.block_count() {
            return Err(LoamError::InvalidArgument(format!(
                "block out of range: block={block} block_count={}",
                dev.block_count()
            )));
        }

        if let Some(idx) = self.index.lookup(block) {
            self.hits += 1;
            let Some(handle) = self.slots[idx].lru.take() else {
                panic!("resident slot {idx} is missing from the recency list");
            };
            self.lru.unlink(handle);
            self.slots[idx].lru = Some(self.lru.push_front(idx));
            trace!(target: "loam::cache", event = "hit", block = block.0);
            return Ok(idx);
        }

        self.misses += 1;
        if self.free.is_empty() {
            self.evict_lru(dev)?;
        }
        let Some(idx) = self.free.pop() else {
            return Err(LoamError::CacheFull);
        };

        {
            let slot = &mut self.slots[idx];
            slot.dirty = false;
            slot.pin_count = 0;
            slot.block = block;
            slot.inode = inode;
            slot.lru = None;
            slot.gdl = None;
        }
        if let Err(err) = dev.read_block(block, self.slots[idx].buffer_mut()) {
            self.free.push(idx);
            return Err(err);
        }
        self.index.insert(block, idx);
        self.slots[idx].lru = Some(self.lru.push_front(idx));
        trace!(
            target: "loam::cache",
            event = "install",
            block = block.0,
            slot = idx
        );
        Ok(idx)
    }

    fn mark_slot_dirty(
        &mut self,
        idx: usize,
        inode: InodeNumber,
        block: BlockNumber,
        first_byte: u8,
    ) {
        if !self.slots[idx].dirty {
            self.slots[idx].dirty = true;
            self.slots[idx].gdl = Some(self.gdl.push_front(idx));
        }
        let prev = self.slots[idx].inode;
        if BlockTag::is_data(first_byte) {
            if prev != inode && self.dirty.contains(prev, block) {
                self.dirty.remove_block(prev, block);
            }
            self.slots[idx].inode = inode;
            self.dirty.insert(inode, block);
        } else if self.dirty.contains(prev, block) {
            // The tag stopped being DATA; drop the stale ownership so
            // fsync never chases a non-data block.
            self.dirty.remove_block(prev, block);
        }
    }

    /// Recycle the least recently used unpinned slot, writing it back
    /// first if dirty.
    fn evict_lru(&mut self, dev: &dyn BlockDevice) -> Result<()> {
        let victim = self
            .lru
            .iter_from_back()
            .find(|(_, idx)| self.slots[*idx].pin_count == 0);
        let Some((handle, idx)) = victim else {
            warn!(
                target: "loam::cache",
                event = "cache_full",
                resident = self.lru.len()
            );
            return Err(LoamError::CacheFull);
        };

        self.lru.unlink(handle);
        self.slots[idx].lru = None;
        if self.slots[idx].dirty {
            if let Err(err) = self.write_back(dev, idx) {
                self.slots[idx].lru = Some(self.lru.push_front(idx));
                return Err(err);
            }
        }

        let block = self.slots[idx].block;
        self.index.remove(block);
        self.free.push(idx);
        self.evictions += 1;
        debug!(target: "loam::cache", event = "evict", block = block.0, slot = idx);
        Ok(())
    }

    /// Flush one dirty slot and drop it from both dirty structures.
    fn write_back(&mut self, dev: &dyn BlockDevice, idx: usize) -> Result<()> {
        let block = self.slots[idx].block;
        let inode = self.slots[idx].inode;
        let first_byte = {
            let Some(buffer) = self.slots[idx].buffer.as_deref() else {
                panic!("dirty slot {idx} has no buffer");
            };
            dev.write_block(block, buffer)?;
            buffer[0]
        };
        self.slots[idx].dirty = false;
        if let Some(handle) = self.slots[idx].gdl.take() {
            self.gdl.unlink(handle);
        }
        if BlockTag::is_data(first_byte) {
            self.dirty.remove_block(inode, block);
        }
        self.write_backs += 1;
        trace!(
            target: "loam::cache",
            event = "write_back",
            block = block.0,
            inode = inode.0
        );
        Ok(())
    }

    fn accounting_holds(&self) -> bool {
        let dirty_slots = self.slots.iter().filter(|s| s.dirty).count();
        self.free.len() + self.lru.len() == self.slots.len()
            && self.index.len() == self.lru.len()
            && self.gdl.len() == dirty_slots
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashMap;

    struct MemBlockDevice {
        block_count: u64,
        blocks: Mutex<HashMap<u64, Vec<u8>>>,
        writes: Mutex<Vec<u64>>,
    }

    impl MemBlockDevice {
        fn new(block_count: u64) -> Self {
            Self {
                block_count,
                blocks: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
            }
        }

        fn on_disk(&self, block: u64) -> Vec<u8> {
            self.blocks
                .lock()
                .get(&block)
                .cloned()
                .unwrap_or_else(|| vec![0_u8; BLOCK_SIZE])
        }

        fn write_count(&self) -> usize {
            self.writes.lock().len()
        }
    }

    impl BlockDevice for MemBlockDevice {
        fn block_count(&self) -> u64 {
            self.block_count
        }

        fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
            buf.copy_from_slice(&self.on_disk(block.0));
            Ok(())
        }

        fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()> {
            self.writes.lock().push(block.0);
            self.blocks.lock().insert(block.0, buf.to_vec());
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    fn data_payload(salt: u8) -> Vec<u8> {
        // Byte 0 decodes to BlockTag::Data.
        let mut buf = vec![salt; BLOCK_SIZE];
        buf[0] = 0;
        buf
    }

    fn node_payload(salt: u8) -> Vec<u8> {
        let mut buf = vec![salt; BLOCK_SIZE];
        buf[0] = BlockTag::BtreeNode.as_byte();
        buf
    }

    const INO: InodeNumber = InodeNumber(1);

    #[test]
    fn written_bytes_read_back() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(4).unwrap();
        let payload = data_payload(0xAB);
        cache.write(&dev, &payload, INO, BlockNumber(3)).unwrap();
        assert_eq!(cache.get(&dev, INO, BlockNumber(3)).unwrap(), &payload[..]);
        // Still dirty: nothing reached the device yet.
        assert_eq!(dev.write_count(), 0);
    }

    #[test]
    fn eviction_writes_back_and_reload_returns_bytes() {
        // Two slots, three distinct blocks: the oldest write is evicted
        // with write-back and must read back intact.
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(2).unwrap();
        let a = data_payload(0xA1);
        cache.write(&dev, &a, INO, BlockNumber(1)).unwrap();
        cache
            .write(&dev, &data_payload(0xB2), INO, BlockNumber(2))
            .unwrap();
        cache
            .write(&dev, &data_payload(0xC3), INO, BlockNumber(3))
            .unwrap();

        assert!(!cache.is_resident(BlockNumber(1)));
        assert_eq!(dev.on_disk(1), a);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.get(&dev, INO, BlockNumber(1)).unwrap(), &a[..]);
    }

    #[test]
    fn lru_touch_changes_the_victim() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(2).unwrap();
        cache.get(&dev, INO, BlockNumber(1)).unwrap();
        cache.get(&dev, INO, BlockNumber(2)).unwrap();
        cache.get(&dev, INO, BlockNumber(1)).unwrap();
        cache.get(&dev, INO, BlockNumber(3)).unwrap();
        assert!(cache.is_resident(BlockNumber(1)));
        assert!(!cache.is_resident(BlockNumber(2)));
    }

    #[test]
    fn fsync_flushes_one_inode_only() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(8).unwrap();
        let mine = data_payload(0x11);
        let theirs = data_payload(0x22);
        cache
            .write(&dev, &mine, InodeNumber(7), BlockNumber(4))
            .unwrap();
        cache
            .write(&dev, &theirs, InodeNumber(8), BlockNumber(5))
            .unwrap();

        cache.fsync(&dev, InodeNumber(7)).unwrap();
        assert_eq!(dev.on_disk(4), mine);
        assert_ne!(dev.on_disk(5), theirs);
        assert_eq!(cache.dirty_len(), 1);
    }

    #[test]
    fn fsync_is_idempotent() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(4).unwrap();
        cache
            .write(&dev, &data_payload(0x33), InodeNumber(9), BlockNumber(2))
            .unwrap();
        cache.fsync(&dev, InodeNumber(9)).unwrap();
        let writes = dev.write_count();
        cache.fsync(&dev, InodeNumber(9)).unwrap();
        assert_eq!(dev.write_count(), writes);
        assert_eq!(cache.dirty_len(), 0);
    }

    #[test]
    fn sync_all_flushes_every_inode() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(8).unwrap();
        for block in 1_u64..=5 {
            cache
                .write(
                    &dev,
                    &data_payload(block as u8),
                    InodeNumber(block),
                    BlockNumber(block),
                )
                .unwrap();
        }
        cache.sync_all(&dev).unwrap();
        assert_eq!(cache.dirty_len(), 0);
        assert_eq!(cache.dirty.inode_count(), 0);
        for block in 1_u64..=5 {
            assert_eq!(dev.on_disk(block), data_payload(block as u8));
        }
    }

    #[test]
    fn non_data_blocks_skip_per_inode_tracking() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(4).unwrap();
        cache
            .write(&dev, &node_payload(0x44), INO, BlockNumber(6))
            .unwrap();
        assert_eq!(cache.dirty_len(), 1);
        assert_eq!(cache.dirty.inode_count(), 0);

        // A per-inode fsync still syncs the device but flushes nothing.
        cache.fsync(&dev, INO).unwrap();
        assert_eq!(cache.dirty_len(), 1);

        cache.sync_all(&dev).unwrap();
        assert_eq!(cache.dirty_len(), 0);
    }

    #[test]
    fn rewriting_under_a_new_inode_moves_ownership() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(4).unwrap();
        cache
            .write(&dev, &data_payload(0x55), InodeNumber(1), BlockNumber(3))
            .unwrap();
        cache
            .write(&dev, &data_payload(0x66), InodeNumber(2), BlockNumber(3))
            .unwrap();
        assert!(!cache.dirty.contains(InodeNumber(1), BlockNumber(3)));
        assert!(cache.dirty.contains(InodeNumber(2), BlockNumber(3)));
        assert_eq!(cache.dirty_len(), 1);
    }

    #[test]
    fn pinned_slots_survive_eviction_pressure() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(2).unwrap();
        cache.get(&dev, INO, BlockNumber(1)).unwrap();
        cache.pin(BlockNumber(1)).unwrap();
        cache.get(&dev, INO, BlockNumber(2)).unwrap();

        // Block 1 is the LRU tail but pinned; block 2 must go instead.
        cache.get(&dev, INO, BlockNumber(3)).unwrap();
        assert!(cache.is_resident(BlockNumber(1)));
        assert!(!cache.is_resident(BlockNumber(2)));
    }

    #[test]
    fn all_pinned_reports_cache_full() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(2).unwrap();
        cache.get(&dev, INO, BlockNumber(1)).unwrap();
        cache.pin(BlockNumber(1)).unwrap();
        cache.get(&dev, INO, BlockNumber(2)).unwrap();
        cache.pin(BlockNumber(2)).unwrap();

        assert!(matches!(
            cache.get(&dev, INO, BlockNumber(3)),
            Err(LoamError::CacheFull)
        ));

        cache.unpin(BlockNumber(1)).unwrap();
        assert!(cache.get(&dev, INO, BlockNumber(3)).is_ok());
    }

    #[test]
    fn mark_dirty_tracks_in_place_mutation() {
        let dev = MemBlockDevice::new(16);
        let mut cache = BufferCache::with_slot_count(4).unwrap();
        {
            let buf = cache.get(&dev, INO, BlockNumber(7)).unwrap();
            buf[0] = BlockTag::Bitmap.as_byte();
            buf[100] = 0xEE;
        }
        cache.mark_dirty(BlockNumber(7)).unwrap();
        assert_eq!(cache.dirty_len(), 1);
        cache.sync_all(&dev).unwrap();
        assert_eq!(dev.on_disk(7)[100], 0xEE);

        assert!(matches!(
            cache.mark_dirty(BlockNumber(15)),
            Err(LoamError::InvalidArgument(_))
        ));
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let dev = MemBlockDevice::new(4);
        let mut cache = BufferCache::with_slot_count(2).unwrap();
        assert!(matches!(
            cache.get(&dev, INO, BlockNumber(4)),
            Err(LoamError::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.write(&dev, &[0_u8; 16], INO, BlockNumber(0)),
            Err(LoamError::InvalidArgument(_))
        ));
        assert!(BufferCache::with_slot_count(0).is_err());
    }

    #[test]
    fn slot_accounting_holds_under_churn() {
        let dev = MemBlockDevice::new(64);
        let mut cache = BufferCache::with_slot_count(4).unwrap();
        for round in 0_u64..40 {
            let block = BlockNumber(round % 9);
            if round % 3 == 0 {
                cache
                    .write(&dev, &data_payload(round as u8), INO, block)
                    .unwrap();
            } else {
                cache.get(&dev, INO, block).unwrap();
            }
            assert_eq!(
                cache.free.len() + cache.lru.len(),
                cache.capacity(),
                "slot accounting broke at round {round}"
            );
            assert_eq!(cache.index.len(), cache.lru.len());
        }
        cache.sync_all(&dev).unwrap();
        assert!(cache.accounting_holds());
    }

    #[test]
    fn sizing_policy_matches_ram_tiers() {
        assert_eq!(slot_count_for_ram(GIB), DEFAULT_SLOT_COUNT);
        assert_eq!(slot_count_for_ram(4 * GIB), (4 * GIB / 8) as usize / 4096);
        assert_eq!(slot_count_for_ram(64 * GIB), MAX_SLOT_COUNT);
    }

    proptest! {
        // Round-trip: whatever sequence of writes happens, a get always
        // returns the most recent bytes, and sync_all makes the device
        // agree with the model.
        #[test]
        fn random_workload_round_trips(ops in proptest::collection::vec((0_u64..12, any::<u8>()), 1..60)) {
            let dev = MemBlockDevice::new(12);
            let mut cache = BufferCache::with_slot_count(3).unwrap();
            let mut model: HashMap<u64, Vec<u8>> = HashMap::new();

            for (block, salt) in ops {
                let payload = vec![salt; BLOCK_SIZE];
                cache.write(&dev, &payload, INO, BlockNumber(block)).unwrap();
                model.insert(block, payload);

                let chosen = *model.keys().next().unwrap();
                let got = cache.get(&dev, INO, BlockNumber(chosen)).unwrap();
                prop_assert_eq!(&got[..], &model[&chosen][..]);
            }

            cache.sync_all(&dev).unwrap();
            for (block, payload) in &model {
                prop_assert_eq!(&dev.on_disk(*block), payload);
            }
            prop_assert_eq!(cache.dirty_len(), 0);
        }
    }
}
