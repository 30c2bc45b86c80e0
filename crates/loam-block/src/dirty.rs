//! Per-inode dirty block tracking.
//!
//! Chained map from inode number to a linked set of dirty block numbers,
//! using the same fixed bucket scheme as the block index. `fsync` walks
//! one inode's set; the global dirty list handles whole-cache flushes.

use loam_types::{BlockNumber, HASHMAP_SIZE, InodeNumber};

#[derive(Debug)]
struct InodeEntry {
    inode: InodeNumber,
    head: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct BlockEntry {
    block: BlockNumber,
    next: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct DirtyIndex {
    buckets: [Option<usize>; HASHMAP_SIZE],
    inodes: Vec<Option<InodeEntry>>,
    inode_vacant: Vec<usize>,
    blocks: Vec<Option<BlockEntry>>,
    block_vacant: Vec<usize>,
}

impl DirtyIndex {
    pub fn new() -> Self {
        Self {
            buckets: [None; HASHMAP_SIZE],
            inodes: Vec::new(),
            inode_vacant: Vec::new(),
            blocks: Vec::new(),
            block_vacant: Vec::new(),
        }
    }

    fn bucket(inode: InodeNumber) -> usize {
        (inode.0 % HASHMAP_SIZE as u64) as usize
    }

    fn entry_index(&self, inode: InodeNumber) -> Option<usize> {
        let mut cursor = self.buckets[Self::bucket(inode)];
        while let Some(idx) = cursor {
            let entry = self.inodes[idx].as_ref()?;
            if entry.inode == inode {
                return Some(idx);
            }
            cursor = entry.next;
        }
        None
    }

    /// Record `block` as dirty for `inode`. Idempotent.
    pub fn insert(&mut self, inode: InodeNumber, block: BlockNumber) {
        let entry_idx = match self.entry_index(inode) {
            Some(idx) => {
                if self.list_contains(idx, block) {
                    return;
                }
                idx
            }
            None => {
                let bucket = Self::bucket(inode);
                let entry = InodeEntry {
                    inode,
                    head: None,
                    next: self.buckets[bucket],
                };
                let idx = if let Some(idx) = self.inode_vacant.pop() {
                    self.inodes[idx] = Some(entry);
                    idx
                } else {
                    self.inodes.push(Some(entry));
                    self.inodes.len() - 1
                };
                self.buckets[bucket] = Some(idx);
                idx
            }
        };

        let head = self.inodes[entry_idx].as_ref().and_then(|e| e.head);
        let node = BlockEntry { block, next: head };
        let node_idx = if let Some(idx) = self.block_vacant.pop() {
            self.blocks[idx] = Some(node);
            idx
        } else {
            self.blocks.push(Some(node));
            self.blocks.len() - 1
        };
        if let Some(entry) = self.inodes[entry_idx].as_mut() {
            entry.head = Some(node_idx);
        }
    }

    fn list_contains(&self, entry_idx: usize, block: BlockNumber) -> bool {
        let mut cursor = self.inodes[entry_idx].as_ref().and_then(|e| e.head);
        while let Some(idx) = cursor {
            match self.blocks[idx].as_ref() {
                Some(node) if node.block == block => return true,
                Some(node) => cursor = node.next,
                None => return false,
            }
        }
        false
    }

    /// Whether `block` is recorded dirty under `inode`.
    pub fn contains(&self, inode: InodeNumber, block: BlockNumber) -> bool {
        self.entry_index(inode)
            .is_some_and(|idx| self.list_contains(idx, block))
    }

    /// Snapshot of the dirty blocks recorded for `inode`.
    pub fn blocks(&self, inode: InodeNumber) -> Vec<BlockNumber> {
        let mut out = Vec::new();
        let mut cursor = self
            .entry_index(inode)
            .and_then(|idx| self.inodes[idx].as_ref())
            .and_then(|e| e.head);
        while let Some(idx) = cursor {
            match self.blocks[idx].as_ref() {
                Some(node) => {
                    out.push(node.block);
                    cursor = node.next;
                }
                None => break,
            }
        }
        out
    }

    /// Drop one block from `inode`'s set; the inode entry is deleted when
    /// its set empties.
    pub fn remove_block(&mut self, inode: InodeNumber, block: BlockNumber) {
        let Some(entry_idx) = self.entry_index(inode) else {
            return;
        };

        let mut prev: Option<usize> = None;
        let mut cursor = self.inodes[entry_idx].as_ref().and_then(|e| e.head);
        while let Some(idx) = cursor {
            let Some(node) = self.blocks[idx].as_ref() else {
                return;
            };
            if node.block == block {
                let next = node.next;
                match prev {
                    Some(prev_idx) => {
                        if let Some(prev_node) = self.blocks[prev_idx].as_mut() {
                            prev_node.next = next;
                        }
                    }
                    None => {
                        if let Some(entry) = self.inodes[entry_idx].as_mut() {
                            entry.head = next;
                        }
                    }
                }
                self.blocks[idx] = None;
                self.block_vacant.push(idx);
                break;
            }
            prev = Some(idx);
            cursor = node.next;
        }

        if self.inodes[entry_idx]
            .as_ref()
            .is_some_and(|e| e.head.is_none())
        {
            self.remove_entry(inode, entry_idx);
        }
    }

    fn remove_entry(&mut self, inode: InodeNumber, entry_idx: usize) {
        let bucket = Self::bucket(inode);
        let mut prev: Option<usize> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            let Some(entry) = self.inodes[idx].as_ref() else {
                return;
            };
            if idx == entry_idx {
                let next = entry.next;
                match prev {
                    Some(prev_idx) => {
                        if let Some(prev_entry) = self.inodes[prev_idx].as_mut() {
                            prev_entry.next = next;
                        }
                    }
                    None => self.buckets[bucket] = next,
                }
                self.inodes[idx] = None;
                self.inode_vacant.push(idx);
                return;
            }
            prev = Some(idx);
            cursor = entry.next;
        }
    }

    /// Number of inodes with at least one dirty block.
    pub fn inode_count(&self) -> usize {
        self.inodes.iter().filter(|e| e.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INO: InodeNumber = InodeNumber(42);

    #[test]
    fn insert_is_idempotent() {
        let mut index = DirtyIndex::new();
        index.insert(INO, BlockNumber(7));
        index.insert(INO, BlockNumber(7));
        index.insert(INO, BlockNumber(9));
        let mut blocks = index.blocks(INO);
        blocks.sort_unstable();
        assert_eq!(blocks, vec![BlockNumber(7), BlockNumber(9)]);
    }

    #[test]
    fn removing_the_last_block_drops_the_inode() {
        let mut index = DirtyIndex::new();
        index.insert(INO, BlockNumber(1));
        index.insert(INO, BlockNumber(2));
        assert_eq!(index.inode_count(), 1);

        index.remove_block(INO, BlockNumber(1));
        assert!(index.contains(INO, BlockNumber(2)));
        assert_eq!(index.inode_count(), 1);

        index.remove_block(INO, BlockNumber(2));
        assert!(!index.contains(INO, BlockNumber(2)));
        assert_eq!(index.inode_count(), 0);
        assert!(index.blocks(INO).is_empty());
    }

    #[test]
    fn inodes_sharing_a_bucket_stay_independent() {
        // 3 and 35 collide with 32 buckets.
        let mut index = DirtyIndex::new();
        index.insert(InodeNumber(3), BlockNumber(10));
        index.insert(InodeNumber(35), BlockNumber(20));
        index.remove_block(InodeNumber(3), BlockNumber(10));
        assert!(index.contains(InodeNumber(35), BlockNumber(20)));
        assert_eq!(index.blocks(InodeNumber(3)), Vec::new());
    }

    #[test]
    fn removing_unknown_entries_is_harmless() {
        let mut index = DirtyIndex::new();
        index.remove_block(INO, BlockNumber(5));
        index.insert(INO, BlockNumber(5));
        index.remove_block(INO, BlockNumber(99));
        assert!(index.contains(INO, BlockNumber(5)));
    }
}
