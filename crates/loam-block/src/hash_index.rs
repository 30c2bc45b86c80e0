//! Chained map from block number to resident cache slot.

use loam_types::{BlockNumber, HASHMAP_SIZE};

#[derive(Debug)]
struct ChainNode {
    block: BlockNumber,
    slot: usize,
    next: Option<usize>,
}

/// Fixed-bucket chained hash table; hash = block number mod bucket count.
///
/// Callers guarantee a lookup-miss before insert, so duplicate keys never
/// occur. Chain nodes live in a slab with an internal vacancy list.
#[derive(Debug)]
pub(crate) struct HashIndex {
    buckets: [Option<usize>; HASHMAP_SIZE],
    nodes: Vec<Option<ChainNode>>,
    vacant: Vec<usize>,
    len: usize,
}

impl HashIndex {
    pub fn new() -> Self {
        Self {
            buckets: [None; HASHMAP_SIZE],
            nodes: Vec::new(),
            vacant: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn bucket(block: BlockNumber) -> usize {
        (block.0 % HASHMAP_SIZE as u64) as usize
    }

    pub fn lookup(&self, block: BlockNumber) -> Option<usize> {
        let mut cursor = self.buckets[Self::bucket(block)];
        while let Some(idx) = cursor {
            let node = self.nodes[idx].as_ref()?;
            if node.block == block {
                return Some(node.slot);
            }
            cursor = node.next;
        }
        None
    }

    /// Prepend a mapping to its bucket chain.
    pub fn insert(&mut self, block: BlockNumber, slot: usize) {
        debug_assert!(self.lookup(block).is_none(), "duplicate insert for {block}");
        let bucket = Self::bucket(block);
        let node = ChainNode {
            block,
            slot,
            next: self.buckets[bucket],
        };
        let idx = if let Some(idx) = self.vacant.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        };
        self.buckets[bucket] = Some(idx);
        self.len += 1;
    }

    /// Unlink the unique node for `block`, returning its slot index.
    pub fn remove(&mut self, block: BlockNumber) -> Option<usize> {
        let bucket = Self::bucket(block);
        let mut prev: Option<usize> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            let node = self.nodes[idx].as_ref()?;
            if node.block == block {
                let next = node.next;
                match prev {
                    Some(prev_idx) => {
                        if let Some(prev_node) = self.nodes[prev_idx].as_mut() {
                            prev_node.next = next;
                        }
                    }
                    None => self.buckets[bucket] = next,
                }
                let slot = self.nodes[idx].take().map(|n| n.slot);
                self.vacant.push(idx);
                self.len -= 1;
                return slot;
            }
            prev = Some(idx);
            cursor = node.next;
        }
        None
    }
}
