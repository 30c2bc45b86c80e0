//! On-block B-tree node record.
//!
//! Layout (little-endian, packed, starting at byte 8 of the block;
//! byte 0 holds the `BtreeNode` tag):
//!
//! ```text
//! u64 block_number; u8 is_leaf; u16 num_keys;
//! u64 keys[MAX_KEYS]; u64 children[MAX_KEYS + 1];
//! u64 parent; u64 left_sibling; u64 right_sibling
//! ```

use loam_error::{LoamError, Result};
use loam_types::{
    BLOCK_SIZE, BlockNumber, BlockTag, MAX_KEYS, read_le_u16, read_le_u64, write_le_u16,
    write_le_u64,
};

/// Node record begins after the tag byte, at an aligned offset.
const NODE_OFFSET: usize = 8;

const OFF_BLOCK: usize = NODE_OFFSET;
const OFF_IS_LEAF: usize = OFF_BLOCK + 8;
const OFF_NUM_KEYS: usize = OFF_IS_LEAF + 1;
const OFF_KEYS: usize = OFF_NUM_KEYS + 2;
const OFF_CHILDREN: usize = OFF_KEYS + MAX_KEYS * 8;
const OFF_PARENT: usize = OFF_CHILDREN + (MAX_KEYS + 1) * 8;
const OFF_LEFT_SIBLING: usize = OFF_PARENT + 8;
const OFF_RIGHT_SIBLING: usize = OFF_LEFT_SIBLING + 8;
const NODE_END: usize = OFF_RIGHT_SIBLING + 8;

fn corrupt(block: BlockNumber, detail: impl Into<String>) -> LoamError {
    LoamError::CorruptTree {
        block: block.0,
        detail: detail.into(),
    }
}

/// One B-tree node. `parent == 0` marks the root; sibling links chain
/// nodes of the same level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub block: BlockNumber,
    pub is_leaf: bool,
    pub num_keys: usize,
    pub keys: [u64; MAX_KEYS],
    pub children: [u64; MAX_KEYS + 1],
    pub parent: u64,
    pub left_sibling: u64,
    pub right_sibling: u64,
}

impl Node {
    #[must_use]
    pub fn new(block: BlockNumber, is_leaf: bool) -> Self {
        Self {
            block,
            is_leaf,
            num_keys: 0,
            keys: [0; MAX_KEYS],
            children: [0; MAX_KEYS + 1],
            parent: 0,
            left_sibling: 0,
            right_sibling: 0,
        }
    }

    /// Serialize into a full block buffer, tag byte included.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(LoamError::InvalidArgument(format!(
                "buffer size mismatch: got {}, expected {BLOCK_SIZE}",
                buf.len()
            )));
        }
        buf[..NODE_OFFSET].fill(0);
        buf[0] = BlockTag::BtreeNode.as_byte();

        let io = |_| LoamError::InvalidArgument("node record exceeds block".to_owned());
        write_le_u64(buf, OFF_BLOCK, self.block.0).map_err(io)?;
        buf[OFF_IS_LEAF] = u8::from(self.is_leaf);
        write_le_u16(buf, OFF_NUM_KEYS, self.num_keys as u16).map_err(io)?;
        for (i, key) in self.keys.iter().enumerate() {
            write_le_u64(buf, OFF_KEYS + i * 8, *key).map_err(io)?;
        }
        for (i, child) in self.children.iter().enumerate() {
            write_le_u64(buf, OFF_CHILDREN + i * 8, *child).map_err(io)?;
        }
        write_le_u64(buf, OFF_PARENT, self.parent).map_err(io)?;
        write_le_u64(buf, OFF_LEFT_SIBLING, self.left_sibling).map_err(io)?;
        write_le_u64(buf, OFF_RIGHT_SIBLING, self.right_sibling).map_err(io)?;
        Ok(())
    }

    /// Decode the node stored in `buf`, validating the tag, identity,
    /// and key ordering. Any violation is `CorruptTree`.
    pub fn decode(block: BlockNumber, buf: &[u8]) -> Result<Self> {
        let parse = |_| corrupt(block, "node record truncated");

        if buf.len() < NODE_END {
            return Err(corrupt(block, "block too small for a node record"));
        }
        if BlockTag::from_byte(buf[0]) != Some(BlockTag::BtreeNode) {
            return Err(corrupt(block, format!("bad block tag {:#04x}", buf[0])));
        }

        let stored = read_le_u64(buf, OFF_BLOCK).map_err(parse)?;
        if stored != block.0 {
            return Err(corrupt(
                block,
                format!("node claims block {stored}, read from {block}"),
            ));
        }

        let is_leaf = match buf[OFF_IS_LEAF] {
            0 => false,
            1 => true,
            other => return Err(corrupt(block, format!("bad leaf flag {other}"))),
        };

        let num_keys = usize::from(read_le_u16(buf, OFF_NUM_KEYS).map_err(parse)?);
        if num_keys > MAX_KEYS {
            return Err(corrupt(block, format!("num_keys {num_keys} out of range")));
        }

        let mut keys = [0_u64; MAX_KEYS];
        for (i, key) in keys.iter_mut().enumerate() {
            *key = read_le_u64(buf, OFF_KEYS + i * 8).map_err(parse)?;
        }
        for window in keys[..num_keys].windows(2) {
            if window[0] >= window[1] {
                return Err(corrupt(block, "keys out of order"));
            }
        }

        let mut children = [0_u64; MAX_KEYS + 1];
        for (i, child) in children.iter_mut().enumerate() {
            *child = read_le_u64(buf, OFF_CHILDREN + i * 8).map_err(parse)?;
        }

        Ok(Self {
            block,
            is_leaf,
            num_keys,
            keys,
            children,
            parent: read_le_u64(buf, OFF_PARENT).map_err(parse)?,
            left_sibling: read_le_u64(buf, OFF_LEFT_SIBLING).map_err(parse)?,
            right_sibling: read_le_u64(buf, OFF_RIGHT_SIBLING).map_err(parse)?,
        })
    }

    /// Child index to descend into for `key`: the smallest `i` with
    /// `key <= keys[i]`, else the rightmost child.
    #[must_use]
    pub fn route(&self, key: u64) -> usize {
        self.keys[..self.num_keys]
            .iter()
            .position(|k| key <= *k)
            .unwrap_or(self.num_keys)
    }

    /// Position of `block` among this internal node's children.
    #[must_use]
    pub fn child_index_of(&self, block: BlockNumber) -> Option<usize> {
        self.children[..=self.num_keys]
            .iter()
            .position(|c| *c == block.0)
    }

    /// Position of `key` in this leaf, if present.
    #[must_use]
    pub fn leaf_position(&self, key: u64) -> Option<usize> {
        self.keys[..self.num_keys].iter().position(|k| *k == key)
    }

    /// Insert `(key, value)` into this leaf at its sorted position.
    /// The leaf must not be full and must not already hold `key`.
    pub fn insert_entry(&mut self, key: u64, value: u64) {
        debug_assert!(self.is_leaf);
        debug_assert!(self.num_keys < MAX_KEYS);
        let pos = self.keys[..self.num_keys]
            .iter()
            .position(|k| key < *k)
            .unwrap_or(self.num_keys);
        for i in (pos..self.num_keys).rev() {
            self.keys[i + 1] = self.keys[i];
            self.children[i + 1] = self.children[i];
        }
        self.keys[pos] = key;
        self.children[pos] = value;
        self.num_keys += 1;
    }

    /// Remove the entry at `pos` from this leaf, shifting higher
    /// entries down.
    pub fn remove_entry(&mut self, pos: usize) {
        debug_assert!(self.is_leaf);
        debug_assert!(pos < self.num_keys);
        for i in pos..self.num_keys - 1 {
            self.keys[i] = self.keys[i + 1];
            self.children[i] = self.children[i + 1];
        }
        self.num_keys -= 1;
        self.keys[self.num_keys] = 0;
        self.children[self.num_keys] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_leaf() -> Node {
        let mut node = Node::new(BlockNumber(9), true);
        node.insert_entry(20, 200);
        node.insert_entry(10, 100);
        node.insert_entry(30, 300);
        node.parent = 3;
        node.left_sibling = 7;
        node.right_sibling = 11;
        node
    }

    #[test]
    fn encode_decode_round_trips() {
        let node = sample_leaf();
        let mut buf = vec![0_u8; BLOCK_SIZE];
        node.encode(&mut buf).unwrap();
        assert_eq!(buf[0], BlockTag::BtreeNode.as_byte());
        let decoded = Node::decode(BlockNumber(9), &buf).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn insert_keeps_sorted_order() {
        let node = sample_leaf();
        assert_eq!(&node.keys[..3], &[10, 20, 30]);
        assert_eq!(&node.children[..3], &[100, 200, 300]);
        assert_eq!(node.leaf_position(20), Some(1));
        assert_eq!(node.leaf_position(25), None);
    }

    #[test]
    fn remove_shifts_down() {
        let mut node = sample_leaf();
        node.remove_entry(1);
        assert_eq!(node.num_keys, 2);
        assert_eq!(&node.keys[..2], &[10, 30]);
        assert_eq!(&node.children[..2], &[100, 300]);
    }

    #[test]
    fn route_picks_the_bounding_child() {
        let mut node = Node::new(BlockNumber(2), false);
        node.num_keys = 2;
        node.keys[0] = 10;
        node.keys[1] = 20;
        node.children[..3].copy_from_slice(&[5, 6, 7]);
        assert_eq!(node.route(3), 0);
        assert_eq!(node.route(10), 0);
        assert_eq!(node.route(11), 1);
        assert_eq!(node.route(20), 1);
        assert_eq!(node.route(21), 2);
        assert_eq!(node.child_index_of(BlockNumber(7)), Some(2));
        assert_eq!(node.child_index_of(BlockNumber(8)), None);
    }

    #[test]
    fn decode_rejects_corruption() {
        let node = sample_leaf();
        let mut buf = vec![0_u8; BLOCK_SIZE];
        node.encode(&mut buf).unwrap();

        // Wrong tag byte.
        let mut bad = buf.clone();
        bad[0] = 0x7F;
        assert!(matches!(
            Node::decode(BlockNumber(9), &bad),
            Err(LoamError::CorruptTree { block: 9, .. })
        ));

        // Identity mismatch.
        assert!(Node::decode(BlockNumber(8), &buf).is_err());

        // Unsorted keys.
        let mut twisted = sample_leaf();
        twisted.keys.swap(0, 2);
        let mut bad = vec![0_u8; BLOCK_SIZE];
        twisted.encode(&mut bad).unwrap();
        assert!(matches!(
            Node::decode(BlockNumber(9), &bad),
            Err(LoamError::CorruptTree { .. })
        ));

        // num_keys beyond capacity.
        let mut bad = buf;
        bad[OFF_NUM_KEYS] = (MAX_KEYS + 1) as u8;
        assert!(Node::decode(BlockNumber(9), &bad).is_err());
    }
}
