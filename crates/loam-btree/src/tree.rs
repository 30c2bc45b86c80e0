//! Disk-resident B-tree operations.
//!
//! The tree owns nothing but its root block number; every node is
//! reached by descent and every read or write goes through the buffer
//! cache. Splits reserve their blocks from the allocator before any
//! structural change, so allocator exhaustion aborts an insert without
//! partial mutation.

use crate::node::Node;
use loam_alloc::{alloc_block, free_block};
use loam_block::{BlockDevice, BufferCache};
use loam_error::{LoamError, Result};
use loam_types::{BLOCK_SIZE, BlockNumber, InodeNumber, MAX_KEYS, MIN_KEYS};
use std::fmt::Write as _;
use tracing::{debug, trace};

/// Tree metadata blocks are grouped under the zero inode.
const TREE_INODE: InodeNumber = InodeNumber(0);

/// Descent bound; exceeding it means a cycle in the parent/child graph.
const MAX_DEPTH: usize = 64;

fn corrupt(block: BlockNumber, detail: impl Into<String>) -> LoamError {
    LoamError::CorruptTree {
        block: block.0,
        detail: detail.into(),
    }
}

fn take_reserved(reserved: &mut Vec<BlockNumber>) -> Result<BlockNumber> {
    reserved.pop().ok_or(LoamError::NoSpace)
}

/// B-tree keyed by 64-bit integers with 64-bit opaque values.
#[derive(Debug, Clone, Copy)]
pub struct BTree {
    root: BlockNumber,
}

impl BTree {
    /// Allocate a fresh leaf root and bind a tree to it.
    pub fn create(dev: &dyn BlockDevice, cache: &mut BufferCache) -> Result<Self> {
        let root = alloc_block(dev, cache)?;
        let tree = Self { root };
        tree.write_node(dev, cache, &Node::new(root, true))?;
        debug!(target: "loam::btree", event = "create", root = root.0);
        Ok(tree)
    }

    /// Bind a tree to an existing root block.
    #[must_use]
    pub fn open(root: BlockNumber) -> Self {
        Self { root }
    }

    /// The root block number. Invariant across all mutations.
    #[must_use]
    pub fn root(&self) -> BlockNumber {
        self.root
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Find the value stored under `key`.
    pub fn search(&self, dev: &dyn BlockDevice, cache: &mut BufferCache, key: u64) -> Result<u64> {
        let leaf = self.descend_to_leaf(dev, cache, key)?;
        match leaf.leaf_position(key) {
            Some(pos) => Ok(leaf.children[pos]),
            None => Err(LoamError::NotFound(format!("key {key}"))),
        }
    }

    fn descend_to_leaf(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        key: u64,
    ) -> Result<Node> {
        let mut node = self.read_node(dev, cache, self.root)?;
        for _ in 0..MAX_DEPTH {
            if node.is_leaf {
                return Ok(node);
            }
            let child = node.children[node.route(key)];
            if child == 0 {
                return Err(corrupt(node.block, "missing child during descent"));
            }
            node = self.read_node(dev, cache, BlockNumber(child))?;
        }
        Err(corrupt(self.root, "descent exceeded the depth bound"))
    }

    // ── Insertion ───────────────────────────────────────────────────────

    /// Insert `(key, value)`. Re-inserting an existing key overwrites
    /// its value in place.
    pub fn insert(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        key: u64,
        value: u64,
    ) -> Result<()> {
        let mut leaf = self.descend_to_leaf(dev, cache, key)?;
        if let Some(pos) = leaf.leaf_position(key) {
            leaf.children[pos] = value;
            return self.write_node(dev, cache, &leaf);
        }

        let mut split_off = None;
        if leaf.num_keys == MAX_KEYS {
            split_off = Some(self.split_cascade(dev, cache, leaf.block)?);
            leaf = self.descend_to_leaf(dev, cache, key)?;
            debug_assert!(leaf.num_keys < MAX_KEYS);
        }

        leaf.insert_entry(key, value);
        self.write_node(dev, cache, &leaf)?;
        self.reconcile_up(dev, cache, leaf.parent)?;
        // A split leaves its new sibling one short of the minimum until
        // either this insert or a borrow from the split node fills it.
        if let Some(sibling) = split_off {
            self.top_up(dev, cache, sibling)?;
        }
        trace!(target: "loam::btree", event = "insert", key, leaf = leaf.block.0);
        Ok(())
    }

    /// Reserve every block the split cascade will consume, then split
    /// from `block` upward, returning the leaf-level sibling the
    /// cascade created. On allocator exhaustion the reservation is
    /// rolled back and nothing has been mutated.
    fn split_cascade(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        block: BlockNumber,
    ) -> Result<BlockNumber> {
        let mut needed = 0_usize;
        let mut cur = self.read_node(dev, cache, block)?;
        loop {
            if cur.parent == 0 {
                needed += 2;
                break;
            }
            needed += 1;
            let parent = self.read_node(dev, cache, BlockNumber(cur.parent))?;
            if parent.num_keys < MAX_KEYS {
                break;
            }
            cur = parent;
        }

        let mut reserved = Vec::with_capacity(needed);
        for _ in 0..needed {
            match alloc_block(dev, cache) {
                Ok(fresh) => reserved.push(fresh),
                Err(err) => {
                    for unused in reserved.drain(..) {
                        free_block(dev, cache, unused)?;
                    }
                    return Err(err);
                }
            }
        }

        let sibling = self.split_upward(dev, cache, block, &mut reserved)?;
        debug_assert!(reserved.is_empty());
        Ok(sibling)
    }

    fn split_upward(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        block: BlockNumber,
        reserved: &mut Vec<BlockNumber>,
    ) -> Result<BlockNumber> {
        let node = self.read_node(dev, cache, block)?;
        if node.parent == 0 {
            return self.split_root(dev, cache, reserved);
        }

        let parent = self.read_node(dev, cache, BlockNumber(node.parent))?;
        let upper_sibling = if parent.num_keys == MAX_KEYS {
            Some(self.split_upward(dev, cache, parent.block, reserved)?)
        } else {
            None
        };

        // The split above may have moved this node under a new parent.
        let node = self.read_node(dev, cache, block)?;
        let mut parent = self.read_node(dev, cache, BlockNumber(node.parent))?;
        let idx = parent
            .child_index_of(block)
            .ok_or_else(|| corrupt(parent.block, "child missing from recorded parent"))?;
        let sibling = self.split_child(dev, cache, &mut parent, idx, reserved)?;

        // The level above now holds this split's separator, so its
        // halves are complete; equalize them if the new one ran short.
        if let Some(upper) = upper_sibling {
            self.top_up(dev, cache, upper)?;
        }
        Ok(sibling)
    }

    /// Split the full child at `parent.children[idx]`, giving the
    /// parent one separator key and one new child pointer. Returns the
    /// new sibling's block.
    fn split_child(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        parent: &mut Node,
        idx: usize,
        reserved: &mut Vec<BlockNumber>,
    ) -> Result<BlockNumber> {
        debug_assert!(parent.num_keys < MAX_KEYS);
        let mut node = self.read_node(dev, cache, BlockNumber(parent.children[idx]))?;
        debug_assert_eq!(node.num_keys, MAX_KEYS);

        let sib_block = take_reserved(reserved)?;
        let mut sibling = Node::new(sib_block, node.is_leaf);
        let separator = node.keys[MIN_KEYS];

        if node.is_leaf {
            let keep = MIN_KEYS + 1;
            for i in keep..node.num_keys {
                sibling.keys[i - keep] = node.keys[i];
                sibling.children[i - keep] = node.children[i];
            }
            sibling.num_keys = node.num_keys - keep;
            for i in keep..node.num_keys {
                node.keys[i] = 0;
                node.children[i] = 0;
            }
            node.num_keys = keep;
        } else {
            // The key at MIN_KEYS becomes the parent separator; its
            // subtree stays behind as the left half's unbounded child.
            let keep_children = MIN_KEYS + 1;
            let moved = node.num_keys + 1 - keep_children;
            for i in 0..moved {
                sibling.children[i] = node.children[keep_children + i];
            }
            sibling.num_keys = moved - 1;
            for i in 0..sibling.num_keys {
                sibling.keys[i] = node.keys[keep_children + i];
            }
            for i in MIN_KEYS..node.num_keys {
                node.keys[i] = 0;
            }
            for i in keep_children..=node.num_keys {
                node.children[i] = 0;
            }
            node.num_keys = MIN_KEYS;
        }

        sibling.parent = parent.block.0;
        sibling.left_sibling = node.block.0;
        sibling.right_sibling = node.right_sibling;
        if node.right_sibling != 0 {
            let mut after = self.read_node(dev, cache, BlockNumber(node.right_sibling))?;
            after.left_sibling = sibling.block.0;
            self.write_node(dev, cache, &after)?;
        }
        node.right_sibling = sibling.block.0;

        for i in (idx..parent.num_keys).rev() {
            parent.keys[i + 1] = parent.keys[i];
        }
        for i in (idx + 1..=parent.num_keys).rev() {
            parent.children[i + 1] = parent.children[i];
        }
        parent.keys[idx] = separator;
        parent.children[idx + 1] = sibling.block.0;
        parent.num_keys += 1;

        self.write_node(dev, cache, &node)?;
        self.write_node(dev, cache, &sibling)?;
        if !sibling.is_leaf {
            self.reparent_children(dev, cache, &sibling)?;
        }
        self.write_node(dev, cache, parent)?;
        debug!(
            target: "loam::btree",
            event = "split_child",
            node = node.block.0,
            sibling = sibling.block.0,
            separator
        );
        Ok(sibling.block)
    }

    /// Split a full root in place: the root block keeps its identity
    /// and becomes an internal node over two new children. Returns the
    /// right child's block.
    fn split_root(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        reserved: &mut Vec<BlockNumber>,
    ) -> Result<BlockNumber> {
        let mut root = self.read_node(dev, cache, self.root)?;
        debug_assert_eq!(root.num_keys, MAX_KEYS);

        let mut a = Node::new(take_reserved(reserved)?, root.is_leaf);
        let mut b = Node::new(take_reserved(reserved)?, root.is_leaf);
        let separator;

        if root.is_leaf {
            for i in 0..MIN_KEYS {
                a.keys[i] = root.keys[i];
                a.children[i] = root.children[i];
            }
            a.num_keys = MIN_KEYS;
            for i in MIN_KEYS..root.num_keys {
                b.keys[i - MIN_KEYS] = root.keys[i];
                b.children[i - MIN_KEYS] = root.children[i];
            }
            b.num_keys = root.num_keys - MIN_KEYS;
            separator = a.keys[a.num_keys - 1];
        } else {
            let keep_children = MIN_KEYS + 1;
            for i in 0..MIN_KEYS {
                a.keys[i] = root.keys[i];
            }
            for i in 0..keep_children {
                a.children[i] = root.children[i];
            }
            a.num_keys = MIN_KEYS;
            let moved = root.num_keys + 1 - keep_children;
            for i in 0..moved {
                b.children[i] = root.children[keep_children + i];
            }
            b.num_keys = moved - 1;
            for i in 0..b.num_keys {
                b.keys[i] = root.keys[keep_children + i];
            }
            separator = root.keys[MIN_KEYS];
        }

        a.parent = self.root.0;
        b.parent = self.root.0;
        a.right_sibling = b.block.0;
        b.left_sibling = a.block.0;

        root.is_leaf = false;
        root.num_keys = 1;
        root.keys = [0; MAX_KEYS];
        root.keys[0] = separator;
        root.children = [0; MAX_KEYS + 1];
        root.children[0] = a.block.0;
        root.children[1] = b.block.0;

        self.write_node(dev, cache, &a)?;
        self.write_node(dev, cache, &b)?;
        if !a.is_leaf {
            self.reparent_children(dev, cache, &a)?;
            self.reparent_children(dev, cache, &b)?;
        }
        self.write_node(dev, cache, &root)?;
        debug!(
            target: "loam::btree",
            event = "split_root",
            left = a.block.0,
            right = b.block.0,
            separator
        );
        Ok(b.block)
    }

    /// Bring a freshly split-off sibling up to the minimum by borrowing
    /// from the node it split off of.
    ///
    /// By the time this runs the pair holds the whole key population of
    /// the split (plus the separator or pending insert that landed in
    /// one half), so whenever the sibling is short its donor has spare
    /// keys.
    fn top_up(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        block: BlockNumber,
    ) -> Result<()> {
        let mut node = self.read_node(dev, cache, block)?;
        if node.num_keys >= MIN_KEYS || node.parent == 0 {
            return Ok(());
        }
        if node.left_sibling == 0 {
            return Err(corrupt(node.block, "underfull sibling with no donor"));
        }
        let mut left = self.read_node(dev, cache, BlockNumber(node.left_sibling))?;
        if left.num_keys <= MIN_KEYS {
            return Err(corrupt(node.block, "split donor has no spare keys"));
        }

        if node.is_leaf {
            let key = left.keys[left.num_keys - 1];
            let value = left.children[left.num_keys - 1];
            left.remove_entry(left.num_keys - 1);
            node.insert_entry(key, value);
        } else {
            let moved = left.children[left.num_keys];
            left.children[left.num_keys] = 0;
            left.num_keys -= 1;
            left.keys[left.num_keys] = 0;

            for i in (0..=node.num_keys).rev() {
                node.children[i + 1] = node.children[i];
            }
            node.children[0] = moved;
            node.num_keys += 1;
            self.set_parent(dev, cache, moved, node.block)?;
            self.recompute_keys(dev, cache, &mut node)?;
        }
        self.write_node(dev, cache, &left)?;
        self.write_node(dev, cache, &node)?;
        self.reconcile_up(dev, cache, node.parent)?;
        debug!(
            target: "loam::btree",
            event = "split_top_up",
            node = node.block.0,
            donor = left.block.0
        );
        Ok(())
    }

    // ── Deletion ────────────────────────────────────────────────────────

    /// Remove `key`. Absent keys are `NotFound`; emptied nodes return
    /// their blocks to the allocator.
    pub fn delete(&self, dev: &dyn BlockDevice, cache: &mut BufferCache, key: u64) -> Result<()> {
        let mut leaf = self.descend_to_leaf(dev, cache, key)?;
        let Some(pos) = leaf.leaf_position(key) else {
            return Err(LoamError::NotFound(format!("key {key}")));
        };

        if leaf.block == self.root || leaf.num_keys > MIN_KEYS {
            leaf.remove_entry(pos);
            self.write_node(dev, cache, &leaf)?;
            self.reconcile_up(dev, cache, leaf.parent)?;
            trace!(target: "loam::btree", event = "delete", key, leaf = leaf.block.0);
            return Ok(());
        }

        if let Some(donor_parent) = self.borrow_into_leaf(dev, cache, &mut leaf)? {
            let pos = leaf
                .leaf_position(key)
                .ok_or_else(|| corrupt(leaf.block, "borrow displaced the target key"))?;
            leaf.remove_entry(pos);
            self.write_node(dev, cache, &leaf)?;
            self.reconcile_up(dev, cache, leaf.parent)?;
            if donor_parent != leaf.parent {
                self.reconcile_up(dev, cache, donor_parent)?;
            }
            trace!(target: "loam::btree", event = "delete", key, leaf = leaf.block.0);
            return Ok(());
        }

        self.merge_leaf(dev, cache, leaf, pos)?;
        trace!(target: "loam::btree", event = "delete", key, merged = true);
        Ok(())
    }

    /// Move one entry from a sibling with spare keys into `leaf`.
    /// Returns the donor's parent block for separator reconciliation.
    fn borrow_into_leaf(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        leaf: &mut Node,
    ) -> Result<Option<u64>> {
        if leaf.left_sibling != 0 {
            let mut left = self.read_node(dev, cache, BlockNumber(leaf.left_sibling))?;
            if left.num_keys > MIN_KEYS {
                let key = left.keys[left.num_keys - 1];
                let value = left.children[left.num_keys - 1];
                left.remove_entry(left.num_keys - 1);
                leaf.insert_entry(key, value);
                self.write_node(dev, cache, &left)?;
                debug!(
                    target: "loam::btree",
                    event = "borrow_left",
                    leaf = leaf.block.0,
                    donor = left.block.0,
                    key
                );
                return Ok(Some(left.parent));
            }
        }
        if leaf.right_sibling != 0 {
            let mut right = self.read_node(dev, cache, BlockNumber(leaf.right_sibling))?;
            if right.num_keys > MIN_KEYS {
                let key = right.keys[0];
                let value = right.children[0];
                right.remove_entry(0);
                leaf.insert_entry(key, value);
                self.write_node(dev, cache, &right)?;
                debug!(
                    target: "loam::btree",
                    event = "borrow_right",
                    leaf = leaf.block.0,
                    donor = right.block.0,
                    key
                );
                return Ok(Some(right.parent));
            }
        }
        Ok(None)
    }

    /// Fold a minimum-size leaf into a sibling after removing the entry
    /// at `pos`, freeing the emptied block.
    fn merge_leaf(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        mut leaf: Node,
        pos: usize,
    ) -> Result<()> {
        leaf.remove_entry(pos);

        if leaf.left_sibling != 0 {
            let mut left = self.read_node(dev, cache, BlockNumber(leaf.left_sibling))?;
            for i in 0..leaf.num_keys {
                left.keys[left.num_keys + i] = leaf.keys[i];
                left.children[left.num_keys + i] = leaf.children[i];
            }
            left.num_keys += leaf.num_keys;
            left.right_sibling = leaf.right_sibling;
            if leaf.right_sibling != 0 {
                let mut after = self.read_node(dev, cache, BlockNumber(leaf.right_sibling))?;
                after.left_sibling = left.block.0;
                self.write_node(dev, cache, &after)?;
            }
            self.write_node(dev, cache, &left)?;
            debug!(
                target: "loam::btree",
                event = "merge_left",
                freed = leaf.block.0,
                into = left.block.0
            );
            let parent = leaf.parent;
            free_block(dev, cache, leaf.block)?;
            self.remove_child_from_parent(dev, cache, parent, leaf.block)?;
            // Rebalancing above may have moved the survivor; reconcile
            // from its current parent, not the remembered one.
            let survivor_parent = self.read_node(dev, cache, left.block)?.parent;
            self.reconcile_up(dev, cache, survivor_parent)?;
            return Ok(());
        }

        if leaf.right_sibling != 0 {
            let mut right = self.read_node(dev, cache, BlockNumber(leaf.right_sibling))?;
            let shift = leaf.num_keys;
            for i in (0..right.num_keys).rev() {
                right.keys[i + shift] = right.keys[i];
                right.children[i + shift] = right.children[i];
            }
            for i in 0..shift {
                right.keys[i] = leaf.keys[i];
                right.children[i] = leaf.children[i];
            }
            right.num_keys += shift;
            right.left_sibling = leaf.left_sibling;
            self.write_node(dev, cache, &right)?;
            debug!(
                target: "loam::btree",
                event = "merge_right",
                freed = leaf.block.0,
                into = right.block.0
            );
            let parent = leaf.parent;
            free_block(dev, cache, leaf.block)?;
            self.remove_child_from_parent(dev, cache, parent, leaf.block)?;
            let survivor_parent = self.read_node(dev, cache, right.block)?.parent;
            self.reconcile_up(dev, cache, survivor_parent)?;
            return Ok(());
        }

        Err(corrupt(leaf.block, "minimum-size leaf with no siblings"))
    }

    /// Drop `child` from its parent, rebalancing or promoting when the
    /// parent falls below the minimum.
    fn remove_child_from_parent(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        parent_block: u64,
        child: BlockNumber,
    ) -> Result<()> {
        if parent_block == 0 {
            return Err(corrupt(child, "merged node without a parent"));
        }
        let mut parent = self.read_node(dev, cache, BlockNumber(parent_block))?;
        if parent.is_leaf || parent.num_keys == 0 {
            return Err(corrupt(parent.block, "parent cannot give up a child"));
        }
        let idx = parent
            .child_index_of(child)
            .ok_or_else(|| corrupt(parent.block, "freed child missing from parent"))?;

        for i in idx..parent.num_keys {
            parent.children[i] = parent.children[i + 1];
        }
        parent.children[parent.num_keys] = 0;
        if idx < parent.num_keys {
            for i in idx..parent.num_keys - 1 {
                parent.keys[i] = parent.keys[i + 1];
            }
        }
        parent.num_keys -= 1;
        parent.keys[parent.num_keys] = 0;
        self.recompute_keys(dev, cache, &mut parent)?;
        self.write_node(dev, cache, &parent)?;

        if parent.parent == 0 {
            if parent.num_keys == 0 {
                self.promote_root(dev, cache)?;
            }
        } else if parent.num_keys < MIN_KEYS {
            self.rebalance_internal(dev, cache, parent.block)?;
        }
        Ok(())
    }

    /// Restore the minimum on an underfull internal node by borrowing a
    /// child from a sibling or merging with one.
    fn rebalance_internal(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        block: BlockNumber,
    ) -> Result<()> {
        let mut node = self.read_node(dev, cache, block)?;

        if node.left_sibling != 0 {
            let mut left = self.read_node(dev, cache, BlockNumber(node.left_sibling))?;
            if left.num_keys > MIN_KEYS {
                let moved = left.children[left.num_keys];
                left.children[left.num_keys] = 0;
                left.num_keys -= 1;
                left.keys[left.num_keys] = 0;

                for i in (0..=node.num_keys).rev() {
                    node.children[i + 1] = node.children[i];
                }
                node.children[0] = moved;
                node.num_keys += 1;
                self.set_parent(dev, cache, moved, node.block)?;
                self.recompute_keys(dev, cache, &mut node)?;
                self.write_node(dev, cache, &left)?;
                self.write_node(dev, cache, &node)?;
                self.reconcile_up(dev, cache, node.parent)?;
                if left.parent != node.parent {
                    self.reconcile_up(dev, cache, left.parent)?;
                }
                debug!(
                    target: "loam::btree",
                    event = "rebalance_borrow_left",
                    node = node.block.0,
                    moved
                );
                return Ok(());
            }
        }

        if node.right_sibling != 0 {
            let mut right = self.read_node(dev, cache, BlockNumber(node.right_sibling))?;
            if right.num_keys > MIN_KEYS {
                let moved = right.children[0];
                for i in 0..right.num_keys {
                    right.children[i] = right.children[i + 1];
                }
                right.children[right.num_keys] = 0;
                for i in 0..right.num_keys - 1 {
                    right.keys[i] = right.keys[i + 1];
                }
                right.num_keys -= 1;
                right.keys[right.num_keys] = 0;

                node.num_keys += 1;
                node.children[node.num_keys] = moved;
                self.set_parent(dev, cache, moved, node.block)?;
                self.recompute_keys(dev, cache, &mut node)?;
                self.write_node(dev, cache, &right)?;
                self.write_node(dev, cache, &node)?;
                self.reconcile_up(dev, cache, node.parent)?;
                if right.parent != node.parent {
                    self.reconcile_up(dev, cache, right.parent)?;
                }
                debug!(
                    target: "loam::btree",
                    event = "rebalance_borrow_right",
                    node = node.block.0,
                    moved
                );
                return Ok(());
            }
        }

        if node.left_sibling != 0 {
            let mut left = self.read_node(dev, cache, BlockNumber(node.left_sibling))?;
            let base = left.num_keys + 1;
            for i in 0..=node.num_keys {
                left.children[base + i] = node.children[i];
                self.set_parent(dev, cache, node.children[i], left.block)?;
            }
            left.num_keys = base + node.num_keys;
            left.right_sibling = node.right_sibling;
            if node.right_sibling != 0 {
                let mut after = self.read_node(dev, cache, BlockNumber(node.right_sibling))?;
                after.left_sibling = left.block.0;
                self.write_node(dev, cache, &after)?;
            }
            self.recompute_keys(dev, cache, &mut left)?;
            self.write_node(dev, cache, &left)?;
            debug!(
                target: "loam::btree",
                event = "rebalance_merge_left",
                freed = node.block.0,
                into = left.block.0
            );
            let parent = node.parent;
            free_block(dev, cache, node.block)?;
            self.remove_child_from_parent(dev, cache, parent, node.block)?;
            let survivor_parent = self.read_node(dev, cache, left.block)?.parent;
            self.reconcile_up(dev, cache, survivor_parent)?;
            return Ok(());
        }

        if node.right_sibling != 0 {
            let mut right = self.read_node(dev, cache, BlockNumber(node.right_sibling))?;
            let shift = node.num_keys + 1;
            for i in (0..=right.num_keys).rev() {
                right.children[i + shift] = right.children[i];
            }
            for i in 0..shift {
                right.children[i] = node.children[i];
                self.set_parent(dev, cache, node.children[i], right.block)?;
            }
            right.num_keys += shift;
            right.left_sibling = node.left_sibling;
            self.recompute_keys(dev, cache, &mut right)?;
            self.write_node(dev, cache, &right)?;
            debug!(
                target: "loam::btree",
                event = "rebalance_merge_right",
                freed = node.block.0,
                into = right.block.0
            );
            let parent = node.parent;
            free_block(dev, cache, node.block)?;
            self.remove_child_from_parent(dev, cache, parent, node.block)?;
            let survivor_parent = self.read_node(dev, cache, right.block)?.parent;
            self.reconcile_up(dev, cache, survivor_parent)?;
            return Ok(());
        }

        Err(corrupt(node.block, "underfull node with no siblings"))
    }

    /// Collapse a keyless single-child root: the child's contents move
    /// into the root block and the child's block is freed.
    fn promote_root(&self, dev: &dyn BlockDevice, cache: &mut BufferCache) -> Result<()> {
        let root = self.read_node(dev, cache, self.root)?;
        if root.is_leaf || root.num_keys != 0 {
            return Ok(());
        }
        let child_block = root.children[0];
        if child_block == 0 {
            return Err(corrupt(root.block, "keyless root with no child"));
        }

        let child = self.read_node(dev, cache, BlockNumber(child_block))?;
        let mut promoted = child.clone();
        promoted.block = self.root;
        promoted.parent = 0;
        promoted.left_sibling = 0;
        promoted.right_sibling = 0;
        self.write_node(dev, cache, &promoted)?;
        if !promoted.is_leaf {
            self.reparent_children(dev, cache, &promoted)?;
        }
        free_block(dev, cache, BlockNumber(child_block))?;
        debug!(
            target: "loam::btree",
            event = "promote_root",
            freed = child_block,
            root = self.root.0
        );
        Ok(())
    }

    // ── Shared plumbing ─────────────────────────────────────────────────

    fn read_node(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        block: BlockNumber,
    ) -> Result<Node> {
        let buf = cache.get(dev, TREE_INODE, block)?;
        Node::decode(block, buf)
    }

    fn write_node(&self, dev: &dyn BlockDevice, cache: &mut BufferCache, node: &Node) -> Result<()> {
        let mut buf = [0_u8; BLOCK_SIZE];
        node.encode(&mut buf)?;
        cache.write(dev, &buf, TREE_INODE, node.block)
    }

    /// Largest key in the subtree rooted at `block`.
    fn find_maximum(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        block: u64,
    ) -> Result<u64> {
        let mut cursor = block;
        for _ in 0..MAX_DEPTH {
            let node = self.read_node(dev, cache, BlockNumber(cursor))?;
            if node.is_leaf {
                if node.num_keys == 0 {
                    return Err(corrupt(node.block, "empty node in maximum scan"));
                }
                return Ok(node.keys[node.num_keys - 1]);
            }
            cursor = node.children[node.num_keys];
            if cursor == 0 {
                return Err(corrupt(node.block, "missing rightmost child"));
            }
        }
        Err(corrupt(BlockNumber(block), "maximum scan exceeded the depth bound"))
    }

    /// Set `keys[i] = max(subtree children[i])` on an internal node.
    fn recompute_keys(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        node: &mut Node,
    ) -> Result<()> {
        for i in 0..node.num_keys {
            if node.children[i] == 0 {
                return Err(corrupt(node.block, "missing child during key recompute"));
            }
            node.keys[i] = self.find_maximum(dev, cache, node.children[i])?;
        }
        Ok(())
    }

    /// Reconcile separator keys from `from` up to the root.
    fn reconcile_up(&self, dev: &dyn BlockDevice, cache: &mut BufferCache, from: u64) -> Result<()> {
        let mut cursor = from;
        for _ in 0..MAX_DEPTH {
            if cursor == 0 {
                return Ok(());
            }
            let mut node = self.read_node(dev, cache, BlockNumber(cursor))?;
            self.recompute_keys(dev, cache, &mut node)?;
            self.write_node(dev, cache, &node)?;
            cursor = node.parent;
        }
        Err(corrupt(BlockNumber(from), "parent chain exceeded the depth bound"))
    }

    fn set_parent(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        child: u64,
        parent: BlockNumber,
    ) -> Result<()> {
        if child == 0 {
            return Err(corrupt(parent, "null child pointer"));
        }
        let mut node = self.read_node(dev, cache, BlockNumber(child))?;
        node.parent = parent.0;
        self.write_node(dev, cache, &node)
    }

    fn reparent_children(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        node: &Node,
    ) -> Result<()> {
        for i in 0..=node.num_keys {
            self.set_parent(dev, cache, node.children[i], node.block)?;
        }
        Ok(())
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    /// Render the tree, one node per line, indented by depth.
    pub fn dump(&self, dev: &dyn BlockDevice, cache: &mut BufferCache) -> Result<String> {
        let mut out = String::new();
        self.dump_node(dev, cache, self.root.0, 0, &mut out)?;
        Ok(out)
    }

    fn dump_node(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        block: u64,
        depth: usize,
        out: &mut String,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(corrupt(BlockNumber(block), "dump exceeded the depth bound"));
        }
        let node = self.read_node(dev, cache, BlockNumber(block))?;
        let pad = "  ".repeat(depth);
        if node.is_leaf {
            let entries: Vec<String> = (0..node.num_keys)
                .map(|i| format!("{}={}", node.keys[i], node.children[i]))
                .collect();
            let _ = writeln!(out, "{pad}leaf b{block}: {}", entries.join(" "));
        } else {
            let _ = writeln!(out, "{pad}node b{block}: keys={:?}", &node.keys[..node.num_keys]);
            for i in 0..=node.num_keys {
                self.dump_node(dev, cache, node.children[i], depth + 1, out)?;
            }
        }
        Ok(())
    }

    /// Verify the structural invariants of the whole tree: parent
    /// pointers, separators, occupancy bounds, and uniform leaf depth.
    pub fn check(&self, dev: &dyn BlockDevice, cache: &mut BufferCache) -> Result<()> {
        let mut leaf_depth = None;
        self.check_node(dev, cache, self.root.0, 0, 0, &mut leaf_depth)?;
        Ok(())
    }

    fn check_node(
        &self,
        dev: &dyn BlockDevice,
        cache: &mut BufferCache,
        block: u64,
        expected_parent: u64,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<u64> {
        if depth > MAX_DEPTH {
            return Err(corrupt(BlockNumber(block), "check exceeded the depth bound"));
        }
        let node = self.read_node(dev, cache, BlockNumber(block))?;
        if node.parent != expected_parent {
            return Err(corrupt(
                node.block,
                format!("parent {} recorded, {expected_parent} expected", node.parent),
            ));
        }
        let is_root = block == self.root.0;
        if !is_root && node.num_keys < MIN_KEYS {
            return Err(corrupt(
                node.block,
                format!("underfull node with {} keys", node.num_keys),
            ));
        }

        if node.is_leaf {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(corrupt(node.block, "leaves at unequal depths"));
                }
                Some(_) => {}
            }
            if node.num_keys == 0 {
                if is_root {
                    return Ok(0);
                }
                return Err(corrupt(node.block, "empty non-root leaf"));
            }
            return Ok(node.keys[node.num_keys - 1]);
        }

        if node.num_keys == 0 {
            return Err(corrupt(node.block, "keyless internal node"));
        }
        for i in 0..node.num_keys {
            let child_max =
                self.check_node(dev, cache, node.children[i], block, depth + 1, leaf_depth)?;
            if child_max != node.keys[i] {
                return Err(corrupt(
                    node.block,
                    format!(
                        "separator {} does not bound child max {child_max}",
                        node.keys[i]
                    ),
                ));
            }
        }
        let last = self.check_node(
            dev,
            cache,
            node.children[node.num_keys],
            block,
            depth + 1,
            leaf_depth,
        )?;
        if last <= node.keys[node.num_keys - 1] {
            return Err(corrupt(node.block, "rightmost subtree is not greater"));
        }
        Ok(last)
    }
}
