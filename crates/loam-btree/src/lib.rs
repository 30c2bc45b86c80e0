#![forbid(unsafe_code)]
//! Disk-resident B-tree mapping 64-bit keys to 64-bit values.
//!
//! Every node occupies exactly one disk block and is read and mutated
//! through the buffer cache. Nodes reference each other by block number
//! only; there is no in-memory pointer graph.
//!
//! Internal nodes keep `keys[i] = max(subtree children[i])` with one
//! unbounded rightmost child. Leaves store the value for `keys[i]` in
//! `children[i]` and chain into an in-order list through their sibling
//! links.

mod node;
mod tree;

pub use node::Node;
pub use tree::BTree;
