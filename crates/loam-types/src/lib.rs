#![forbid(unsafe_code)]
//! Shared identifiers, on-disk layout constants, and little-endian field
//! codecs for the loam storage engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of one disk block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Maximum keys per B-tree node. Controls the branching factor.
pub const MAX_KEYS: usize = 4;

/// Minimum keys per non-root B-tree node.
pub const MIN_KEYS: usize = MAX_KEYS / 2;

/// Bucket count for the cache's chained hash structures.
pub const HASHMAP_SIZE: usize = 32;

/// Block 0: the allocation bitmap (bit i set means block i allocated).
pub const BITMAP_BLOCK: BlockNumber = BlockNumber(0);

/// Block 1: superblock, reserved.
pub const SUPER_BLOCK: BlockNumber = BlockNumber(1);

/// Block 2: inode bitmap, reserved.
pub const INODE_BITMAP_BLOCK: BlockNumber = BlockNumber(2);

/// First block available to the allocator's callers.
pub const FIRST_DATA_BLOCK: BlockNumber = BlockNumber(3);

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u64);

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeNumber(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-block type tag stored as the first byte of a block.
///
/// Only `Data` blocks participate in per-inode dirty tracking. The
/// allocation bitmap in block 0 stores bitmap bits at byte 0; with bit 0
/// permanently set its first byte never decodes to `Data`, so the bitmap
/// needs no tag region of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockTag {
    Data = 0,
    BtreeNode = 1,
    Bitmap = 2,
    Inode = 3,
    Super = 4,
}

impl BlockTag {
    /// Decode a tag from a raw byte value.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Data),
            1 => Some(Self::BtreeNode),
            2 => Some(Self::Bitmap),
            3 => Some(Self::Inode),
            4 => Some(Self::Super),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether a block starting with `byte` is a data block.
    #[must_use]
    pub fn is_data(byte: u8) -> bool {
        Self::from_byte(byte) == Some(Self::Data)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_by_value() {
        for tag in [
            BlockTag::Data,
            BlockTag::BtreeNode,
            BlockTag::Bitmap,
            BlockTag::Inode,
            BlockTag::Super,
        ] {
            assert_eq!(BlockTag::from_byte(tag.as_byte()), Some(tag));
        }
        assert_eq!(BlockTag::from_byte(0xFF), None);
        assert!(BlockTag::is_data(0));
        assert!(!BlockTag::is_data(1));
        assert!(!BlockTag::is_data(0x37));
    }

    #[test]
    fn le_codecs_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u64(&mut buf, 3, 0xDEAD_BEEF_0BAD_F00D).unwrap();
        assert_eq!(read_le_u64(&buf, 3).unwrap(), 0xDEAD_BEEF_0BAD_F00D);
        write_le_u16(&mut buf, 14, 0xA55A).unwrap();
        assert_eq!(read_le_u16(&buf, 14).unwrap(), 0xA55A);
    }

    #[test]
    fn short_reads_are_rejected() {
        let buf = [0_u8; 4];
        assert!(matches!(
            read_le_u64(&buf, 0),
            Err(ParseError::InsufficientData { needed: 8, .. })
        ));
        assert!(read_le_u16(&buf, 3).is_err());
        assert!(write_le_u64(&mut [0_u8; 4], 0, 1).is_err());
    }

    #[test]
    fn min_keys_is_half_of_max() {
        assert_eq!(MIN_KEYS, MAX_KEYS / 2);
        assert!(MAX_KEYS >= 2);
    }
}
