//! Fixed-size block I/O over a file-backed store.

use loam_error::{LoamError, Result};
use loam_types::{BLOCK_SIZE, BlockNumber};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, trace};

/// Block-addressed I/O interface.
///
/// Reads and writes copy exactly [`BLOCK_SIZE`] bytes. Durability is
/// promised only after `sync`; resources are released on drop.
pub trait BlockDevice {
    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read one block into `buf`. `buf.len()` MUST equal `BLOCK_SIZE`.
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write one block from `buf`. `buf.len()` MUST equal `BLOCK_SIZE`.
    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_buf(len: usize) -> Result<()> {
    if len != BLOCK_SIZE {
        return Err(LoamError::InvalidArgument(format!(
            "buffer size mismatch: got {len}, expected {BLOCK_SIZE}"
        )));
    }
    Ok(())
}

fn check_block(block: BlockNumber, count: u64) -> Result<()> {
    if block.0 >= count {
        return Err(LoamError::InvalidArgument(format!(
            "block out of range: block={block} block_count={count}"
        )));
    }
    Ok(())
}

/// File-backed block device using positional reads and writes.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_count: u64,
}

impl FileBlockDevice {
    /// Open an existing image. The file length must be a nonzero
    /// multiple of [`BLOCK_SIZE`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let block_size = BLOCK_SIZE as u64;
        if len == 0 || len % block_size != 0 {
            return Err(LoamError::InvalidArgument(format!(
                "image length {len} is not a nonzero multiple of {BLOCK_SIZE}"
            )));
        }
        let block_count = len / block_size;
        debug!(
            target: "loam::device",
            event = "open",
            path = %path.as_ref().display(),
            blocks = block_count
        );
        Ok(Self { file, block_count })
    }

    /// Create and format a fresh image of `total_blocks` blocks.
    ///
    /// Block 0 becomes the allocation bitmap with bits 0..=2 set: the
    /// bitmap itself, the superblock, and the inode bitmap are reserved.
    pub fn create(path: impl AsRef<Path>, total_blocks: u64) -> Result<Self> {
        if total_blocks < 4 {
            return Err(LoamError::InvalidArgument(format!(
                "image needs at least 4 blocks, got {total_blocks}"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(total_blocks * BLOCK_SIZE as u64)?;

        let mut bitmap = [0_u8; BLOCK_SIZE];
        bitmap[0] = 0b0000_0111;
        file.write_all_at(&bitmap, 0)?;
        file.sync_all()?;
        debug!(
            target: "loam::device",
            event = "format",
            path = %path.as_ref().display(),
            blocks = total_blocks
        );
        Ok(Self {
            file,
            block_count: total_blocks,
        })
    }

    fn offset(block: BlockNumber) -> u64 {
        block.0 * BLOCK_SIZE as u64
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        check_buf(buf.len())?;
        check_block(block, self.block_count)?;
        self.file.read_exact_at(buf, Self::offset(block))?;
        trace!(target: "loam::device", event = "read", block = block.0);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()> {
        check_buf(buf.len())?;
        check_block(block, self.block_count)?;
        self.file.write_all_at(buf, Self::offset(block))?;
        trace!(target: "loam::device", event = "write", block = block.0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
