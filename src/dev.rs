//! The block device contract assumed of the driver below the cache.

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::error::{FsError, Result};
use crate::param::BLOCK_SIZE;

/// A device addressed in whole blocks of `BLOCK_SIZE` bytes.
///
/// The block cache is the only consumer; everything above it goes
/// through cached buffers. `read_block`/`write_block` transfer exactly
/// one block and fail with `FsError::Io` on any device error.
pub trait BlockDevice {
    fn read_block(&mut self, bno: u32, buf: &mut [u8]) -> Result<()>;
    fn write_block(&mut self, bno: u32, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Device capacity in blocks.
    fn nblocks(&self) -> u32;
}

/// An in-memory block device backed by a shared byte image.
///
/// Clones share the same image, so a formatted disk can be unmounted
/// and remounted through a fresh handle. Used by tests and tools.
#[derive(Clone)]
pub struct MemDisk {
    image: Rc<RefCell<Vec<u8>>>,
    nblocks: u32,
}

impl MemDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            image: Rc::new(RefCell::new(vec![0; nblocks as usize * BLOCK_SIZE])),
            nblocks,
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&mut self, bno: u32, buf: &mut [u8]) -> Result<()> {
        let off = bno as usize * BLOCK_SIZE;
        let image = self.image.borrow();
        let src = image.get(off..off + BLOCK_SIZE).ok_or(FsError::Io)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_block(&mut self, bno: u32, buf: &[u8]) -> Result<()> {
        let off = bno as usize * BLOCK_SIZE;
        let mut image = self.image.borrow_mut();
        let dst = image.get_mut(off..off + BLOCK_SIZE).ok_or(FsError::Io)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn nblocks(&self) -> u32 {
        self.nblocks
    }
}
