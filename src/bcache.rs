//! Block cache.
//!
//! The cache holds copies of disk block contents in pinned buffers.
//! Interface:
//! * To work on a particular disk block, call `get` (or `get_zero`
//!   for a buffer that skips the device read and starts zeroed).
//! * A `Buf` stays pinned until it is released; release with `put`
//!   and `PutFlags::DIRTY` to commit the buffer, or drop it to
//!   release without writing.
//! * At most one holder of a given block at a time.
//!
//! Dirty buffers are written through on `put`, so the order of `put`
//! calls is the order blocks reach the device; the allocators rely on
//! this to commit bitmap blocks before the payload they cover.
//! The cache is the only component that touches the underlying device.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, Ref, RefCell, RefMut};

use bitflags::bitflags;

use crate::dev::BlockDevice;
use crate::error::{FsError, Result};
use crate::param::{BLOCK_SIZE, NBUF};

pub(crate) type BlockData = [u8; BLOCK_SIZE];

bitflags! {
    /// Release flags for `Bcache::put`.
    pub struct PutFlags: u32 {
        const DIRTY = 0x1;
    }
}

struct BufEntry {
    bno: u32,
    pinned: Cell<bool>,
    data: RefCell<Box<BlockData>>,
}

/// A pinned view of one cached block. Dropping a `Buf` releases the
/// pin without writing anything; modified buffers must go back
/// through `Bcache::put` with `PutFlags::DIRTY`.
pub struct Buf {
    entry: Rc<BufEntry>,
}

impl Buf {
    pub fn bno(&self) -> u32 {
        self.entry.bno
    }

    pub fn data(&self) -> Ref<'_, BlockData> {
        Ref::map(self.entry.data.borrow(), |b| &**b)
    }

    pub fn data_mut(&self) -> RefMut<'_, BlockData> {
        RefMut::map(self.entry.data.borrow_mut(), |b| &mut **b)
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        self.entry.pinned.set(false);
    }
}

/// The cache proper: an MRU list of at most `NBUF` buffers over a
/// block device it owns exclusively.
pub struct Bcache {
    dev: RefCell<Box<dyn BlockDevice>>,
    entries: RefCell<Vec<Rc<BufEntry>>>,
}

impl Bcache {
    pub fn new(dev: Box<dyn BlockDevice>) -> Self {
        Self {
            dev: RefCell::new(dev),
            entries: RefCell::new(Vec::new()),
        }
    }

    /// Device capacity in blocks.
    pub fn max_block(&self) -> u32 {
        self.dev.borrow().nblocks()
    }

    /// Return a pinned buffer with the current contents of block `bno`.
    pub fn get(&self, bno: u32) -> Result<Buf> {
        self.get_inner(bno, false)
    }

    /// Return a pinned, zero-filled buffer for block `bno` without
    /// reading the device. The caller is expected to initialise the
    /// block and release it dirty.
    pub fn get_zero(&self, bno: u32) -> Result<Buf> {
        self.get_inner(bno, true)
    }

    fn get_inner(&self, bno: u32, zero: bool) -> Result<Buf> {
        let mut entries = self.entries.borrow_mut();
        if let Some(i) = entries.iter().position(|e| e.bno == bno) {
            let entry = entries.remove(i);
            entries.insert(0, Rc::clone(&entry));
            assert!(!entry.pinned.get(), "bcache: block {} pinned twice", bno);
            entry.pinned.set(true);
            if zero {
                entry.data.borrow_mut().fill(0);
            }
            return Ok(Buf { entry });
        }

        if entries.len() >= NBUF {
            let victim = entries
                .iter()
                .rposition(|e| !e.pinned.get())
                .ok_or(FsError::NoMemory)?;
            entries.remove(victim);
        }

        let entry = Rc::new(BufEntry {
            bno,
            pinned: Cell::new(true),
            data: RefCell::new(Box::new([0; BLOCK_SIZE])),
        });
        if !zero {
            self.dev
                .borrow_mut()
                .read_block(bno, &mut entry.data.borrow_mut()[..])?;
        }
        entries.insert(0, Rc::clone(&entry));
        Ok(Buf { entry })
    }

    /// Synchronous slice copy out of block `bno`, without leaving the
    /// block pinned.
    pub fn read(&self, bno: u32, off: usize, dst: &mut [u8]) -> Result<()> {
        let buf = self.get(bno)?;
        let data = buf.data();
        let src = data
            .get(off..off + dst.len())
            .ok_or(FsError::InvalidArgs)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Release a buffer. `PutFlags::DIRTY` commits the contents to the
    /// device before the pin drops.
    pub fn put(&self, buf: Buf, flags: PutFlags) -> Result<()> {
        if flags.contains(PutFlags::DIRTY) {
            let data = buf.entry.data.borrow();
            self.dev.borrow_mut().write_block(buf.entry.bno, &data[..])?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.dev.borrow_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::MemDisk;

    fn cache(nblocks: u32) -> Bcache {
        Bcache::new(Box::new(MemDisk::new(nblocks)))
    }

    #[test]
    fn put_dirty_writes_through() {
        let disk = MemDisk::new(4);
        let bc = Bcache::new(Box::new(disk.clone()));
        let buf = bc.get_zero(2).unwrap();
        buf.data_mut()[0..4].copy_from_slice(b"mnfs");
        bc.put(buf, PutFlags::DIRTY).unwrap();

        let other = Bcache::new(Box::new(disk));
        let buf = other.get(2).unwrap();
        assert_eq!(&buf.data()[0..4], b"mnfs");
    }

    #[test]
    fn clean_put_discards_nothing_to_disk() {
        let disk = MemDisk::new(4);
        let bc = Bcache::new(Box::new(disk.clone()));
        let buf = bc.get_zero(1).unwrap();
        buf.data_mut()[0] = 0xaa;
        drop(buf);

        let other = Bcache::new(Box::new(disk));
        assert_eq!(other.get(1).unwrap().data()[0], 0);
    }

    #[test]
    fn eviction_skips_pinned() {
        let bc = cache(NBUF as u32 * 2);
        let held = bc.get_zero(0).unwrap();
        for bno in 1..=NBUF as u32 {
            let buf = bc.get(bno).unwrap();
            bc.put(buf, PutFlags::empty()).unwrap();
        }
        // block 0 must still be cached and pinned
        assert_eq!(held.bno(), 0);
        drop(held);
    }

    #[test]
    fn read_copies_slice() {
        let bc = cache(4);
        let buf = bc.get_zero(3).unwrap();
        buf.data_mut()[100..104].copy_from_slice(&[1, 2, 3, 4]);
        bc.put(buf, PutFlags::DIRTY).unwrap();
        let mut out = [0u8; 4];
        bc.read(3, 100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn get_past_device_fails() {
        let bc = cache(2);
        assert!(matches!(bc.get(7), Err(FsError::Io)));
    }

    #[test]
    fn max_block_reports_capacity() {
        assert_eq!(cache(17).max_block(), 17);
    }
}
