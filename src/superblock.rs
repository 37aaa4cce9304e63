//! The on-disk info block describing the filesystem layout.
//!
//! Disk layout:
//! ```text
//! block 0                     : superblock
//! blocks [ibm_block, +ibmblks): inode bitmap
//! blocks [abm_block, +abmblks): block bitmap
//! blocks [ino_block, +inoblks): inode table (packed)
//! blocks [dat_block, end)     : data region
//! ```
//!
//! The formatter computes the layout and writes the superblock last,
//! so a torn format is detectable by the missing magic.

use core::mem;

use bitflags::bitflags;
use log::{error, info};
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{FsError, Result};
use crate::param::{BLOCK_BITS, BLOCK_SIZE, INODES_PER_BLOCK, INODE_SIZE};

pub const FS_MAGIC0: u32 = 0x4d49_4e46;
pub const FS_MAGIC1: u32 = 0x2153_4621;
pub const FS_VERSION: u32 = 0x0000_0001;

bitflags! {
    /// Superblock flags word.
    pub struct FsFlags: u32 {
        const CLEAN = 0x0001;
    }
}

/// Persisted at block 0, padded with zeroes to a full block.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Superblock {
    /// Must be FS_MAGIC0.
    pub magic0: u32,
    /// Must be FS_MAGIC1.
    pub magic1: u32,
    pub version: u32,
    pub flags: u32,
    pub block_size: u32,
    pub inode_size: u32,
    /// Size of the filesystem image (blocks).
    pub block_count: u32,
    pub inode_count: u32,
    /// First block of the inode bitmap.
    pub ibm_block: u32,
    /// First block of the block (allocation) bitmap.
    pub abm_block: u32,
    /// First block of the inode table.
    pub ino_block: u32,
    /// First block of the data region.
    pub dat_block: u32,
}

const_assert!(mem::size_of::<Superblock>() <= BLOCK_SIZE);

impl Superblock {
    pub const fn zeroed() -> Self {
        Self {
            magic0: 0,
            magic1: 0,
            version: 0,
            flags: 0,
            block_size: 0,
            inode_size: 0,
            block_count: 0,
            inode_count: 0,
            ibm_block: 0,
            abm_block: 0,
            ino_block: 0,
            dat_block: 0,
        }
    }

    /// Validate the info block against a device of `max` blocks.
    pub fn check(&self, max: u32) -> Result<()> {
        if self.magic0 != FS_MAGIC0 || self.magic1 != FS_MAGIC1 {
            error!("minfs: bad magic");
            return Err(FsError::InvalidArgs);
        }
        if self.version != FS_VERSION {
            error!("minfs: bad version {:08x}", self.version);
            return Err(FsError::InvalidArgs);
        }
        if self.block_size != BLOCK_SIZE as u32 || self.inode_size != INODE_SIZE as u32 {
            error!(
                "minfs: bsz/isz {}/{} unsupported",
                self.block_size, self.inode_size
            );
            return Err(FsError::InvalidArgs);
        }
        if self.block_count > max {
            error!("minfs: too large for device");
            return Err(FsError::InvalidArgs);
        }
        // the three metadata regions and the data region must be laid
        // out in order, inside the image
        if !(0 < self.ibm_block
            && self.ibm_block < self.abm_block
            && self.abm_block < self.ino_block
            && self.ino_block < self.dat_block
            && self.dat_block <= self.block_count)
        {
            error!("minfs: bad layout");
            return Err(FsError::InvalidArgs);
        }
        Ok(())
    }

    pub fn dump(&self) {
        info!("minfs: blocks:  {:10} (size {})", self.block_count, self.block_size);
        info!("minfs: inodes:  {:10} (size {})", self.inode_count, self.inode_size);
        info!("minfs: inode bitmap @ {:10}", self.ibm_block);
        info!("minfs: alloc bitmap @ {:10}", self.abm_block);
        info!("minfs: inode table  @ {:10}", self.ino_block);
        info!("minfs: data blocks  @ {:10}", self.dat_block);
    }

    /// Block of the inode table containing inode `ino`.
    pub fn iblock(&self, ino: u32) -> u32 {
        self.ino_block + ino / INODES_PER_BLOCK as u32
    }

    /// Byte offset of inode `ino` inside its table block.
    pub fn ioffset(ino: u32) -> usize {
        ino as usize % INODES_PER_BLOCK * INODE_SIZE
    }

    /// Block of the inode bitmap holding the bit for inode `ino`.
    pub fn ibm_bblock(&self, ino: u32) -> u32 {
        self.ibm_block + ino / BLOCK_BITS
    }

    /// Block of the allocation bitmap holding the bit for block `bno`.
    pub fn abm_bblock(&self, bno: u32) -> u32 {
        self.abm_block + bno / BLOCK_BITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            magic0: FS_MAGIC0,
            magic1: FS_MAGIC1,
            version: FS_VERSION,
            flags: FsFlags::CLEAN.bits(),
            block_size: BLOCK_SIZE as u32,
            inode_size: INODE_SIZE as u32,
            block_count: 1024,
            inode_count: 32768,
            ibm_block: 8,
            abm_block: 16,
            ino_block: 24,
            dat_block: 536,
        }
    }

    #[test]
    fn accepts_valid_info() {
        assert_eq!(sample().check(1024), Ok(()));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut info = sample();
        info.magic0 ^= 1;
        assert_eq!(info.check(1024), Err(FsError::InvalidArgs));
        let mut info = sample();
        info.version = 9;
        assert_eq!(info.check(1024), Err(FsError::InvalidArgs));
    }

    #[test]
    fn rejects_oversized_image() {
        assert_eq!(sample().check(1000), Err(FsError::InvalidArgs));
    }

    #[test]
    fn rejects_out_of_order_layout() {
        let mut info = sample();
        info.abm_block = 4;
        assert_eq!(info.check(1024), Err(FsError::InvalidArgs));
        let mut info = sample();
        info.dat_block = 2000;
        assert_eq!(info.check(2048), Err(FsError::InvalidArgs));
    }

    #[test]
    fn locates_inodes_and_bits() {
        let info = sample();
        assert_eq!(info.iblock(0), 24);
        assert_eq!(info.iblock(64), 25);
        assert_eq!(Superblock::ioffset(1), INODE_SIZE);
        assert_eq!(info.abm_bblock(65536), 17);
        assert_eq!(info.ibm_bblock(3), 8);
    }
}
