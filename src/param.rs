//! Compile-time filesystem parameters.

use core::mem;

/// Block size, the unit of device I/O.
pub const BLOCK_SIZE: usize = 8192;

/// Bits covered by one bitmap block.
pub const BLOCK_BITS: u32 = (BLOCK_SIZE * 8) as u32;

/// On-disk inode record size.
pub const INODE_SIZE: usize = 128;

/// Inode records per inode-table block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 16;

/// Indirect block pointers per inode.
pub const NINDIRECT: usize = 8;

/// Block pointers held by one indirect block.
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / mem::size_of::<u32>();

/// Not possible to have a file block at or past this one
/// due to the limitations of the inode and indirect blocks.
pub const MAX_FILE_BLOCK: u32 = (NDIRECT + NINDIRECT * PTRS_PER_BLOCK) as u32;

/// Root directory i-number. Inode 0 is reserved.
pub const ROOT_INO: u32 = 1;

/// Vnode hash table width.
pub const NBUCKETS: usize = 256;

/// Size of the disk block cache.
pub const NBUF: usize = 32;

/// Inode count chosen by the formatter.
pub const MKFS_INODES: u32 = 32768;

/// Longest directory entry name (namelen is a byte on disk).
pub const MAX_NAME: usize = 255;
