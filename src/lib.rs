//! minfs: a small block-based on-disk filesystem.
//!
//! The filesystem is built in layers, leaves first:
//!   + Block cache: pinned-buffer cache over a raw block device.
//!   + Bitmaps: allocators for disk blocks and inodes.
//!   + Inodes: fixed-size records with direct and single-indirect
//!     block pointers, packed into an on-disk table.
//!   + Directories: inodes whose data blocks hold a stream of
//!     variable-length records.
//!   + Driver: mount, format, and the vnode operations handed to the
//!     VFS dispatch layer above.
//!
//! The crate assumes exclusive ownership of the device for the
//! duration of a mount and runs single-threaded; the surrounding VFS
//! layer is expected to serialise operations. Writes are best-effort
//! ordered (bitmap block first, then payload, then the owning inode);
//! there is no journal.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod bcache;
mod bitmap;
mod dev;
mod dir;
mod error;
mod fs;
mod inode;
mod param;
mod stat;
mod superblock;
mod vfs;

pub use bcache::{Bcache, Buf, PutFlags};
pub use bitmap::Bitmap;
pub use dev::{BlockDevice, MemDisk};
pub use dir::{dirent_size, DirCookie, DirentHdr};
pub use error::{FsError, Result};
pub use fs::Minfs;
pub use inode::{Dinode, Vnode, VnodeType, TYPE_DIR, TYPE_FILE};
pub use param::*;
pub use stat::Attr;
pub use superblock::{FsFlags, Superblock};
pub use vfs::{VnodeOps, VDIRENT_HDR};
