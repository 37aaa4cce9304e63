//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! record holds its type tag, size, link count, and the list of data
//! blocks: `NDIRECT` direct pointers plus `NINDIRECT` indirect blocks
//! of `PTRS_PER_BLOCK` further pointers each.
//!
//! The records are packed `INODES_PER_BLOCK` to a block starting at
//! `sb.ino_block`; an inode's number is its position in that table.
//! Inode 0 is reserved and inode 1 is the root directory.
//!
//! A `Vnode` is the in-memory projection of one inode, owned by the
//! filesystem's vnode cache; the disk image is authoritative once
//! synced. The VFS layer holds counted references, and when the last
//! one drops on an inode with no remaining links, the vnode releases
//! every block the inode claims and clears its bitmap bit.

use alloc::rc::{Rc, Weak};
use core::cell::RefCell;
use core::cmp;
use core::fmt;
use core::mem;

use log::error;
use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{AsBytes, FromBytes};

use crate::bcache::{BlockData, Buf, PutFlags};
use crate::error::{FsError, Result};
use crate::fs::Minfs;
use crate::param::{
    BLOCK_SIZE, INODE_SIZE, MAX_FILE_BLOCK, NDIRECT, NINDIRECT, PTRS_PER_BLOCK,
};
use crate::stat::Attr;

/// Directory entry type tag for directories.
pub const TYPE_DIR: u8 = 4;
/// Directory entry type tag for regular files.
pub const TYPE_FILE: u8 = 8;

/// Inode magic: the low byte carries the type tag.
const MAGIC_BASE: u32 = 0x5649_4e00;
pub const MAGIC_DIR: u32 = MAGIC_BASE | TYPE_DIR as u32;
pub const MAGIC_FILE: u32 = MAGIC_BASE | TYPE_FILE as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    File,
    Dir,
}

impl VnodeType {
    pub const fn dirent_type(self) -> u8 {
        match self {
            VnodeType::File => TYPE_FILE,
            VnodeType::Dir => TYPE_DIR,
        }
    }

    pub const fn magic(self) -> u32 {
        MAGIC_BASE | self.dirent_type() as u32
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            MAGIC_FILE => Some(VnodeType::File),
            MAGIC_DIR => Some(VnodeType::Dir),
            _ => None,
        }
    }
}

/// On-disk inode record.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    /// Type tag; zero means the record is free.
    pub magic: u32,
    /// Size in bytes.
    pub size: u32,
    /// Data blocks used, including indirect blocks.
    pub block_count: u32,
    pub link_count: u32,
    /// Bumped on every directory mutation; stale readdir cursors
    /// compare against it.
    pub seq_num: u32,
    /// In-use directory records (directories only).
    pub dirent_count: u32,
    pub dnum: [u32; NDIRECT],
    pub inum: [u32; NINDIRECT],
    rsvd: [u32; 2],
}

const_assert_eq!(mem::size_of::<Dinode>(), INODE_SIZE);
const_assert!(BLOCK_SIZE % INODE_SIZE == 0);

impl Dinode {
    pub const fn zeroed() -> Self {
        Self {
            magic: 0,
            size: 0,
            block_count: 0,
            link_count: 0,
            seq_num: 0,
            dirent_count: 0,
            dnum: [0; NDIRECT],
            inum: [0; NINDIRECT],
            rsvd: [0; 2],
        }
    }

    pub fn new(vtype: VnodeType) -> Self {
        let mut d = Self::zeroed();
        d.magic = vtype.magic();
        d.link_count = 1;
        d
    }

    pub fn vtype(&self) -> Option<VnodeType> {
        VnodeType::from_magic(self.magic)
    }
}

/// Block pointer `j` of an indirect block, little-endian on disk.
pub(crate) fn ptr_at(data: &BlockData, j: usize) -> u32 {
    let b = &data[j * 4..j * 4 + 4];
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn set_ptr_at(data: &mut BlockData, j: usize, bno: u32) {
    data[j * 4..j * 4 + 4].copy_from_slice(&bno.to_le_bytes());
}

/// In-memory projection of one inode.
pub struct Vnode {
    pub(crate) fs: Weak<Minfs>,
    pub(crate) ino: u32,
    pub(crate) inode: RefCell<Dinode>,
}

impl Vnode {
    pub(crate) fn new(fs: Weak<Minfs>, ino: u32, inode: Dinode) -> Self {
        Self {
            fs,
            ino,
            inode: RefCell::new(inode),
        }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn is_dir(&self) -> bool {
        self.inode.borrow().vtype() == Some(VnodeType::Dir)
    }

    pub fn attr(&self) -> Result<Attr> {
        let d = self.inode.borrow();
        Ok(Attr {
            ino: self.ino,
            vtype: d.vtype().ok_or(FsError::BadState)?,
            link_count: d.link_count,
            size: d.size as u64,
            blocks: d.block_count,
        })
    }

    /// The owning filesystem. Fails only if the mount was dropped
    /// while the caller still held the vnode.
    pub(crate) fn fs(&self) -> Result<Rc<Minfs>> {
        self.fs.upgrade().ok_or(FsError::BadState)
    }

    /// Write the inode record back to its table block. Must follow
    /// every change to a field that lives on disk. An unreadable
    /// inode block here is unrecoverable.
    pub(crate) fn sync(&self) {
        let fs = match self.fs.upgrade() {
            Some(fs) => fs,
            None => return,
        };
        fs.sync_inode(self.ino, &self.inode.borrow());
    }

    /// Obtain the `n`th data block of this vnode, allocating it if
    /// `alloc` is set. `Ok(None)` means the block does not exist and
    /// allocation was not requested.
    pub(crate) fn get_block(&self, n: u32, alloc: bool) -> Result<Option<Buf>> {
        let fs = self.fs()?;
        let hint = 0;

        // direct blocks are simple: is there an entry in dnum[]?
        if (n as usize) < NDIRECT {
            let bno = self.inode.borrow().dnum[n as usize];
            if bno == 0 {
                if !alloc {
                    return Ok(None);
                }
                let (blk, bno) = fs.new_block(hint)?;
                {
                    let mut d = self.inode.borrow_mut();
                    d.dnum[n as usize] = bno;
                    d.block_count += 1;
                }
                self.sync();
                return Ok(Some(blk));
            }
            return fs.bc().get(bno).map(Some);
        }

        // for indirect blocks, adjust past the direct range and split
        // into the index of the indirect block and the entry inside it
        let n = n as usize - NDIRECT;
        let i = n / PTRS_PER_BLOCK;
        let j = n % PTRS_PER_BLOCK;
        if i >= NINDIRECT {
            return Err(FsError::OutOfRange);
        }

        let mut idirty = false;
        let ibno = self.inode.borrow().inum[i];
        let iblk = if ibno == 0 {
            if !alloc {
                return Ok(None);
            }
            let (iblk, ibno) = fs.new_block(0)?;
            {
                let mut d = self.inode.borrow_mut();
                d.inum[i] = ibno;
                d.block_count += 1;
            }
            idirty = true;
            iblk
        } else {
            fs.bc().get(ibno).map_err(|e| {
                error!("minfs: cannot read indirect block @{}", ibno);
                e
            })?
        };

        let bno = ptr_at(&iblk.data(), j);
        let result = if bno == 0 {
            if alloc {
                match fs.new_block(hint) {
                    Ok((blk, bno)) => {
                        set_ptr_at(&mut iblk.data_mut(), j, bno);
                        self.inode.borrow_mut().block_count += 1;
                        idirty = true;
                        Ok(Some(blk))
                    }
                    Err(e) => Err(e),
                }
            } else {
                Ok(None)
            }
        } else {
            fs.bc().get(bno).map(Some)
        };

        // release the indirect block, committing if we changed it,
        // and bring the inode up to date as well
        if idirty {
            fs.bc().put(iblk, PutFlags::DIRTY)?;
            self.sync();
        } else {
            drop(iblk);
        }
        result
    }

    /// Read from the vnode at byte offset `off`. Reads are clipped to
    /// the end of the file; blocks the file never wrote read as
    /// zeroes.
    pub fn read_at(&self, data: &mut [u8], off: u64) -> Result<usize> {
        let size = self.inode.borrow().size as u64;
        if off >= size {
            return Ok(0);
        }
        let mut len = cmp::min(data.len() as u64, size - off) as usize;

        let mut n = (off / BLOCK_SIZE as u64) as u32;
        let mut adjust = (off % BLOCK_SIZE as u64) as usize;
        let mut tot = 0;
        while len > 0 && n < MAX_FILE_BLOCK {
            let xfer = cmp::min(len, BLOCK_SIZE - adjust);
            match self.get_block(n, false)? {
                Some(blk) => {
                    data[tot..tot + xfer].copy_from_slice(&blk.data()[adjust..adjust + xfer])
                }
                None => data[tot..tot + xfer].fill(0),
            }
            adjust = 0;
            len -= xfer;
            tot += xfer;
            n += 1;
        }
        Ok(tot)
    }

    /// Write to the vnode at byte offset `off`, allocating blocks on
    /// demand. Stops short at `MAX_FILE_BLOCK` blocks or when the
    /// device runs out of space; the returned count reflects the
    /// truncation.
    pub fn write_at(&self, data: &[u8], off: u64) -> Result<usize> {
        let fs = self.fs()?;
        let mut len = data.len();
        let mut n = (off / BLOCK_SIZE as u64) as u32;
        let mut adjust = (off % BLOCK_SIZE as u64) as usize;
        let mut tot = 0;
        while len > 0 && n < MAX_FILE_BLOCK {
            let xfer = cmp::min(len, BLOCK_SIZE - adjust);
            let blk = match self.get_block(n, true) {
                Ok(Some(blk)) => blk,
                Ok(None) => break,
                Err(e) => {
                    if tot == 0 {
                        return Err(e);
                    }
                    break;
                }
            };
            blk.data_mut()[adjust..adjust + xfer].copy_from_slice(&data[tot..tot + xfer]);
            fs.bc().put(blk, PutFlags::DIRTY)?;
            adjust = 0;
            len -= xfer;
            tot += xfer;
            n += 1;
        }

        if tot > 0 && off + tot as u64 > self.inode.borrow().size as u64 {
            self.inode.borrow_mut().size = (off + tot as u64) as u32;
            self.sync();
        }
        Ok(tot)
    }

    /// Return every block the inode claims to the allocator and free
    /// the inode itself. Runs when the last reference to an unlinked
    /// vnode drops, so a block that fails to free is noted and
    /// skipped; the remaining blocks and the inode still come back
    /// rather than leaking on the first error.
    fn reclaim(&mut self, fs: &Rc<Minfs>) -> Result<()> {
        let mut result = Ok(());
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                result = Err(e);
            }
        };
        let d = self.inode.get_mut();
        for bno in d.dnum.iter_mut() {
            if *bno != 0 {
                note(fs.free_block(*bno));
                *bno = 0;
            }
        }
        for ibno in d.inum.iter_mut() {
            if *ibno != 0 {
                match fs.bc().get(*ibno) {
                    Ok(iblk) => {
                        let data = iblk.data();
                        for j in 0..PTRS_PER_BLOCK {
                            let bno = ptr_at(&data, j);
                            if bno != 0 {
                                note(fs.free_block(bno));
                            }
                        }
                    }
                    // the entries are unreachable; free what we can
                    Err(e) => note(Err(e)),
                }
                note(fs.free_block(*ibno));
                *ibno = 0;
            }
        }
        d.size = 0;
        d.block_count = 0;
        note(fs.free_inode(self.ino));
        result
    }
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.inode.borrow();
        f.debug_struct("Vnode")
            .field("ino", &self.ino)
            .field("magic", &d.magic)
            .field("size", &d.size)
            .finish()
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        let fs = match self.fs.upgrade() {
            Some(fs) => fs,
            None => return,
        };
        fs.forget_vnode(self.ino);
        let d = self.inode.get_mut();
        if d.vtype().is_some() && d.link_count == 0 {
            if let Err(e) = self.reclaim(&fs) {
                error!("minfs: failed to reclaim inode #{}: {}", self.ino, e);
            }
        }
    }
}
