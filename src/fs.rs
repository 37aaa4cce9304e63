//! The filesystem driver.
//!
//! `Minfs` exclusively owns the block cache, the two bitmap
//! allocators, and the vnode hash; vnodes reach back into it through
//! a weak reference. Mount-time state is rebuilt from the superblock
//! and the persisted bitmaps.
//!
//! Allocation commits in a fixed order: the bitmap block first, then
//! the payload block (inode table or data), then the owning inode.
//! A crash between steps leaves at worst an allocated-but-unused bit,
//! never a payload without its allocation.

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use core::mem;

use array_macro::array;
use log::{error, trace};
use scopeguard::ScopeGuard;
use zerocopy::AsBytes;

use crate::bcache::{Bcache, Buf, PutFlags};
use crate::bitmap::Bitmap;
use crate::dir::{dir_init, hdr_at, DIRENT_HDR};
use crate::error::{FsError, Result};
use crate::inode::{ptr_at, Dinode, Vnode, VnodeType};
use crate::param::{
    BLOCK_BITS, BLOCK_SIZE, INODES_PER_BLOCK, INODE_SIZE, MKFS_INODES, NBUCKETS, PTRS_PER_BLOCK,
    ROOT_INO,
};
use crate::superblock::{FsFlags, Superblock, FS_MAGIC0, FS_MAGIC1, FS_VERSION};

const HASH_BITS: u32 = 8;

/// Tiny FNV-1a mix of an inode number down to a bucket index.
fn ino_hash(ino: u32) -> usize {
    let mut h: u32 = 0x811c_9dc5;
    for b in ino.to_le_bytes().iter() {
        h = (h ^ *b as u32).wrapping_mul(16_777_619);
    }
    (((h >> HASH_BITS) ^ h) & (NBUCKETS as u32 - 1)) as usize
}

pub struct Minfs {
    bc: Bcache,
    info: Superblock,
    block_map: RefCell<Bitmap>,
    inode_map: RefCell<Bitmap>,
    /// Blocks of allocation bitmap on disk.
    abmblks: u32,
    /// Blocks of inode bitmap on disk.
    ibmblks: u32,
    vnode_hash: RefCell<[Vec<Weak<Vnode>>; NBUCKETS]>,
    self_ptr: Weak<Minfs>,
}

impl Minfs {
    fn new(bc: Bcache, info: Superblock) -> Result<Rc<Self>> {
        let blocks = bc.max_block();
        info.check(blocks)?;

        let abmblks = (blocks + BLOCK_BITS - 1) / BLOCK_BITS;
        let ibmblks = (info.inode_count + BLOCK_BITS - 1) / BLOCK_BITS;

        let mut block_map = Bitmap::new(abmblks * BLOCK_BITS);
        let mut inode_map = Bitmap::new(ibmblks * BLOCK_BITS);
        // this keeps the underlying storage a block multiple but
        // ensures we can't allocate beyond the last real block or inode
        block_map.resize(info.block_count);
        inode_map.resize(info.inode_count);

        Ok(Rc::new_cyclic(|weak| Self {
            bc,
            info,
            block_map: RefCell::new(block_map),
            inode_map: RefCell::new(inode_map),
            abmblks,
            ibmblks,
            vnode_hash: RefCell::new(array![_ => Vec::new(); NBUCKETS]),
            self_ptr: weak.clone(),
        }))
    }

    pub fn info(&self) -> &Superblock {
        &self.info
    }

    pub(crate) fn bc(&self) -> &Bcache {
        &self.bc
    }

    fn load_bitmaps(&self) -> Result<()> {
        let mut map = self.block_map.borrow_mut();
        for n in 0..self.abmblks {
            let blk = self.bc.get(self.info.abm_block + n).map_err(|e| {
                error!("minfs: failed reading alloc bitmap");
                e
            })?;
            map.copy_block_from(n, &blk.data()[..]);
        }
        drop(map);
        let mut map = self.inode_map.borrow_mut();
        for n in 0..self.ibmblks {
            let blk = self.bc.get(self.info.ibm_block + n).map_err(|e| {
                error!("minfs: failed reading inode bitmap");
                e
            })?;
            map.copy_block_from(n, &blk.data()[..]);
        }
        Ok(())
    }

    /// Allocate a new data block from the block bitmap and return it
    /// zeroed and pinned, together with its number. A nonzero `hint`
    /// says where to start the search; on failure the search retries
    /// from the beginning.
    pub(crate) fn new_block(&self, hint: u32) -> Result<(Buf, u32)> {
        let mut map = self.block_map.borrow_mut();
        let bno = match map.alloc(hint) {
            Some(bno) => Some(bno),
            None if hint != 0 => map.alloc(0),
            None => None,
        };
        let bno = bno.ok_or(FsError::NoResources)?;
        // undo the set if we cannot commit it
        let map = scopeguard::guard(map, |mut map| map.clr(bno));

        // obtain the block of the alloc bitmap we need
        let abm = self.bc.get(self.info.abm_bblock(bno))?;
        // and the block we're allocating
        let blk = self.bc.get_zero(bno)?;

        // commit the bitmap
        map.copy_block_to(bno / BLOCK_BITS, &mut abm.data_mut()[..]);
        self.bc.put(abm, PutFlags::DIRTY)?;

        let _ = ScopeGuard::into_inner(map);
        Ok((blk, bno))
    }

    /// Return a block to the allocator and commit the owning bitmap
    /// block.
    pub(crate) fn free_block(&self, bno: u32) -> Result<()> {
        let mut map = self.block_map.borrow_mut();
        if !map.get(bno) {
            error!("minfs: freeing free block {}", bno);
            return Err(FsError::BadState);
        }
        map.clr(bno);
        let abm = match self.bc.get(self.info.abm_bblock(bno)) {
            Ok(abm) => abm,
            Err(e) => {
                map.set(bno);
                return Err(e);
            }
        };
        map.copy_block_to(bno / BLOCK_BITS, &mut abm.data_mut()[..]);
        self.bc.put(abm, PutFlags::DIRTY).map_err(|e| {
            map.set(bno);
            e
        })
    }

    /// Allocate an inode number and write `dinode` into the table.
    /// The bitmap block commits before the inode block so a crash
    /// between the two cannot leave a live inode without its bit.
    fn ino_alloc(&self, dinode: &Dinode) -> Result<u32> {
        let mut map = self.inode_map.borrow_mut();
        let ino = map.alloc(0).ok_or(FsError::NoResources)?;
        let map = scopeguard::guard(map, |mut map| map.clr(ino));

        // obtain the block of the inode bitmap we need
        let ibm = self.bc.get(self.info.ibm_bblock(ino))?;
        // and the block of the inode table we need
        let itab = self.bc.get(self.info.iblock(ino))?;

        map.copy_block_to(ino / BLOCK_BITS, &mut ibm.data_mut()[..]);
        let off = Superblock::ioffset(ino);
        itab.data_mut()[off..off + INODE_SIZE].copy_from_slice(dinode.as_bytes());

        self.bc.put(ibm, PutFlags::DIRTY)?;
        self.bc.put(itab, PutFlags::DIRTY)?;

        let _ = ScopeGuard::into_inner(map);
        Ok(ino)
    }

    /// Release an inode: clear its bitmap bit and zero its record.
    pub(crate) fn free_inode(&self, ino: u32) -> Result<()> {
        let mut map = self.inode_map.borrow_mut();
        if !map.get(ino) {
            error!("minfs: freeing free inode {}", ino);
            return Err(FsError::BadState);
        }
        map.clr(ino);
        let ibm = match self.bc.get(self.info.ibm_bblock(ino)) {
            Ok(ibm) => ibm,
            Err(e) => {
                map.set(ino);
                return Err(e);
            }
        };
        map.copy_block_to(ino / BLOCK_BITS, &mut ibm.data_mut()[..]);
        self.bc.put(ibm, PutFlags::DIRTY).map_err(|e| {
            map.set(ino);
            e
        })?;
        drop(map);

        let itab = self.bc.get(self.info.iblock(ino))?;
        let off = Superblock::ioffset(ino);
        itab.data_mut()[off..off + INODE_SIZE].fill(0);
        self.bc.put(itab, PutFlags::DIRTY)
    }

    /// Write a vnode's inode record to its table block. An inode
    /// block that cannot be fetched or committed here means the
    /// filesystem can no longer represent its own state.
    pub(crate) fn sync_inode(&self, ino: u32, dinode: &Dinode) {
        let blk = match self.bc.get(self.info.iblock(ino)) {
            Ok(blk) => blk,
            Err(_) => panic!("minfs: failed to sync vnode #{}", ino),
        };
        let off = Superblock::ioffset(ino);
        blk.data_mut()[off..off + INODE_SIZE].copy_from_slice(dinode.as_bytes());
        if self.bc.put(blk, PutFlags::DIRTY).is_err() {
            panic!("minfs: failed to sync vnode #{}", ino);
        }
    }

    /// Instantiate a vnode from an inode that exists in the
    /// filesystem, reusing the cached one if it is live.
    pub fn get_vnode(&self, ino: u32) -> Result<Rc<Vnode>> {
        if ino < 1 || ino >= self.info.inode_count {
            return Err(FsError::OutOfRange);
        }
        let bucket = ino_hash(ino);
        {
            let buckets = self.vnode_hash.borrow();
            for weak in &buckets[bucket] {
                if let Some(vn) = weak.upgrade() {
                    if vn.ino() == ino {
                        return Ok(vn);
                    }
                }
            }
        }
        let mut dinode = Dinode::zeroed();
        self.bc.read(
            self.info.iblock(ino),
            Superblock::ioffset(ino),
            dinode.as_bytes_mut(),
        )?;
        trace!(
            "get_vnode() #{} {{ magic={:#010x} size={} blks={} }}",
            ino,
            dinode.magic,
            dinode.size,
            dinode.block_count
        );
        let vn = Rc::new(Vnode::new(self.self_ptr.clone(), ino, dinode));
        self.vnode_hash.borrow_mut()[bucket].push(Rc::downgrade(&vn));
        Ok(vn)
    }

    /// Instantiate a vnode with a freshly allocated inode.
    pub fn new_vnode(&self, vtype: VnodeType) -> Result<Rc<Vnode>> {
        let dinode = Dinode::new(vtype);
        let ino = self.ino_alloc(&dinode)?;
        trace!("new_vnode() #{} {{ magic={:#010x} }}", ino, dinode.magic);
        let vn = Rc::new(Vnode::new(self.self_ptr.clone(), ino, dinode));
        self.vnode_hash.borrow_mut()[ino_hash(ino)].push(Rc::downgrade(&vn));
        Ok(vn)
    }

    /// Drop a dying vnode's hash entry. Called from `Vnode`'s drop,
    /// when its strong count has already reached zero.
    pub(crate) fn forget_vnode(&self, ino: u32) {
        self.vnode_hash.borrow_mut()[ino_hash(ino)].retain(|weak| weak.strong_count() > 0);
    }

    /// The root directory vnode.
    pub fn root(&self) -> Result<Rc<Vnode>> {
        self.get_vnode(ROOT_INO)
    }

    /// Flush everything down to the device.
    pub fn sync(&self) -> Result<()> {
        self.bc.flush()
    }

    /// Build an empty filesystem on the device behind `bc`.
    pub fn mkfs(bc: &Bcache) -> Result<()> {
        let blocks = bc.max_block();
        let inodes = MKFS_INODES;

        // determine how many blocks of inodes, allocation bitmap,
        // and inode bitmap there are
        let inoblks = (inodes + INODES_PER_BLOCK as u32 - 1) / INODES_PER_BLOCK as u32;
        let abmblks = (blocks + BLOCK_BITS - 1) / BLOCK_BITS;
        let ibmblks = (inodes + BLOCK_BITS - 1) / BLOCK_BITS;

        let abm_block = 16;
        let ino_block = abm_block + ((abmblks + 8) & !7);
        let info = Superblock {
            magic0: FS_MAGIC0,
            magic1: FS_MAGIC1,
            version: FS_VERSION,
            flags: FsFlags::CLEAN.bits(),
            block_size: BLOCK_SIZE as u32,
            inode_size: INODE_SIZE as u32,
            block_count: blocks,
            inode_count: inodes,
            ibm_block: 8,
            abm_block,
            ino_block,
            dat_block: ino_block + inoblks,
        };
        info.check(blocks)?;
        info.dump();

        let mut abm = Bitmap::new(abmblks * BLOCK_BITS);
        abm.resize(info.block_count);
        let mut ibm = Bitmap::new(ibmblks * BLOCK_BITS);
        ibm.resize(info.inode_count);

        // write the root directory
        let blk = bc.get_zero(info.dat_block)?;
        dir_init(&mut blk.data_mut(), ROOT_INO, ROOT_INO);
        bc.put(blk, PutFlags::DIRTY)?;

        // inode 0 is reserved, inode 1 is the root
        ibm.set(0);
        ibm.set(1);

        // reserve all blocks before the data storage area and the
        // first data block (for the root directory)
        for n in 0..=info.dat_block {
            abm.set(n);
        }

        // write the allocation bitmap
        for n in 0..abmblks {
            let blk = bc.get_zero(info.abm_block + n)?;
            abm.copy_block_to(n, &mut blk.data_mut()[..]);
            bc.put(blk, PutFlags::DIRTY)?;
        }

        // write the inode bitmap
        for n in 0..ibmblks {
            let blk = bc.get_zero(info.ibm_block + n)?;
            ibm.copy_block_to(n, &mut blk.data_mut()[..]);
            bc.put(blk, PutFlags::DIRTY)?;
        }

        // write the (empty) inode table
        for n in 0..inoblks {
            let blk = bc.get_zero(info.ino_block + n)?;
            bc.put(blk, PutFlags::DIRTY)?;
        }

        // set up the root inode
        let blk = bc.get(info.ino_block)?;
        let mut root = Dinode::new(VnodeType::Dir);
        root.size = BLOCK_SIZE as u32;
        root.block_count = 1;
        root.link_count = 2;
        root.dirent_count = 2;
        root.dnum[0] = info.dat_block;
        let off = Superblock::ioffset(ROOT_INO);
        blk.data_mut()[off..off + INODE_SIZE].copy_from_slice(root.as_bytes());
        bc.put(blk, PutFlags::DIRTY)?;

        // the superblock goes last, so a torn format is detectable
        // by the missing magic
        let blk = bc.get_zero(0)?;
        blk.data_mut()[..mem::size_of::<Superblock>()].copy_from_slice(info.as_bytes());
        bc.put(blk, PutFlags::DIRTY)?;
        bc.flush()
    }

    /// Mount the filesystem on the device behind `bc`.
    pub fn mount(bc: Bcache) -> Result<Rc<Minfs>> {
        let mut info = Superblock::zeroed();
        if let Err(e) = bc.read(0, 0, info.as_bytes_mut()) {
            error!("minfs: could not read info block");
            return Err(e);
        }
        let fs = Minfs::new(bc, info)?;
        fs.load_bitmaps()?;
        if let Err(e) = fs.get_vnode(ROOT_INO) {
            error!("minfs: cannot find inode 1");
            return Err(e);
        }
        Ok(fs)
    }

    /// Verify the consistency of the filesystem behind `bc`.
    pub fn check(bc: Bcache) -> Result<()> {
        let fs = Minfs::mount(bc)?;
        fs.fsck()
    }

    fn fsck(&self) -> Result<()> {
        let info = &self.info;
        let block_map = self.block_map.borrow();
        let inode_map = self.inode_map.borrow();

        // everything below the data region is metadata and must be held
        for bno in 0..info.dat_block {
            if !block_map.get(bno) {
                error!("check: metadata block {} not held", bno);
                return Err(FsError::BadState);
            }
        }

        // cross-reference the blocks claimed by every allocated inode
        let mut claimed = Bitmap::new(info.block_count);
        for bno in 0..info.dat_block {
            claimed.set(bno);
        }
        let claim = |claimed: &mut Bitmap, bno: u32| -> Result<()> {
            if bno < info.dat_block || bno >= info.block_count {
                error!("check: block {} outside the data region", bno);
                return Err(FsError::BadState);
            }
            if claimed.get(bno) {
                error!("check: block {} claimed twice", bno);
                return Err(FsError::BadState);
            }
            if !block_map.get(bno) {
                error!("check: block {} in use but not allocated", bno);
                return Err(FsError::BadState);
            }
            claimed.set(bno);
            Ok(())
        };

        for ino in 1..info.inode_count {
            let mut d = Dinode::zeroed();
            self.bc
                .read(info.iblock(ino), Superblock::ioffset(ino), d.as_bytes_mut())?;
            match (inode_map.get(ino), d.vtype()) {
                (false, None) => continue,
                (true, Some(_)) => {}
                (true, None) => {
                    error!("check: inode {} allocated but has no type", ino);
                    return Err(FsError::BadState);
                }
                (false, Some(_)) => {
                    error!("check: inode {} live but not allocated", ino);
                    return Err(FsError::BadState);
                }
            }
            for &bno in d.dnum.iter() {
                if bno != 0 {
                    claim(&mut claimed, bno)?;
                }
            }
            for &ibno in d.inum.iter() {
                if ibno != 0 {
                    claim(&mut claimed, ibno)?;
                    let iblk = self.bc.get(ibno)?;
                    let data = iblk.data();
                    for j in 0..PTRS_PER_BLOCK {
                        let bno = ptr_at(&data, j);
                        if bno != 0 {
                            claim(&mut claimed, bno)?;
                        }
                    }
                }
            }
            if d.vtype() == Some(VnodeType::Dir) {
                self.check_dir(ino, &d, &inode_map)?;
            }
        }

        // every allocated bit in the data region must have an owner
        for bno in info.dat_block..info.block_count {
            if block_map.get(bno) && !claimed.get(bno) {
                error!("check: block {} allocated but unreferenced", bno);
                return Err(FsError::BadState);
            }
        }
        Ok(())
    }

    fn check_dir(&self, ino: u32, d: &Dinode, inode_map: &Bitmap) -> Result<()> {
        if d.link_count < 2 {
            error!("check: dir inode {} linkcount {}", ino, d.link_count);
            return Err(FsError::BadState);
        }
        let mut in_use = 0;
        for &bno in d.dnum.iter() {
            if bno == 0 {
                continue;
            }
            let blk = self.bc.get(bno)?;
            let data = blk.data();
            let mut pos = 0;
            // record lengths must tile the block exactly
            while pos < BLOCK_SIZE {
                let hdr = hdr_at(&data[..], pos).map_err(|_| FsError::BadState)?;
                let rlen = hdr.reclen as usize;
                if rlen < DIRENT_HDR || rlen % 4 != 0 || pos + rlen > BLOCK_SIZE {
                    error!("check: dir inode {} bad reclen {}", ino, rlen);
                    return Err(FsError::BadState);
                }
                if hdr.ino != 0 {
                    if hdr.namelen == 0 || hdr.namelen as usize > rlen - DIRENT_HDR {
                        error!("check: dir inode {} bad namelen {}", ino, hdr.namelen);
                        return Err(FsError::BadState);
                    }
                    if hdr.ino >= self.info.inode_count || !inode_map.get(hdr.ino) {
                        error!(
                            "check: dir inode {} references free inode {}",
                            ino, hdr.ino
                        );
                        return Err(FsError::BadState);
                    }
                    in_use += 1;
                }
                pos += rlen;
            }
        }
        if in_use != d.dirent_count {
            error!(
                "check: dir inode {} holds {} entries, counts {}",
                ino, in_use, d.dirent_count
            );
            return Err(FsError::BadState);
        }
        Ok(())
    }
}

impl fmt::Debug for Minfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Minfs").field("info", &self.info).finish()
    }
}
