//! Directories.
//!
//! A directory's data block holds a stream of variable-length
//! records laid end to end: a fixed header (`ino`, `reclen`,
//! `namelen`, `type`) followed by `namelen` bytes of name. Records
//! are 4-byte aligned and the last record covers all remaining space
//! in the block, so record lengths always sum to exactly
//! `BLOCK_SIZE`. An `ino` of zero marks an empty slot.
//!
//! Lookup, append and unlink all ride on one traversal engine,
//! `dir_for_each`, which walks the records and asks a callback what
//! to do at each one. Appending sub-divides an in-use record when its
//! tail has room; unlinking converts a record back into an empty
//! slot. Traversal validates every record length before trusting it,
//! so a corrupted block terminates the scan instead of walking off
//! the map.

use alloc::rc::Rc;

use log::{error, trace};

use crate::bcache::{BlockData, PutFlags};
use crate::error::{FsError, Result};
use crate::inode::{Vnode, VnodeType, TYPE_DIR};
use crate::param::{BLOCK_SIZE, MAX_NAME};
use crate::vfs::fill_dirent;

/// Fixed directory record header size.
pub const DIRENT_HDR: usize = 8;

/// Fixed header of one directory record, little-endian on disk,
/// followed by `namelen` bytes of name.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirentHdr {
    /// Referenced inode; zero marks an empty slot.
    pub ino: u32,
    /// Record length including name and padding, a multiple of 4.
    pub reclen: u16,
    pub namelen: u8,
    pub typ: u8,
}

/// Aligned record length for a name of `namelen` bytes.
pub const fn dirent_size(namelen: usize) -> usize {
    (DIRENT_HDR + namelen + 3) & !3
}

/// Arguments threaded through a directory traversal.
struct DirArgs<'a> {
    name: &'a [u8],
    ino: u32,
    typ: u8,
    reclen: usize,
    /// Set by the unlink callback; released by the caller once the
    /// parent's record and inode have been committed.
    child: Option<Rc<Vnode>>,
}

impl<'a> DirArgs<'a> {
    fn new(name: &'a [u8]) -> Self {
        Self {
            name,
            ino: 0,
            typ: 0,
            reclen: 0,
            child: None,
        }
    }
}

enum Step {
    Next,
    Done,
    Save,
    SaveSync,
}

pub(crate) fn hdr_at(data: &[u8], pos: usize) -> Result<DirentHdr> {
    let b = data.get(pos..pos + DIRENT_HDR).ok_or(FsError::Io)?;
    Ok(DirentHdr {
        ino: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        reclen: u16::from_le_bytes([b[4], b[5]]),
        namelen: b[6],
        typ: b[7],
    })
}

fn put_record(rec: &mut [u8], hdr: &DirentHdr, name: &[u8]) {
    rec[0..4].copy_from_slice(&hdr.ino.to_le_bytes());
    rec[4..6].copy_from_slice(&hdr.reclen.to_le_bytes());
    rec[6] = hdr.namelen;
    rec[7] = hdr.typ;
    rec[DIRENT_HDR..DIRENT_HDR + name.len()].copy_from_slice(name);
}

fn cb_find(_vn: &Vnode, rec: &mut [u8], hdr: &DirentHdr, args: &mut DirArgs<'_>) -> Result<Step> {
    if hdr.ino != 0
        && hdr.namelen as usize == args.name.len()
        && &rec[DIRENT_HDR..DIRENT_HDR + args.name.len()] == args.name
    {
        args.ino = hdr.ino;
        args.typ = hdr.typ;
        Ok(Step::Done)
    } else {
        Ok(Step::Next)
    }
}

/// The caller rejects unlink of "." and "..".
fn cb_unlink(vn: &Vnode, rec: &mut [u8], hdr: &DirentHdr, args: &mut DirArgs<'_>) -> Result<Step> {
    if hdr.ino == 0
        || hdr.namelen as usize != args.name.len()
        || &rec[DIRENT_HDR..DIRENT_HDR + args.name.len()] != args.name
    {
        return Ok(Step::Next);
    }
    let child = vn.fs()?.get_vnode(hdr.ino)?;
    {
        let mut d = child.inode.borrow_mut();
        if d.vtype() == Some(VnodeType::Dir) {
            if d.dirent_count != 2 {
                // more than "." and "..": not empty, cannot unlink
                return Err(FsError::BadState);
            }
            if d.link_count != 2 {
                error!(
                    "minfs: directory ino#{} linkcount {}",
                    child.ino(),
                    d.link_count
                );
                return Err(FsError::BadState);
            }
            d.link_count = 0;
        } else {
            d.link_count -= 1;
        }
    }
    child.sync();
    // blocks are reclaimed when the last reference to the child goes
    args.child = Some(child);

    // convert the record to an empty slot
    rec[0..4].copy_from_slice(&0u32.to_le_bytes());
    {
        let mut d = vn.inode.borrow_mut();
        d.dirent_count -= 1;
        d.seq_num += 1;
    }
    Ok(Step::SaveSync)
}

fn cb_append(vn: &Vnode, rec: &mut [u8], hdr: &DirentHdr, args: &mut DirArgs<'_>) -> Result<Step> {
    let mut at = 0;
    let mut reclen = hdr.reclen;
    if hdr.ino == 0 {
        // empty slot: do we fit?
        if args.reclen > hdr.reclen as usize {
            return Ok(Step::Next);
        }
    } else {
        // filled slot: can we sub-divide the tail?
        let used = dirent_size(hdr.namelen as usize);
        if used > hdr.reclen as usize {
            error!("minfs: bad reclen {} < {}", hdr.reclen, used);
            return Err(FsError::Io);
        }
        let extra = hdr.reclen as usize - used;
        if extra < args.reclen {
            return Ok(Step::Next);
        }
        // shrink the existing record and claim the remainder
        rec[4..6].copy_from_slice(&(used as u16).to_le_bytes());
        at = used;
        reclen = extra as u16;
    }
    let hdr = DirentHdr {
        ino: args.ino,
        reclen,
        namelen: args.name.len() as u8,
        typ: args.typ,
    };
    put_record(&mut rec[at..], &hdr, args.name);
    vn.inode.borrow_mut().dirent_count += 1;
    Ok(Step::SaveSync)
}

/// Write the initial contents of a directory data block: a "."
/// record, a ".." record, and a final empty record covering the rest
/// of the block.
pub(crate) fn dir_init(data: &mut BlockData, ino_self: u32, ino_parent: u32) {
    const DE0_SIZE: usize = dirent_size(1);
    const DE1_SIZE: usize = dirent_size(2);
    put_record(
        data,
        &DirentHdr {
            ino: ino_self,
            reclen: DE0_SIZE as u16,
            namelen: 1,
            typ: TYPE_DIR,
        },
        b".",
    );
    put_record(
        &mut data[DE0_SIZE..],
        &DirentHdr {
            ino: ino_parent,
            reclen: DE1_SIZE as u16,
            namelen: 2,
            typ: TYPE_DIR,
        },
        b"..",
    );
    put_record(
        &mut data[DE0_SIZE + DE1_SIZE..],
        &DirentHdr {
            ino: 0,
            reclen: (BLOCK_SIZE - DE0_SIZE - DE1_SIZE) as u16,
            namelen: 0,
            typ: 0,
        },
        b"",
    );
}

impl Vnode {
    /// Walk every record of the directory, handing each one to `f`.
    /// Returns `NotFound` when the walk exhausts the directory
    /// without `f` settling on a record.
    fn dir_for_each<F>(&self, args: &mut DirArgs<'_>, mut f: F) -> Result<()>
    where
        F: FnMut(&Vnode, &mut [u8], &DirentHdr, &mut DirArgs<'_>) -> Result<Step>,
    {
        let fs = self.fs()?;
        let nblocks = self.inode.borrow().block_count;
        for n in 0..nblocks {
            let blk = match self.get_block(n, false)? {
                Some(blk) => blk,
                None => {
                    error!("minfs: dir #{} missing block {}", self.ino, n);
                    return Err(FsError::NotFound);
                }
            };

            let step = (|| -> Result<Option<Step>> {
                let mut data = blk.data_mut();
                let mut size = BLOCK_SIZE;
                let mut pos = 0;
                while size > DIRENT_HDR {
                    let hdr = hdr_at(&data[..], pos)?;
                    let rlen = hdr.reclen as usize;
                    if rlen > size || rlen % 4 != 0 || rlen < DIRENT_HDR {
                        error!("minfs: dir #{} bad reclen {} / {}", self.ino, rlen, size);
                        return Err(FsError::Io);
                    }
                    if hdr.ino != 0
                        && (hdr.namelen == 0 || hdr.namelen as usize > rlen - DIRENT_HDR)
                    {
                        error!("minfs: dir #{} bad namelen {} / {}", self.ino, hdr.namelen, rlen);
                        return Err(FsError::Io);
                    }
                    match f(self, &mut data[pos..pos + rlen], &hdr, args)? {
                        Step::Next => {}
                        step => return Ok(Some(step)),
                    }
                    pos += rlen;
                    size -= rlen;
                }
                Ok(None)
            })();

            match step {
                Err(e) => {
                    drop(blk);
                    return Err(e);
                }
                Ok(Some(Step::Done)) => {
                    drop(blk);
                    return Ok(());
                }
                Ok(Some(Step::Save)) => {
                    fs.bc().put(blk, PutFlags::DIRTY)?;
                    return Ok(());
                }
                Ok(Some(Step::SaveSync)) => {
                    // the block goes back first, then the inode
                    fs.bc().put(blk, PutFlags::DIRTY)?;
                    self.sync();
                    return Ok(());
                }
                Ok(Some(Step::Next)) | Ok(None) => drop(blk),
            }
        }
        Err(FsError::NotFound)
    }

    fn check_dir_op(&self, name: &[u8]) -> Result<()> {
        if !self.is_dir() {
            error!("minfs: not a directory");
            return Err(FsError::NotSupported);
        }
        if name.is_empty() || name.len() > MAX_NAME || name.contains(&b'/') {
            return Err(FsError::InvalidArgs);
        }
        Ok(())
    }

    /// Resolve `name` to a vnode.
    pub fn lookup(&self, name: &[u8]) -> Result<Rc<Vnode>> {
        trace!("lookup() dir #{}", self.ino);
        self.check_dir_op(name)?;
        let mut args = DirArgs::new(name);
        self.dir_for_each(&mut args, cb_find)?;
        self.fs()?.get_vnode(args.ino)
    }

    /// Create `name` in this directory, minting a fresh inode.
    pub fn create(&self, name: &[u8], vtype: VnodeType) -> Result<Rc<Vnode>> {
        trace!("create() dir #{}", self.ino);
        self.check_dir_op(name)?;
        let fs = self.fs()?;

        // ensure the name is not already present
        let mut args = DirArgs::new(name);
        match self.dir_for_each(&mut args, cb_find) {
            Ok(()) => return Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }

        // mint a new inode and vnode for it
        let vn = fs.new_vnode(vtype)?;

        // add a directory entry for the new child
        args.ino = vn.ino();
        args.typ = vtype.dirent_type();
        args.reclen = dirent_size(name.len());
        if let Err(e) = self.dir_for_each(&mut args, cb_append) {
            error!("minfs: create: dir append failed: {}", e);
            // let the fresh inode be reclaimed when `vn` drops
            vn.inode.borrow_mut().link_count = 0;
            // a full first block means no room, not a missing name
            return Err(if e == FsError::NotFound {
                FsError::NoResources
            } else {
                e
            });
        }
        // the directory changed shape: invalidate readdir cursors
        self.inode.borrow_mut().seq_num += 1;
        self.sync();

        if vtype == VnodeType::Dir {
            let (blk, bno) = match fs.new_block(0) {
                Ok(v) => v,
                Err(_) => panic!("minfs: failed to create directory"),
            };
            dir_init(&mut blk.data_mut(), vn.ino(), self.ino);
            if fs.bc().put(blk, PutFlags::DIRTY).is_err() {
                panic!("minfs: failed to create directory");
            }
            {
                let mut d = vn.inode.borrow_mut();
                d.dnum[0] = bno;
                d.block_count = 1;
                d.dirent_count = 2;
                d.size = BLOCK_SIZE as u32;
                d.link_count = 2;
            }
            vn.sync();
        }
        Ok(vn)
    }

    /// Remove `name` from this directory. A directory child must be
    /// empty (exactly its "." and ".." records).
    pub fn unlink(&self, name: &[u8]) -> Result<()> {
        trace!("unlink() dir #{}", self.ino);
        self.check_dir_op(name)?;
        if name == b"." || name == b".." {
            return Err(FsError::InvalidArgs);
        }
        let mut args = DirArgs::new(name);
        self.dir_for_each(&mut args, cb_unlink)
        // args drops here, releasing the child after the parent's
        // record and inode have been committed
    }

    /// Fill `out` with packed readdir records, resuming from
    /// `cookie`. Returns the bytes filled; zero means end of
    /// directory or a poisoned cursor.
    pub fn readdir(&self, cookie: &mut DirCookie, out: &mut [u8]) -> Result<usize> {
        if !self.is_dir() {
            return Err(FsError::NotSupported);
        }
        let seq = self.inode.borrow().seq_num;
        let (mut idx, mut sz) = if cookie.used {
            if cookie.poisoned {
                return Ok(0);
            }
            if cookie.seqno != seq {
                // directory has been modified; stop returning entries
                cookie.poisoned = true;
                return Ok(0);
            }
            (cookie.index, cookie.size)
        } else {
            (0, BLOCK_SIZE as u32)
        };

        let mut filled = 0;
        'blocks: loop {
            let blk = match self.get_block(idx, false) {
                Ok(Some(blk)) => blk,
                Ok(None) | Err(FsError::OutOfRange) => break,
                Err(e) => return Err(e),
            };
            let data = blk.data();
            // advance to the old position if continuing from before
            let mut pos = BLOCK_SIZE - sz as usize;
            while sz as usize >= DIRENT_HDR {
                let hdr = match hdr_at(&data[..], pos) {
                    Ok(hdr) => hdr,
                    Err(_) => {
                        cookie.poison();
                        return Err(FsError::Io);
                    }
                };
                let rlen = hdr.reclen as usize;
                if rlen > sz as usize
                    || rlen % 4 != 0
                    || rlen < DIRENT_HDR
                    || hdr.namelen as usize > rlen - DIRENT_HDR
                {
                    cookie.poison();
                    return Err(FsError::Io);
                }
                if hdr.ino != 0 {
                    let name = &data[pos + DIRENT_HDR..pos + DIRENT_HDR + hdr.namelen as usize];
                    match fill_dirent(&mut out[filled..], name, hdr.typ) {
                        Some(n) => filled += n,
                        // out of output space: save our place mid-block
                        None => break 'blocks,
                    }
                }
                sz -= hdr.reclen as u32;
                pos += rlen;
            }
            drop(data);
            drop(blk);
            idx += 1;
            sz = BLOCK_SIZE as u32;
        }

        cookie.used = true;
        cookie.index = idx;
        cookie.size = sz;
        cookie.seqno = seq;
        Ok(filled)
    }
}

/// Opaque readdir cursor. Starts at the beginning when zeroed; a
/// cursor that observes a directory mutation is poisoned and yields
/// nothing from then on.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirCookie {
    used: bool,
    poisoned: bool,
    index: u32,
    size: u32,
    seqno: u32,
}

impl DirCookie {
    pub fn new() -> Self {
        Self::default()
    }

    fn poison(&mut self) {
        self.used = true;
        self.poisoned = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirent_size_is_aligned() {
        assert_eq!(dirent_size(0), 8);
        assert_eq!(dirent_size(1), 12);
        assert_eq!(dirent_size(4), 12);
        assert_eq!(dirent_size(5), 16);
        assert_eq!(dirent_size(255), 264);
    }

    #[test]
    fn init_block_covers_whole_block() {
        let mut data = [0u8; BLOCK_SIZE];
        dir_init(&mut data, 1, 1);

        let mut pos = 0;
        let mut total = 0usize;
        let mut in_use = 0;
        while pos < BLOCK_SIZE {
            let hdr = hdr_at(&data[..], pos).unwrap();
            assert_eq!(hdr.reclen as usize % 4, 0);
            if hdr.ino != 0 {
                in_use += 1;
            }
            total += hdr.reclen as usize;
            pos += hdr.reclen as usize;
        }
        assert_eq!(total, BLOCK_SIZE);
        assert_eq!(in_use, 2);

        let first = hdr_at(&data[..], 0).unwrap();
        assert_eq!(first.ino, 1);
        assert_eq!(first.namelen, 1);
        assert_eq!(&data[DIRENT_HDR..DIRENT_HDR + 1], b".");
        let second = hdr_at(&data[..], first.reclen as usize).unwrap();
        assert_eq!(second.ino, 1);
        assert_eq!(
            &data[first.reclen as usize + DIRENT_HDR..first.reclen as usize + DIRENT_HDR + 2],
            b".."
        );
    }
}
