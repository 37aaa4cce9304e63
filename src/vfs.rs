//! The capability interface handed to the VFS dispatch layer.
//!
//! The VFS layer calls through `VnodeOps` and knows nothing of the
//! implementation behind it. `readdir` fills the caller's buffer with
//! packed records — a `u32` record size, a `u32` type tag, then the
//! NUL-terminated name, padded to 4 bytes — and resumes from an
//! opaque cursor.

use alloc::rc::Rc;

use log::trace;

use crate::dir::DirCookie;
use crate::error::{FsError, Result};
use crate::inode::{Vnode, VnodeType};
use crate::stat::Attr;

/// Header bytes of one packed readdir record.
pub const VDIRENT_HDR: usize = 8;

/// Append one readdir record to `out`; `None` when it does not fit.
pub(crate) fn fill_dirent(out: &mut [u8], name: &[u8], typ: u8) -> Option<usize> {
    let size = (VDIRENT_HDR + name.len() + 1 + 3) & !3;
    if size > out.len() {
        return None;
    }
    out[0..4].copy_from_slice(&(size as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(typ as u32).to_le_bytes());
    out[VDIRENT_HDR..VDIRENT_HDR + name.len()].copy_from_slice(name);
    for b in &mut out[VDIRENT_HDR + name.len()..size] {
        *b = 0;
    }
    Some(size)
}

/// The operations a mounted filesystem exposes per vnode.
pub trait VnodeOps {
    /// The VFS layer's counted reference dropped to zero.
    fn release(&self);
    fn open(&self, flags: u32) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn read(&self, data: &mut [u8], off: u64) -> Result<usize>;
    fn write(&self, data: &[u8], off: u64) -> Result<usize>;
    fn lookup(&self, name: &[u8]) -> Result<Rc<dyn VnodeOps>>;
    fn getattr(&self) -> Result<Attr>;
    fn readdir(&self, cookie: &mut DirCookie, out: &mut [u8]) -> Result<usize>;
    fn create(&self, name: &[u8], vtype: VnodeType) -> Result<Rc<dyn VnodeOps>>;
    fn ioctl(&self, op: u32, input: &[u8], output: &mut [u8]) -> Result<usize>;
    fn unlink(&self, name: &[u8]) -> Result<()>;
}

impl VnodeOps for Vnode {
    fn release(&self) {
        trace!("release() vnode #{}", self.ino());
    }

    fn open(&self, _flags: u32) -> Result<()> {
        trace!("open() vnode #{}", self.ino());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        trace!("close() vnode #{}", self.ino());
        Ok(())
    }

    fn read(&self, data: &mut [u8], off: u64) -> Result<usize> {
        trace!("read() vnode #{} len={} off={}", self.ino(), data.len(), off);
        self.read_at(data, off)
    }

    fn write(&self, data: &[u8], off: u64) -> Result<usize> {
        trace!("write() vnode #{} len={} off={}", self.ino(), data.len(), off);
        self.write_at(data, off)
    }

    fn lookup(&self, name: &[u8]) -> Result<Rc<dyn VnodeOps>> {
        Vnode::lookup(self, name).map(|vn| vn as Rc<dyn VnodeOps>)
    }

    fn getattr(&self) -> Result<Attr> {
        trace!("getattr() vnode #{}", self.ino());
        self.attr()
    }

    fn readdir(&self, cookie: &mut DirCookie, out: &mut [u8]) -> Result<usize> {
        Vnode::readdir(self, cookie, out)
    }

    fn create(&self, name: &[u8], vtype: VnodeType) -> Result<Rc<dyn VnodeOps>> {
        Vnode::create(self, name, vtype).map(|vn| vn as Rc<dyn VnodeOps>)
    }

    fn ioctl(&self, _op: u32, _input: &[u8], _output: &mut [u8]) -> Result<usize> {
        Err(FsError::NotSupported)
    }

    fn unlink(&self, name: &[u8]) -> Result<()> {
        Vnode::unlink(self, name)
    }
}
