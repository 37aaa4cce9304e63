use crate::inode::VnodeType;

/// Attribute record returned by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: u32,
    pub vtype: VnodeType,
    pub link_count: u32,
    pub size: u64,
    /// Data blocks used, including indirect blocks.
    pub blocks: u32,
}
