//! Error kinds surfaced to the VFS caller.

use thiserror::Error;

/// Status codes used throughout the filesystem. Local recovery is
/// limited to undoing bitmap sets when a subsequent block fetch
/// fails; everything else is surfaced to the caller as one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// Bad inode number, malformed name, or wrong vnode type.
    #[error("invalid argument")]
    InvalidArgs,
    /// Operation not implemented for this vnode (e.g. ioctl).
    #[error("not supported")]
    NotSupported,
    /// Name absent, or block missing without allocation.
    #[error("not found")]
    NotFound,
    /// In-memory allocation failure (e.g. block cache exhausted).
    #[error("out of memory")]
    NoMemory,
    /// Bitmap exhaustion: no free blocks or inodes.
    #[error("out of resources")]
    NoResources,
    /// Consistency violation: non-empty directory on unlink,
    /// impossible record length, bitmap/inode disagreement.
    #[error("bad state")]
    BadState,
    /// Inode number beyond the inode table.
    #[error("out of range")]
    OutOfRange,
    /// The name already exists in the directory.
    #[error("already exists")]
    AlreadyExists,
    /// Device failure or malformed on-disk metadata.
    #[error("I/O error")]
    Io,
}

pub type Result<T> = core::result::Result<T, FsError>;
