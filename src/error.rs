//! Error kinds for the cache and inode layer.
//!
//! Only [`Inode::create`](crate::fs::inode::Inode::create) and
//! [`Inode::open`](crate::fs::inode::Inode::open) return a `Result`.
//! `read_at`/`write_at` keep a byte-count-returning signature instead:
//! zero means either denied or at EOF, never an error value.

use thiserror::Error;

/// A fatal failure reported by a [`BlockDevice`](crate::device::BlockDevice).
///
/// The cache and inode layer never attempt to recover from one of these;
/// every call site that can observe it propagates or panics. This type
/// exists so an embedder can log a clear message before aborting instead
/// of only ever seeing a generic panic.
#[derive(Debug, Error)]
#[error("block device I/O failure on sector {sector}: {reason}")]
pub struct DeviceError {
    pub sector: u32,
    pub reason: &'static str,
}

/// Errors surfaced by the cache and inode layer.
#[derive(Debug, Error)]
pub enum FsError {
    /// The free map could not satisfy an allocation during `create`.
    #[error("free map exhausted")]
    OutOfSpace,

    /// Offset-to-sector mapping resolved past end-of-file.
    #[error("offset past end of file")]
    NotFound,

    /// A write was attempted while `deny_write_count > 0`.
    #[error("write denied: inode has outstanding deny_write")]
    Denied,

    /// `open` read a sector whose `InodeDisk::magic` did not match
    /// [`INODE_MAGIC`](crate::param::INODE_MAGIC).
    #[error("sector {sector} does not hold a valid inode (bad magic)")]
    BadMagic { sector: u32 },

    /// Propagated from a fallible `BlockDevice`. Fatal; not retried.
    #[error(transparent)]
    Device(#[from] DeviceError),
}
