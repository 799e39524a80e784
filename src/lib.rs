//! A buffered block cache and multi-level inode layer for a small
//! educational file system, in the shape of Pintos's `filesys/cache.c`
//! and `filesys/inode.c`: fixed-capacity clock-replacement caching with
//! write-behind and read-ahead, sitting under direct/indirect/double-
//! indirect inode records, over pluggable block-device, free-map, and
//! scheduler collaborators.
//!
//! Everything an embedder needs to mount a file system lives behind
//! [`FileSystem`]; the individual layers ([`cache`], [`fs::inode`]) are
//! public for callers that want finer-grained control or want to test
//! against a fake [`device::BlockDevice`] or [`scheduler::Scheduler`].

pub mod cache;
pub mod device;
pub mod error;
pub mod fs;
pub mod freemap;
pub mod param;
pub mod scheduler;

pub use cache::Cache;
pub use device::{BlockDevice, MemBlockDevice, SectorBuf, SectorId};
pub use error::{DeviceError, FsError};
pub use freemap::{BitmapFreeMap, FreeMap};
pub use fs::{FileSystem, Inode, InodeDisk, InodeTable};
pub use scheduler::{Scheduler, ThreadScheduler};
