//! Tunables fixed by the on-disk format and the cache's sizing.
//!
//! Collected here, `pub const`, the way the rest of this lineage of
//! educational kernels keeps every such knob in one `param` module
//! instead of scattering magic numbers through the code that uses them.

/// Width of one device sector, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of slots in the buffered cache.
pub const CACHE_CAPACITY: usize = 64;

/// Direct data-sector pointers stored in an [`InodeDisk`](crate::fs::inode::InodeDisk).
///
/// Chosen, together with [`INDIRECT_N`], so that `size_of::<InodeDisk>() ==
/// SECTOR_SIZE` exactly and `DIRECT_N + INDIRECT_N + INDIRECT_N * INDIRECT_N`
/// covers a generously large file.
pub const DIRECT_N: usize = 120;

/// SectorIds per indirection block (`SECTOR_SIZE / size_of::<u32>()`).
pub const INDIRECT_N: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Maximum file size this layout can address, in sectors.
pub const MAX_FILE_SECTORS: usize = DIRECT_N + INDIRECT_N + INDIRECT_N * INDIRECT_N;

/// Fixed constant identifying a valid [`InodeDisk`](crate::fs::inode::InodeDisk).
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Ticks per second of the abstract [`Scheduler`](crate::scheduler::Scheduler) clock.
pub const TIMER_HZ: u64 = 100;

/// The periodic writer sleeps this many ticks between flushes.
pub const WRITE_BEHIND_PERIOD_TICKS: u64 = 4 * TIMER_HZ;
