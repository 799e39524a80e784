//! Ties the cache and inode layer together into a single mount-to-
//! shutdown context value, constructed once and passed to every
//! operation instead of being reached for through globals.

pub mod inode;

use std::sync::Arc;

pub use inode::{Inode, InodeDisk, InodeTable};

use crate::cache::Cache;
use crate::device::BlockDevice;
use crate::freemap::FreeMap;
use crate::scheduler::Scheduler;

/// A mounted file system: the cache, the free map, and the table of
/// currently-open inodes, all sharing one [`BlockDevice`].
///
/// Dropping a `FileSystem` does not itself flush the cache; call
/// [`Self::shutdown`] first, the same way a real mount point is expected
/// to unmount cleanly before the device goes away.
pub struct FileSystem<D: BlockDevice + 'static, S: Scheduler> {
    cache: Arc<Cache<D, S>>,
    inodes: Arc<InodeTable<D, S>>,
}

impl<D: BlockDevice + 'static, S: Scheduler> FileSystem<D, S> {
    /// Mounts a file system over `device`, using `scheduler` for the
    /// cache's periodic writer and read-ahead workers.
    pub fn mount(device: Arc<D>, scheduler: Arc<S>, free_map: Arc<dyn FreeMap>) -> Self {
        let cache = Cache::init(Arc::clone(&device), scheduler);
        let inodes = InodeTable::new(device, Arc::clone(&cache), free_map);
        log::info!("file system mounted");
        Self { cache, inodes }
    }

    /// The shared inode table, used to `create`/`open`/`close` files.
    pub fn inodes(&self) -> &Arc<InodeTable<D, S>> {
        &self.inodes
    }

    /// The shared cache, exposed for callers that need direct sector
    /// access (e.g. a free-map bitmap stored in a well-known sector).
    pub fn cache(&self) -> &Arc<Cache<D, S>> {
        &self.cache
    }

    /// Flushes every dirty cache slot and clears the cache. Call this
    /// before the underlying device is torn down.
    pub fn shutdown(&self) {
        self.cache.flush(true);
        log::info!("file system shut down");
    }
}
