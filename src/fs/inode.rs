//! The inode layer: on-disk inode records, the direct/single-indirect/
//! double-indirect offset-to-sector map, and the open/close/remove
//! lifecycle shared by every handle on the same inode.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::Cache;
use crate::device::{BlockDevice, SectorId};
use crate::error::FsError;
use crate::freemap::FreeMap;
use crate::param::{DIRECT_N, INDIRECT_N, INODE_MAGIC, MAX_FILE_SECTORS, SECTOR_SIZE};
use crate::scheduler::Scheduler;

/// Padding so `InodeDisk` is exactly one sector wide.
const INODE_DISK_PAD: usize = SECTOR_SIZE - (8 + 4 + DIRECT_N * 4 + 4 + 4);

/// The on-disk, sector-sized record describing a file.
///
/// `length` and `magic` come first, then the three levels of sector
/// pointers, then padding to round the struct out to exactly
/// `SECTOR_SIZE` bytes. `FromBytes`/`AsBytes` let this be read from and
/// written to a raw sector buffer without a hand-rolled (de)serializer.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub struct InodeDisk {
    /// File length in bytes.
    pub length: i64,
    /// Identifies a valid inode; see [`INODE_MAGIC`].
    pub magic: u32,
    /// Direct data-sector pointers.
    pub direct: [u32; DIRECT_N],
    /// Sector holding an [`IndirectBlock`] of data-sector pointers.
    pub indirect: u32,
    /// Sector holding an [`IndirectBlock`] of sectors, each itself an
    /// [`IndirectBlock`] of data-sector pointers.
    pub d_indirect: u32,
    unused: [u8; INODE_DISK_PAD],
}

const_assert_eq!(core::mem::size_of::<InodeDisk>(), SECTOR_SIZE);

impl Default for InodeDisk {
    fn default() -> Self {
        Self {
            length: 0,
            magic: 0,
            direct: [0; DIRECT_N],
            indirect: 0,
            d_indirect: 0,
            unused: [0; INODE_DISK_PAD],
        }
    }
}

/// A sector interpreted as `INDIRECT_N` SectorIds. Never instantiated
/// except as a transient buffer during allocation, mapping, or
/// deallocation; this crate never keeps one around past the device
/// call that filled or will persist it.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub struct IndirectBlock {
    pub entries: [u32; INDIRECT_N],
}

const_assert_eq!(core::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl Default for IndirectBlock {
    fn default() -> Self {
        Self {
            entries: [0; INDIRECT_N],
        }
    }
}

fn bytes_to_sectors(length: i64) -> usize {
    debug_assert!(length >= 0);
    ((length as u64 + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as usize
}

/// Per-opener-shared mutable state of an open inode.
struct InodeState {
    data: InodeDisk,
    open_count: u32,
    deny_write_count: u32,
    removed: bool,
}

/// An open inode, shared by every `open()` call on the same sector.
///
/// Obtained from and returned to an [`InodeTable`]; see
/// [`InodeTable::open`]/[`InodeTable::close`].
pub struct Inode<D: BlockDevice + 'static, S: Scheduler> {
    sector: SectorId,
    table: Arc<InodeTable<D, S>>,
    state: spin::Mutex<InodeState>,
}

impl<D: BlockDevice + 'static, S: Scheduler> Inode<D, S> {
    /// The sector this inode's `InodeDisk` lives at (its "inumber").
    pub fn inumber(&self) -> SectorId {
        self.sector
    }

    /// Current file length in bytes.
    pub fn len(&self) -> i64 {
        self.state.lock().data.length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks this inode for deletion once the last handle closes.
    /// Reclamation itself happens in [`InodeTable::close`].
    pub fn remove(&self) {
        self.state.lock().removed = true;
    }

    /// Increments `deny_write_count`. Each opener may deny at most once
    /// before calling `allow_write`.
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_count += 1;
        debug_assert!(state.deny_write_count <= state.open_count);
    }

    /// Decrements `deny_write_count`.
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.deny_write_count > 0);
        state.deny_write_count -= 1;
    }

    /// Resolves `pos` to the device sector holding that byte, or `None`
    /// past end-of-file. Indirect/double-indirect levels are read
    /// directly from the device, bypassing the cache (see DESIGN.md).
    pub fn map_offset(&self, pos: i64) -> Option<SectorId> {
        self.map_offset_with(pos, false)
    }

    /// Identical to [`Self::map_offset`] but routes indirect-block reads
    /// through the cache instead of the device, releasing the pin before
    /// returning. Available to callers who want the lower read latency
    /// of a warm indirect-block cache without forcing it on every
    /// caller.
    pub fn map_offset_cached(&self, pos: i64) -> Option<SectorId> {
        self.map_offset_with(pos, true)
    }

    fn map_offset_with(&self, pos: i64, via_cache: bool) -> Option<SectorId> {
        let (length, direct, indirect, d_indirect) = {
            let state = self.state.lock();
            (
                state.data.length,
                state.data.direct,
                state.data.indirect,
                state.data.d_indirect,
            )
        };
        if pos >= length {
            return None;
        }

        let mut bi = (pos / SECTOR_SIZE as i64) as usize;
        if bi < DIRECT_N {
            return Some(direct[bi]);
        }
        bi -= DIRECT_N;

        if bi < INDIRECT_N {
            let block = self.read_indirect(indirect, via_cache);
            return Some(block.entries[bi]);
        }
        bi -= INDIRECT_N;

        let l1 = self.read_indirect(d_indirect, via_cache);
        let l2 = self.read_indirect(l1.entries[bi / INDIRECT_N], via_cache);
        Some(l2.entries[bi % INDIRECT_N])
    }

    fn read_indirect(&self, sector: SectorId, via_cache: bool) -> IndirectBlock {
        let mut buf = [0u8; SECTOR_SIZE];
        if via_cache {
            self.table.cache.read_at(sector, &mut buf, 0, SECTOR_SIZE);
        } else {
            self.table
                .device
                .read(sector, &mut buf)
                .expect("block device read failed (fatal)");
        }
        let mut block = IndirectBlock::default();
        block.as_bytes_mut().copy_from_slice(&buf);
        block
    }

    /// Reads up to `size` bytes starting at `offset` into `dst`, stopping
    /// at end-of-file. Returns the number of bytes actually transferred.
    pub fn read_at(&self, dst: &mut [u8], size: usize, offset: i64) -> usize {
        let mut bytes_read = 0usize;
        let mut offset = offset;
        let mut remaining = size;

        while remaining > 0 {
            let sector_idx = match self.map_offset(offset) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = (offset % SECTOR_SIZE as i64) as usize;
            let inode_left = (self.len() - offset).max(0) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remaining.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            self.table.cache.read_at(
                sector_idx,
                &mut dst[bytes_read..bytes_read + chunk],
                sector_ofs,
                chunk,
            );

            remaining -= chunk;
            offset += chunk as i64;
            bytes_read += chunk;
        }
        bytes_read
    }

    /// Writes up to `size` bytes from `src` at `offset`. Returns 0
    /// immediately if `deny_write_count > 0`. Does not grow the file:
    /// writes past `length` stop at end-of-file.
    pub fn write_at(&self, src: &[u8], size: usize, offset: i64) -> usize {
        if self.state.lock().deny_write_count > 0 {
            return 0;
        }

        let mut bytes_written = 0usize;
        let mut offset = offset;
        let mut remaining = size;

        while remaining > 0 {
            let sector_idx = match self.map_offset(offset) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = (offset % SECTOR_SIZE as i64) as usize;
            let inode_left = (self.len() - offset).max(0) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remaining.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            self.table.cache.write_at(
                sector_idx,
                &src[bytes_written..bytes_written + chunk],
                sector_ofs,
                chunk,
            );

            remaining -= chunk;
            offset += chunk as i64;
            bytes_written += chunk;
        }
        bytes_written
    }
}

/// Owns the device/cache/free-map handles shared by every inode and the
/// process-wide table of currently-open inodes, keyed by sector.
///
/// This is a mount-scoped context value passed to every operation,
/// replacing the global statics a kernel-resident inode layer would
/// otherwise reach for; see [`crate::FileSystem`] for the full
/// mount/shutdown wrapper that also owns the cache.
pub struct InodeTable<D: BlockDevice + 'static, S: Scheduler> {
    device: Arc<D>,
    cache: Arc<Cache<D, S>>,
    free_map: Arc<dyn FreeMap>,
    open: StdMutex<HashMap<SectorId, Arc<Inode<D, S>>>>,
}

impl<D: BlockDevice + 'static, S: Scheduler> InodeTable<D, S> {
    pub fn new(device: Arc<D>, cache: Arc<Cache<D, S>>, free_map: Arc<dyn FreeMap>) -> Arc<Self> {
        Arc::new(Self {
            device,
            cache,
            free_map,
            open: StdMutex::new(HashMap::new()),
        })
    }

    /// Allocates an inode occupying `sector` plus enough data sectors to
    /// hold `length` bytes, writing zero-filled data through every level
    /// of indirection needed. On the first allocation failure, bails out
    /// immediately without releasing sectors already reserved.
    pub fn create(&self, sector: SectorId, length: i64) -> Result<(), FsError> {
        assert!(length >= 0);
        assert!(
            bytes_to_sectors(length) <= MAX_FILE_SECTORS,
            "length exceeds the largest file this layout can address"
        );

        let mut disk = InodeDisk {
            length,
            magic: INODE_MAGIC,
            ..InodeDisk::default()
        };
        self.write_raw(sector, &disk)?;

        let mut need = bytes_to_sectors(length);
        let zeros = [0u8; SECTOR_SIZE];

        let direct_count = need.min(DIRECT_N);
        for slot in disk.direct.iter_mut().take(direct_count) {
            let s = self.free_map.allocate().ok_or_else(|| self.out_of_space(sector))?;
            self.device.write(s, &zeros)?;
            *slot = s;
        }
        need -= direct_count;

        if need > 0 {
            let indirect_sector = self.free_map.allocate().ok_or_else(|| self.out_of_space(sector))?;
            disk.indirect = indirect_sector;

            let mut block = IndirectBlock::default();
            let count = need.min(INDIRECT_N);
            for slot in block.entries.iter_mut().take(count) {
                let s = self.free_map.allocate().ok_or_else(|| self.out_of_space(sector))?;
                self.device.write(s, &zeros)?;
                *slot = s;
            }
            self.write_raw(indirect_sector, &block)?;
            need -= count;
        }

        if need > 0 {
            let d_indirect_sector = self.free_map.allocate().ok_or_else(|| self.out_of_space(sector))?;
            disk.d_indirect = d_indirect_sector;

            let mut top = IndirectBlock::default();
            let mut row = 0usize;
            while need > 0 {
                let row_sector = self.free_map.allocate().ok_or_else(|| self.out_of_space(sector))?;
                top.entries[row] = row_sector;

                let mut block = IndirectBlock::default();
                let count = need.min(INDIRECT_N);
                for slot in block.entries.iter_mut().take(count) {
                    let s = self.free_map.allocate().ok_or_else(|| self.out_of_space(sector))?;
                    self.device.write(s, &zeros)?;
                    *slot = s;
                }
                self.write_raw(row_sector, &block)?;
                need -= count;
                row += 1;
            }
            self.write_raw(d_indirect_sector, &top)?;
        }

        // Persist the header a second time now that every pointer is
        // known; the first write above only fixes `length`/`magic` in
        // place early, but every field read back by `open` must reflect
        // the final allocation.
        self.write_raw(sector, &disk)?;

        log::info!("created inode at sector {sector}, length {length}");
        Ok(())
    }

    /// If `sector` is already open, returns the existing shared `Inode`
    /// with its `open_count` incremented. Otherwise reads `InodeDisk`
    /// from the device (not the cache, a design choice that keeps the
    /// inode layer independent of in-flight cache contents) and registers a
    /// new open inode.
    pub fn open(self: &Arc<Self>, sector: SectorId) -> Result<Arc<Inode<D, S>>, FsError> {
        let mut open = self.open.lock().unwrap();
        if let Some(existing) = open.get(&sector) {
            existing.state.lock().open_count += 1;
            return Ok(Arc::clone(existing));
        }

        let mut buf = [0u8; SECTOR_SIZE];
        self.device.read(sector, &mut buf)?;
        let mut data = InodeDisk::default();
        data.as_bytes_mut().copy_from_slice(&buf);
        if data.magic != INODE_MAGIC {
            log::warn!("open({sector}): bad magic, refusing");
            return Err(FsError::BadMagic { sector });
        }

        let inode = Arc::new(Inode {
            sector,
            table: Arc::clone(self),
            state: spin::Mutex::new(InodeState {
                data,
                open_count: 1,
                deny_write_count: 0,
                removed: false,
            }),
        });
        open.insert(sector, Arc::clone(&inode));
        Ok(inode)
    }

    /// Decrements `open_count`; if it reaches zero, unregisters the
    /// inode and, if `remove()` had been called, walks the same
    /// three-level structure in reverse to return every sector to the
    /// free map before the in-memory record is dropped.
    pub fn close(&self, inode: Arc<Inode<D, S>>) {
        let last_close = {
            let mut state = inode.state.lock();
            state.open_count -= 1;
            state.open_count == 0
        };
        if !last_close {
            return;
        }

        self.open.lock().unwrap().remove(&inode.sector);

        let (removed, data) = {
            let state = inode.state.lock();
            (state.removed, state.data)
        };
        if removed {
            self.reclaim(&data);
            self.free_map.release(inode.sector);
            log::info!("removed inode at sector {}", inode.sector);
        }
    }

    fn reclaim(&self, disk: &InodeDisk) {
        let mut need = bytes_to_sectors(disk.length);

        let direct_count = need.min(DIRECT_N);
        for &s in disk.direct.iter().take(direct_count) {
            self.free_map.release(s);
        }
        need -= direct_count;

        if need > 0 {
            let block = self.read_raw_indirect(disk.indirect);
            let count = need.min(INDIRECT_N);
            for &s in block.entries.iter().take(count) {
                self.free_map.release(s);
            }
            self.free_map.release(disk.indirect);
            need -= count;
        }

        if need > 0 {
            let top = self.read_raw_indirect(disk.d_indirect);
            let mut row = 0usize;
            while need > 0 {
                let row_sector = top.entries[row];
                let block = self.read_raw_indirect(row_sector);
                let count = need.min(INDIRECT_N);
                for &s in block.entries.iter().take(count) {
                    self.free_map.release(s);
                }
                self.free_map.release(row_sector);
                need -= count;
                row += 1;
            }
            self.free_map.release(disk.d_indirect);
        }
    }

    /// Logs the sectors `create` had already reserved for `sector` before
    /// the free map ran out; those sectors are not released (see
    /// DESIGN.md's note on `create`'s no-rollback behavior).
    fn out_of_space(&self, sector: SectorId) -> FsError {
        log::warn!("create({sector}): free map exhausted, already-allocated sectors leaked");
        FsError::OutOfSpace
    }

    fn write_raw<T: AsBytes>(&self, sector: SectorId, value: &T) -> Result<(), FsError> {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(value.as_bytes());
        self.device.write(sector, &buf)?;
        Ok(())
    }

    fn read_raw_indirect(&self, sector: SectorId) -> IndirectBlock {
        let mut buf = [0u8; SECTOR_SIZE];
        self.device
            .read(sector, &mut buf)
            .expect("block device read failed (fatal)");
        let mut block = IndirectBlock::default();
        block.as_bytes_mut().copy_from_slice(&buf);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::freemap::BitmapFreeMap;
    use crate::scheduler::ThreadScheduler;

    fn new_table(sectors: usize) -> (Arc<InodeTable<MemBlockDevice, ThreadScheduler>>, Arc<BitmapFreeMap>) {
        let device = Arc::new(MemBlockDevice::new(sectors));
        let cache = Cache::init(Arc::clone(&device), Arc::new(ThreadScheduler));
        let free_map = Arc::new(BitmapFreeMap::new(sectors));
        let table = InodeTable::new(device, cache, free_map.clone());
        (table, free_map)
    }

    #[test]
    fn small_file_round_trip() {
        let (table, free_map) = new_table(64);
        let inode_sector = free_map.allocate().unwrap();
        table.create(inode_sector, 300).unwrap();

        let inode = table.open(inode_sector).unwrap();
        let payload = "ABC".repeat(100);
        assert_eq!(payload.len(), 300);

        let written = inode.write_at(payload.as_bytes(), 300, 0);
        assert_eq!(written, 300);

        let mut buf = [0u8; 300];
        let read = inode.read_at(&mut buf, 300, 0);
        assert_eq!(read, 300);
        assert_eq!(&buf[..], payload.as_bytes());

        table.close(inode);
    }

    #[test]
    fn create_out_of_space_logs_and_leaves_partial_allocation() {
        use env_logger::{Builder, Target};
        Builder::new()
            .target(Target::Stdout)
            .is_test(true)
            .filter_level(log::LevelFilter::Warn)
            .init();

        let (table, free_map) = new_table(4);
        let inode_sector = free_map.allocate().unwrap();
        while free_map.allocate().is_some() {}

        let err = table.create(inode_sector, 4096).unwrap_err();
        assert!(matches!(err, FsError::OutOfSpace));
    }

    #[test]
    fn remove_reclaims_every_block() {
        let capacity = 64;
        let (table, free_map) = new_table(capacity);

        let inode_sector = free_map.allocate().unwrap();
        let after_inode_sector = free_map.free_count();
        table.create(inode_sector, 8192).unwrap(); // 16 data sectors
        assert_eq!(
            free_map.free_count(),
            after_inode_sector - 16,
            "create should have consumed exactly 16 direct data sectors"
        );

        let inode = table.open(inode_sector).unwrap();
        inode.remove();
        table.close(inode);

        // All 16 data sectors plus the inode's own sector are back.
        assert_eq!(free_map.free_count(), capacity);
    }

    #[test]
    fn deny_write_blocks_then_unblocks() {
        let (table, free_map) = new_table(64);
        let inode_sector = free_map.allocate().unwrap();
        table.create(inode_sector, 512).unwrap();
        let inode = table.open(inode_sector).unwrap();

        inode.deny_write();
        let buf = [1u8; 512];
        assert_eq!(inode.write_at(&buf, 512, 0), 0);

        inode.allow_write();
        assert_eq!(inode.write_at(&buf, 512, 0), 512);

        table.close(inode);
    }

    #[test]
    fn open_reuses_identity_and_counts_closes() {
        let (table, free_map) = new_table(64);
        let inode_sector = free_map.allocate().unwrap();
        table.create(inode_sector, 100).unwrap();

        let a = table.open(inode_sector).unwrap();
        let b = table.open(inode_sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        table.close(a);
        // still open via b
        assert!(table.open.lock().unwrap().contains_key(&inode_sector));
        table.close(b);
        assert!(!table.open.lock().unwrap().contains_key(&inode_sector));
    }

    #[test]
    fn offset_mapping_total_on_0_to_length_none_elsewhere() {
        let (table, free_map) = new_table(64);
        let inode_sector = free_map.allocate().unwrap();
        table.create(inode_sector, 1000).unwrap();
        let inode = table.open(inode_sector).unwrap();

        assert!(inode.map_offset(0).is_some());
        assert!(inode.map_offset(999).is_some());
        assert!(inode.map_offset(1000).is_none());
        assert!(inode.map_offset(5000).is_none());

        table.close(inode);
    }

    #[test]
    fn double_indirect_mapping_resolves_through_both_levels() {
        // Enough length to reach into the double-indirect range.
        let needed_sectors = DIRECT_N + INDIRECT_N + 3;
        let length = (needed_sectors * SECTOR_SIZE) as i64;

        let (table, free_map) = new_table(needed_sectors + 8);
        let inode_sector = free_map.allocate().unwrap();
        table.create(inode_sector, length).unwrap();
        let inode = table.open(inode_sector).unwrap();

        let offset = ((DIRECT_N + INDIRECT_N + 2) * SECTOR_SIZE + 17) as i64;
        let resolved = inode.map_offset(offset).expect("offset is within length");

        // Cross-check by walking the tree ourselves.
        let data = inode.state.lock().data;
        let l1 = table.read_raw_indirect(data.d_indirect);
        let l2 = table.read_raw_indirect(l1.entries[0]);
        assert_eq!(resolved, l2.entries[2]);

        table.close(inode);
    }
}
