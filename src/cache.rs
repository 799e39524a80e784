//! The buffered cache: a fixed-capacity, clock-replacement sector cache
//! with reference-counted pinning, write-behind, and read-ahead.
//!
//! One mutual-exclusion lock protects the entire slot table, including
//! across the synchronous device I/O on the fill-on-miss path, rather
//! than a per-slot or lock-free design.

use std::collections::VecDeque;
use std::sync::Arc;

use array_macro::array;

use crate::device::{BlockDevice, SectorBuf, SectorId};
use crate::error::DeviceError;
use crate::param::{CACHE_CAPACITY, SECTOR_SIZE, WRITE_BEHIND_PERIOD_TICKS};
use crate::scheduler::Scheduler;

/// One cached sector and its admission/eviction bookkeeping.
struct CacheEntry {
    sector: SectorId,
    data: SectorBuf,
    free: bool,
    pin_count: u32,
    accessed: bool,
    dirty: bool,
}

impl CacheEntry {
    const fn free_slot() -> Self {
        Self {
            sector: 0,
            data: [0; SECTOR_SIZE],
            free: true,
            pin_count: 0,
            accessed: false,
            dirty: false,
        }
    }
}

struct Table {
    entries: [CacheEntry; CACHE_CAPACITY],
    /// Position the clock hand resumes scanning from across calls,
    /// avoiding always re-examining the same early slots first.
    clock_hand: usize,
    /// Pending `sector + 1` requests queued by `read_ahead`, drained one
    /// at a time by the short-lived worker threads it spawns.
    read_ahead_queue: VecDeque<SectorId>,
}

impl Table {
    fn new() -> Self {
        Self {
            entries: array![_ => CacheEntry::free_slot(); CACHE_CAPACITY],
            clock_hand: 0,
            read_ahead_queue: VecDeque::new(),
        }
    }
}

/// The buffered sector cache.
///
/// Constructed once per mount via [`Cache::init`], which also spawns the
/// periodic write-behind thread. Share the returned `Arc<Cache<_, _>>`
/// with every caller thread, the write-behind thread, and every
/// read-ahead worker; none of them need special privileges beyond the
/// table lock.
pub struct Cache<D: BlockDevice + 'static, S: Scheduler> {
    device: Arc<D>,
    scheduler: Arc<S>,
    table: spin::Mutex<Table>,
}

impl<D: BlockDevice + 'static, S: Scheduler> Cache<D, S> {
    /// Initializes all slots as free and spawns the periodic writer.
    pub fn init(device: Arc<D>, scheduler: Arc<S>) -> Arc<Self> {
        let cache = Arc::new(Self {
            device,
            scheduler: Arc::clone(&scheduler),
            table: spin::Mutex::new(Table::new()),
        });

        let writer_cache = Arc::clone(&cache);
        let writer_scheduler = Arc::clone(&scheduler);
        scheduler.spawn(
            "cache-writer",
            Box::new(move || loop {
                writer_scheduler.sleep(WRITE_BEHIND_PERIOD_TICKS);
                writer_cache.flush(false);
            }),
        );

        log::info!("cache initialized: {} slots", CACHE_CAPACITY);
        cache
    }

    /// Copies `nbytes` from the cached sector at `offset_in_sector` into
    /// `dst`. Requires `offset_in_sector + nbytes <= SECTOR_SIZE`.
    pub fn read_at(&self, sector: SectorId, dst: &mut [u8], offset_in_sector: usize, nbytes: usize) {
        assert!(offset_in_sector + nbytes <= SECTOR_SIZE);
        let idx = self
            .access(sector, false)
            .expect("block device read failed (fatal)");
        let _unpin = scopeguard::guard(idx, |idx| self.unpin(idx));
        let table = self.table.lock();
        dst[..nbytes].copy_from_slice(&table.entries[idx].data[offset_in_sector..offset_in_sector + nbytes]);
    }

    /// Copies `nbytes` from `src` into the cached sector at
    /// `offset_in_sector`, marking the slot dirty.
    pub fn write_at(&self, sector: SectorId, src: &[u8], offset_in_sector: usize, nbytes: usize) {
        assert!(offset_in_sector + nbytes <= SECTOR_SIZE);
        let idx = self
            .access(sector, true)
            .expect("block device write failed (fatal)");
        let _unpin = scopeguard::guard(idx, |idx| self.unpin(idx));
        let mut table = self.table.lock();
        table.entries[idx].data[offset_in_sector..offset_in_sector + nbytes].copy_from_slice(&src[..nbytes]);
        table.entries[idx].dirty = true;
    }

    /// Writes every dirty slot back to the device. If `clear`, every
    /// slot is reinitialized to free afterward (used at shutdown).
    pub fn flush(&self, clear: bool) {
        let mut table = self.table.lock();
        for entry in table.entries.iter_mut() {
            if entry.dirty {
                self.device
                    .write(entry.sector, &entry.data)
                    .expect("block device write failed during flush (fatal)");
                entry.dirty = false;
            }
        }
        if clear {
            for entry in table.entries.iter_mut() {
                *entry = CacheEntry::free_slot();
            }
            table.clock_hand = 0;
            log::info!("cache flushed and cleared");
        } else {
            log::debug!("cache flushed");
        }
    }

    /// Requests asynchronous preloading of `sector + 1`. Fire-and-forget:
    /// no cancellation, and the pin this takes on the slot is never
    /// released.
    pub fn read_ahead(self: &Arc<Self>, sector: SectorId) {
        let next = sector.wrapping_add(1);
        {
            let mut table = self.table.lock();
            table.read_ahead_queue.push_back(next);
        }
        let cache = Arc::clone(self);
        self.scheduler.spawn(
            "read-ahead",
            Box::new(move || {
                let queued = {
                    let mut table = cache.table.lock();
                    table.read_ahead_queue.pop_front()
                };
                if let Some(sector) = queued {
                    if let Err(err) = cache.access(sector, false) {
                        log::debug!("read-ahead for sector {sector} failed, ignored: {err}");
                    }
                }
            }),
        );
    }

    /// Admission protocol: find or load `sector`, pinning it.
    fn access(&self, sector: SectorId, dirty_hint: bool) -> Result<usize, DeviceError> {
        let mut table = self.table.lock();

        if let Some(idx) = table
            .entries
            .iter()
            .position(|e| !e.free && e.sector == sector)
        {
            let entry = &mut table.entries[idx];
            entry.pin_count += 1;
            entry.accessed = true;
            entry.dirty |= dirty_hint;
            log::trace!("cache hit: sector {sector} -> slot {idx}");
            return Ok(idx);
        }

        let idx = self.locate_or_evict(&mut table)?;
        {
            let entry = &mut table.entries[idx];
            entry.sector = sector;
            entry.free = false;
            entry.pin_count = 1;
            entry.accessed = true;
            entry.dirty = dirty_hint;
        }
        self.device.read(sector, &mut table.entries[idx].data)?;
        log::trace!("cache miss: sector {sector} loaded into slot {idx}");
        Ok(idx)
    }

    /// Returns a free slot index, evicting via Clock (second-chance) if
    /// none is free. Unbounded-cyclic: makes progress as long as fewer
    /// than `CACHE_CAPACITY` slots are pinned simultaneously.
    fn locate_or_evict(&self, table: &mut Table) -> Result<usize, DeviceError> {
        if let Some(idx) = table.entries.iter().position(|e| e.free) {
            return Ok(idx);
        }

        loop {
            let idx = table.clock_hand;
            table.clock_hand = (idx + 1) % CACHE_CAPACITY;

            let entry = &mut table.entries[idx];
            if entry.pin_count > 0 {
                continue;
            }
            if entry.accessed {
                entry.accessed = false;
                continue;
            }

            if entry.dirty {
                self.device.write(entry.sector, &entry.data)?;
                entry.dirty = false;
            }
            log::debug!("evicting slot {idx} (sector {})", entry.sector);
            entry.free = true;
            entry.pin_count = 0;
            entry.accessed = false;
            return Ok(idx);
        }
    }

    fn unpin(&self, idx: usize) {
        let mut table = self.table.lock();
        table.entries[idx].pin_count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::device::MemBlockDevice;
    use crate::param::CACHE_CAPACITY;
    use crate::scheduler::ThreadScheduler;

    fn new_cache(sectors: usize) -> Arc<Cache<MemBlockDevice, ThreadScheduler>> {
        Cache::init(
            Arc::new(MemBlockDevice::new(sectors)),
            Arc::new(ThreadScheduler),
        )
    }

    /// A `Scheduler` whose sleep is short and fixed, so the periodic
    /// writer it drives laps many times within a test's real-time budget
    /// instead of waiting out the real `WRITE_BEHIND_PERIOD_TICKS`.
    struct FastScheduler;

    impl Scheduler for FastScheduler {
        fn spawn(&self, name: &str, entry: Box<dyn FnOnce() + Send>) {
            let builder = thread::Builder::new().name(name.to_owned());
            let _ = builder.spawn(entry);
        }

        fn sleep(&self, _ticks: u64) {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn coherence_write_then_read() {
        let cache = new_cache(CACHE_CAPACITY + 8);
        let buf = [b'A'; SECTOR_SIZE];
        cache.write_at(5, &buf, 0, SECTOR_SIZE);

        for s in 0..10 {
            if s != 5 {
                let scratch = [0u8; SECTOR_SIZE];
                cache.write_at(s, &scratch, 0, 1);
            }
        }

        let mut out = [0u8; SECTOR_SIZE];
        cache.read_at(5, &mut out, 0, SECTOR_SIZE);
        assert_eq!(out, buf);
    }

    #[test]
    fn flush_is_idempotent() {
        let cache = new_cache(4);
        let buf = [9u8; SECTOR_SIZE];
        cache.write_at(1, &buf, 0, SECTOR_SIZE);
        cache.flush(false);
        cache.flush(false);

        let mut out = [0u8; SECTOR_SIZE];
        cache.read_at(1, &mut out, 0, SECTOR_SIZE);
        assert_eq!(out, buf);
    }

    #[test]
    fn eviction_round_robin_spares_recently_accessed() {
        let cache = new_cache(CACHE_CAPACITY + 4);

        for s in 0..CACHE_CAPACITY as u32 {
            let scratch = [0u8; SECTOR_SIZE];
            cache.write_at(s, &scratch, 0, 1);
        }

        // Touch sector 0 again so its accessed bit survives the first pass.
        let mut out = [0u8; 1];
        cache.read_at(0, &mut out, 0, 1);

        // Bringing in a new sector must evict something, but must not be
        // able to evict a pinned slot; since nothing is pinned here it
        // just has to succeed without touching sector 0's contents.
        let scratch = [7u8; SECTOR_SIZE];
        cache.write_at(CACHE_CAPACITY as u32, &scratch, 0, SECTOR_SIZE);

        let mut out2 = [0u8; SECTOR_SIZE];
        cache.read_at(CACHE_CAPACITY as u32, &mut out2, 0, SECTOR_SIZE);
        assert_eq!(out2, scratch);
    }

    #[test]
    fn at_most_one_slot_per_sector() {
        let cache = new_cache(CACHE_CAPACITY + 4);
        for s in 0..CACHE_CAPACITY as u32 + 2 {
            let scratch = [0u8; SECTOR_SIZE];
            cache.write_at(s, &scratch, 0, 1);
        }
        let table = cache.table.lock();
        let mut seen = std::collections::HashSet::new();
        for entry in table.entries.iter().filter(|e| !e.free) {
            assert!(seen.insert(entry.sector), "sector {} cached twice", entry.sector);
        }
    }

    #[test]
    fn write_behind_persists_without_explicit_flush() {
        let device = Arc::new(MemBlockDevice::new(4));
        let cache = Cache::init(Arc::clone(&device), Arc::new(FastScheduler));

        let buf = [3u8; SECTOR_SIZE];
        cache.write_at(1, &buf, 0, SECTOR_SIZE);

        let mut seen_on_device = false;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(20));
            let mut raw = [0u8; SECTOR_SIZE];
            device.read(1, &mut raw).unwrap();
            if raw == buf {
                seen_on_device = true;
                break;
            }
        }
        assert!(
            seen_on_device,
            "periodic writer never flushed the dirty sector back to the device"
        );
    }
}
