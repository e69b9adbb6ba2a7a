//! Write-back block cache keyed by sector number.
//!
//! Every metadata access in the driver goes through here, one 512-byte
//! sector at a time, via the closure-based [`Cache::read`] / [`Cache::modify`]
//! mappers. A sector stays cached until LRU pressure evicts it; eviction and
//! [`BlockCacheManager::sync_all`] write dirty sectors back to the device.

use alloc::sync::Arc;
use lru::LruCache;
use spin::{Mutex, RwLock};

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::{BLOCK_CACHE_LIMIT, SECTOR_SIZE};

pub trait Cache {
    /// The read-only mapper to the cached sector.
    ///
    /// - `offset`: byte offset of a `T` within the sector
    /// - `f`: a closure to read it
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V;

    /// The mutable mapper to the cached sector. Marks the sector dirty.
    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V;

    /// Write the sector back to the device if it is dirty.
    fn sync(&mut self) -> Result<()>;
}

pub struct BlockCache {
    data: [u8; SECTOR_SIZE],
    sector: u64,
    device: Arc<dyn BlockDevice>,
    dirty: bool,
}

impl BlockCache {
    /// Load one sector from the device.
    pub fn load(sector: u64, device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut data = [0u8; SECTOR_SIZE];
        device.read_blocks(&mut data, sector as usize * SECTOR_SIZE)?;
        Ok(Self {
            data,
            sector,
            device,
            dirty: false,
        })
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Drop the contents without writing them back. Used when the clusters
    /// behind this sector were freed and the data is known dead.
    pub fn invalidate(&mut self) {
        self.dirty = false;
    }

    fn get_ref<T>(&self, offset: usize) -> &T {
        assert!(offset + core::mem::size_of::<T>() <= SECTOR_SIZE);
        let addr = &self.data[offset] as *const u8;
        unsafe { &*(addr as *const T) }
    }

    fn get_mut<T>(&mut self, offset: usize) -> &mut T {
        assert!(offset + core::mem::size_of::<T>() <= SECTOR_SIZE);
        self.dirty = true;
        let addr = &mut self.data[offset] as *mut u8;
        unsafe { &mut *(addr as *mut T) }
    }
}

impl Cache for BlockCache {
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    fn sync(&mut self) -> Result<()> {
        if self.dirty {
            self.device
                .write_blocks(&self.data, self.sector as usize * SECTOR_SIZE)?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if self.sync().is_err() {
            log::warn!("block cache: lost dirty sector {} on eviction", self.sector);
        }
    }
}

/// Per-volume sector cache with LRU eviction.
pub struct BlockCacheManager {
    device: Arc<dyn BlockDevice>,
    lru: Mutex<LruCache<u64, Arc<RwLock<BlockCache>>>>,
}

impl BlockCacheManager {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            lru: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn device(&self) -> Arc<dyn BlockDevice> {
        Arc::clone(&self.device)
    }

    /// Get a sector, loading it from the device on a miss.
    pub fn get(&self, sector: u64) -> Result<Arc<RwLock<BlockCache>>> {
        let mut lru = self.lru.lock();
        if let Some(block) = lru.get(&sector) {
            return Ok(Arc::clone(block));
        }

        let block = Arc::new(RwLock::new(BlockCache::load(
            sector,
            Arc::clone(&self.device),
        )?));

        if lru.len() >= BLOCK_CACHE_LIMIT {
            // Only evict a block nobody else still references; writeback
            // happens in its Drop.
            if let Some((_, peeked)) = lru.peek_lru() {
                if Arc::strong_count(peeked) == 1 {
                    lru.pop_lru();
                }
            }
        }
        lru.put(sector, Arc::clone(&block));
        Ok(block)
    }

    /// Read a `T` at `offset` inside `sector`.
    pub fn read_sector<T, V>(
        &self,
        sector: u64,
        offset: usize,
        f: impl FnOnce(&T) -> V,
    ) -> Result<V> {
        let block = self.get(sector)?;
        let guard = block.read();
        Ok(guard.read(offset, f))
    }

    /// Modify a `T` at `offset` inside `sector`, marking it dirty.
    pub fn modify_sector<T, V>(
        &self,
        sector: u64,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> Result<V> {
        let block = self.get(sector)?;
        let mut guard = block.write();
        Ok(guard.modify(offset, f))
    }

    /// Flush every dirty sector.
    pub fn sync_all(&self) -> Result<()> {
        let lru = self.lru.lock();
        let mut failed = false;
        for (_, block) in lru.iter() {
            if block.write().sync().is_err() {
                failed = true;
            }
        }
        if failed {
            Err(Error::Io)
        } else {
            Ok(())
        }
    }

    /// Flush a contiguous sector range.
    pub fn sync_range(&self, first: u64, count: u64) -> Result<()> {
        let lru = self.lru.lock();
        for (sector, block) in lru.iter() {
            if *sector >= first && *sector < first + count {
                block.write().sync()?;
            }
        }
        Ok(())
    }

    /// Drop cached sectors in the range without writing them back.
    pub fn discard(&self, first: u64, count: u64) {
        let mut lru = self.lru.lock();
        for sector in first..first + count {
            if let Some(block) = lru.pop(&sector) {
                block.write().invalidate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests_support::MemDisk;

    #[test]
    fn writeback_happens_on_sync() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = BlockCacheManager::new(disk.clone());
        cache
            .modify_sector(3, 10, |b: &mut [u8; 4]| b.copy_from_slice(b"abcd"))
            .unwrap();
        // Not on disk yet.
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_blocks(&mut raw, 3 * SECTOR_SIZE).unwrap();
        assert_eq!(&raw[10..14], &[0; 4]);

        cache.sync_all().unwrap();
        disk.read_blocks(&mut raw, 3 * SECTOR_SIZE).unwrap();
        assert_eq!(&raw[10..14], b"abcd");
    }

    #[test]
    fn discard_drops_dirty_data() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = BlockCacheManager::new(disk.clone());
        cache
            .modify_sector(5, 0, |b: &mut [u8; 2]| b.copy_from_slice(b"xy"))
            .unwrap();
        cache.discard(5, 1);
        cache.sync_all().unwrap();
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_blocks(&mut raw, 5 * SECTOR_SIZE).unwrap();
        assert_eq!(&raw[0..2], &[0; 2]);
    }
}
