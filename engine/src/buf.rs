// Buffer cache
// Lockable, pinnable in-core copies of fixed-size data device blocks

use crate::device::BlockDevice;
use crate::sync::{lock, MrLock};
use crate::types::{BlockNumber, LockMode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use xfstx_core::XfsResult;

/// One cached block
pub struct Buf {
    blkno: BlockNumber,
    lock: MrLock,
    data: Mutex<Vec<u8>>,
    /// Contents reflect the disk (or a newer in-core version)
    valid: AtomicBool,
    dirty: AtomicBool,
    pin_count: AtomicU32,
}

impl Buf {
    fn new(blkno: BlockNumber, block_size: usize) -> Self {
        Self {
            blkno,
            lock: MrLock::new("buf"),
            data: Mutex::new(vec![0u8; block_size]),
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
        }
    }

    pub fn blkno(&self) -> BlockNumber {
        self.blkno
    }

    pub fn lock(&self, mode: LockMode) {
        self.lock.lock(mode);
    }

    pub fn try_lock(&self, mode: LockMode) -> bool {
        self.lock.try_lock(mode)
    }

    pub fn unlock(&self, mode: LockMode) {
        self.lock.unlock(mode);
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Access the block contents. Writers must hold the buffer lock exclusive.
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.data)
    }

    /// Copy `bytes` into the block at `offset`
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(self.lock.is_exclusive(), "buffer {} modified unlocked", self.blkno);
        let mut data = self.data();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Hold off write-back while an uncommitted transaction references the buffer
    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        let previous = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "buffer {} unpinned below zero", self.blkno);
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::SeqCst) > 0
    }
}

impl std::fmt::Debug for Buf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf")
            .field("blkno", &self.blkno)
            .field("dirty", &self.is_dirty())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

/// Buffer cache statistics
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BufStats {
    pub lookups: u64,
    pub hits: u64,
    pub reads: u64,
    pub writes: u64,
}

/// Cache of data device blocks, one slot per block number
pub struct BufCache {
    dev: Arc<dyn BlockDevice>,
    bufs: Mutex<HashMap<BlockNumber, Arc<Buf>>>,
    stats: Mutex<BufStats>,
}

impl BufCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            bufs: Mutex::new(HashMap::new()),
            stats: Mutex::new(BufStats::default()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.dev.block_size()
    }

    /// Get the buffer for a block without reading it; contents of a new
    /// buffer are zero. Used for blocks about to be fully initialised.
    pub fn get(&self, blkno: BlockNumber) -> XfsResult<Arc<Buf>> {
        if blkno >= self.dev.block_count() {
            return Err(xfstx_core::XfsError::InvalidInput(format!(
                "buffer {} beyond device end {}",
                blkno,
                self.dev.block_count()
            )));
        }
        let mut bufs = lock(&self.bufs);
        let mut stats = lock(&self.stats);
        stats.lookups += 1;
        if let Some(buf) = bufs.get(&blkno) {
            stats.hits += 1;
            return Ok(Arc::clone(buf));
        }
        let buf = Arc::new(Buf::new(blkno, self.dev.block_size()));
        bufs.insert(blkno, Arc::clone(&buf));
        Ok(buf)
    }

    /// Get the buffer for a block, reading it from disk if not yet valid
    pub fn read(&self, blkno: BlockNumber) -> XfsResult<Arc<Buf>> {
        let buf = self.get(blkno)?;
        if !buf.valid.load(Ordering::SeqCst) {
            let mut data = buf.data();
            if !buf.valid.load(Ordering::SeqCst) {
                *data = self.dev.read_block(blkno)?;
                buf.valid.store(true, Ordering::SeqCst);
                lock(&self.stats).reads += 1;
            }
        }
        Ok(buf)
    }

    /// Drop a reference; clean, idle buffers leave the cache
    pub fn release(&self, buf: Arc<Buf>) {
        let mut bufs = lock(&self.bufs);
        // The map holds one reference and the caller the other
        if Arc::strong_count(&buf) == 2 && !buf.is_dirty() && !buf.is_pinned() && !buf.is_locked() {
            bufs.remove(&buf.blkno);
        }
    }

    /// Write a dirty buffer home. Returns false if it is pinned and must wait.
    pub fn flush(&self, buf: &Buf) -> XfsResult<bool> {
        if buf.is_pinned() {
            return Ok(false);
        }
        if !buf.is_dirty() {
            return Ok(true);
        }
        let data = buf.data().clone();
        self.dev.write_block(buf.blkno, &data)?;
        buf.clear_dirty();
        lock(&self.stats).writes += 1;
        log::trace!("Flushed buffer {}", buf.blkno);
        Ok(true)
    }

    /// Evict every clean buffer nobody else references. Returns how many
    /// left the cache.
    pub fn reclaim(&self) -> usize {
        let mut bufs = lock(&self.bufs);
        let before = bufs.len();
        bufs.retain(|_, buf| {
            Arc::strong_count(buf) > 1 || buf.is_dirty() || buf.is_pinned() || buf.is_locked()
        });
        before - bufs.len()
    }

    pub fn cached(&self) -> usize {
        lock(&self.bufs).len()
    }

    pub fn stats(&self) -> BufStats {
        lock(&self.stats).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn cache() -> (MemDevice, BufCache) {
        let dev = MemDevice::new(512, 16);
        let cache = BufCache::new(Arc::new(dev.clone()));
        (dev, cache)
    }

    #[test]
    fn test_read_caches_one_slot_per_block() {
        let (dev, cache) = cache();
        dev.write_block(4, &[3; 512]).unwrap();

        let a = cache.read(4).unwrap();
        let b = cache.read(4).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.data()[0], 3);
        assert_eq!(cache.stats().reads, 1);
    }

    #[test]
    fn test_pinned_buffer_is_not_written() {
        let (dev, cache) = cache();
        let buf = cache.read(2).unwrap();
        buf.lock(LockMode::Exclusive);
        buf.write_at(10, &[0xEE; 4]);
        buf.mark_dirty();
        buf.pin();

        assert!(!cache.flush(&buf).unwrap());
        assert_eq!(dev.read_block(2).unwrap()[10], 0);

        buf.unpin();
        assert!(cache.flush(&buf).unwrap());
        assert_eq!(dev.read_block(2).unwrap()[10], 0xEE);
        assert!(!buf.is_dirty());
        buf.unlock(LockMode::Exclusive);
    }

    #[test]
    fn test_release_evicts_clean_buffers_only() {
        let (_dev, cache) = cache();
        let clean = cache.read(1).unwrap();
        let dirty = cache.read(2).unwrap();
        dirty.mark_dirty();

        cache.release(clean);
        cache.release(Arc::clone(&dirty));
        assert_eq!(cache.cached(), 1);

        // Written home, the last reference goes and so does the slot
        assert!(cache.flush(&dirty).unwrap());
        assert_eq!(cache.reclaim(), 0);
        drop(dirty);
        assert_eq!(cache.reclaim(), 1);
        assert_eq!(cache.cached(), 0);
    }

    #[test]
    fn test_get_beyond_end_fails() {
        let (_dev, cache) = cache();
        assert!(cache.get(16).is_err());
    }
}
