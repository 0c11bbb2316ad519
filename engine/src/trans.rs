// Transactions
// The unit of atomicity: held locks, logged items and a log space reservation

use crate::ail::AilItem;
use crate::buf::Buf;
use crate::inode::{Inode, InodeCore};
use crate::item::{ItemPayload, RangeSet};
use crate::mount::Mount;
use crate::sync::Interrupt;
use crate::types::{BlockNumber, FieldMask, Ino, LockFlags, LockMode, Lsn, TransClass, TransactionId};
use crate::wal::format::{encode_commit, encode_start, items_crc, record_blocks};
use crate::wal::{PendingRecord, RecordType};
use std::ops::Range;
use std::sync::Arc;
use xfstx_core::{XfsError, XfsResult};

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Active,
    Committed,
    Cancelled,
}

/// Global lock order. The derived ordering sorts every I/O lock before every
/// inode lock before every buffer lock, each group by number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum LockKey {
    Io(Ino),
    Meta(Ino),
    Buf(BlockNumber),
}

#[derive(Clone)]
enum LockTarget {
    Io(Arc<Inode>),
    Meta(Arc<Inode>),
    Buf(Arc<Buf>),
}

/// State needed to undo in-core changes on cancel
enum BeforeImage {
    Inode(InodeCore),
    Buf { data: Vec<u8>, valid: bool },
}

impl LockTarget {
    fn key(&self) -> LockKey {
        match self {
            LockTarget::Io(inode) => LockKey::Io(inode.ino()),
            LockTarget::Meta(inode) => LockKey::Meta(inode.ino()),
            LockTarget::Buf(buf) => LockKey::Buf(buf.blkno()),
        }
    }

    fn lock(&self, mode: LockMode) {
        match self {
            LockTarget::Io(inode) => inode.lock_io(mode),
            LockTarget::Meta(inode) => inode.lock_meta(mode),
            LockTarget::Buf(buf) => buf.lock(mode),
        }
    }

    fn try_lock(&self, mode: LockMode) -> bool {
        match self {
            LockTarget::Io(inode) => inode.try_lock_io(mode),
            LockTarget::Meta(inode) => inode.try_lock_meta(mode),
            LockTarget::Buf(buf) => buf.try_lock(mode),
        }
    }

    fn unlock(&self, mode: LockMode) {
        match self {
            LockTarget::Io(inode) => inode.unlock_io(mode),
            LockTarget::Meta(inode) => inode.unlock_meta(mode),
            LockTarget::Buf(buf) => buf.unlock(mode),
        }
    }

    fn capture(&self) -> Option<BeforeImage> {
        match self {
            LockTarget::Io(_) => None,
            LockTarget::Meta(inode) => Some(BeforeImage::Inode(inode.core())),
            LockTarget::Buf(buf) => Some(BeforeImage::Buf {
                data: buf.data().clone(),
                valid: buf.is_valid(),
            }),
        }
    }
}

struct HeldLock {
    key: LockKey,
    mode: LockMode,
    target: LockTarget,
    before: Option<BeforeImage>,
}

/// A logged object and what changed in it
enum LoggedItem {
    Inode { inode: Arc<Inode>, mask: FieldMask },
    Buf { buf: Arc<Buf>, ranges: RangeSet },
}

impl LoggedItem {
    fn key(&self) -> LockKey {
        match self {
            LoggedItem::Inode { inode, .. } => LockKey::Meta(inode.ino()),
            LoggedItem::Buf { buf, .. } => LockKey::Buf(buf.blkno()),
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            LoggedItem::Inode { inode, mask } => ItemPayload::Inode {
                ino: inode.ino(),
                mask: *mask,
                core: inode.core(),
            }
            .encode(),
            LoggedItem::Buf { buf, ranges } => {
                ItemPayload::buffer(buf.blkno(), &buf.data(), ranges).encode()
            }
        }
    }

    /// Mark the object dirty and hand out its AIL entry
    fn committed(&self) -> AilItem {
        match self {
            LoggedItem::Inode { inode, .. } => {
                inode.mark_dirty();
                AilItem::Inode(Arc::clone(inode))
            }
            LoggedItem::Buf { buf, .. } => {
                buf.mark_dirty();
                AilItem::Buf(Arc::clone(buf))
            }
        }
    }

    fn restore(&self, before: &BeforeImage) {
        match (self, before) {
            (LoggedItem::Inode { inode, .. }, BeforeImage::Inode(core)) => inode.set_core(*core),
            (LoggedItem::Buf { buf, .. }, BeforeImage::Buf { data, valid }) => {
                buf.data().copy_from_slice(data);
                buf.set_valid(*valid);
            }
            _ => {}
        }
    }

    fn unpin(&self) {
        match self {
            LoggedItem::Inode { inode, .. } => inode.unpin(),
            LoggedItem::Buf { buf, .. } => buf.unpin(),
        }
    }
}

/// An in-progress atomic change set.
///
/// Owned by the thread driving one operation. Dropping an active
/// transaction cancels it.
pub struct Transaction {
    mount: Arc<Mount>,
    class: TransClass,
    tid: TransactionId,
    /// Bytes of one log count
    reservation: u64,
    /// Log counts still held; each roll that writes spends one
    counts: u32,
    state: TransState,
    /// In acquisition order
    held: Vec<HeldLock>,
    /// In first-log order
    items: Vec<LoggedItem>,
}

impl Transaction {
    /// Reserve log space for `class` and start a transaction
    pub fn begin(mount: &Arc<Mount>, class: TransClass) -> XfsResult<Self> {
        Self::begin_inner(mount, class, None, false)
    }

    /// Start a transaction that will roll. The whole permanent reservation
    /// (one reservation per log count of the class) is taken up front, so a
    /// roll never waits for log space while holding locks.
    pub fn begin_rolling(mount: &Arc<Mount>, class: TransClass) -> XfsResult<Self> {
        Self::begin_inner(mount, class, None, true)
    }

    /// Like `begin`, but the wait for log space can be interrupted
    pub fn begin_interruptible(
        mount: &Arc<Mount>,
        class: TransClass,
        interrupt: &Interrupt,
    ) -> XfsResult<Self> {
        Self::begin_inner(mount, class, Some(interrupt), false)
    }

    fn begin_inner(
        mount: &Arc<Mount>,
        class: TransClass,
        interrupt: Option<&Interrupt>,
        permanent: bool,
    ) -> XfsResult<Self> {
        if mount.is_shutdown() || mount.is_unmounted() {
            return Err(XfsError::Shutdown);
        }
        let reservation = mount.reservations().reservation(class);
        let counts = if permanent {
            mount.reservations().log_count(class)
        } else {
            1
        };
        if let Err(e) = mount.space().reserve(reservation * counts as u64, interrupt) {
            if matches!(e, XfsError::Interrupted) {
                // An interrupted wait is an abort before anything happened
                mount.update_stats(|s| s.cancelled += 1);
            }
            return Err(e);
        }
        let tid = mount.next_tid();
        mount.update_stats(|s| s.started += 1);
        log::trace!(
            "tid {}: begin {} ({} bytes x {} reserved)",
            tid,
            class,
            reservation,
            counts
        );
        Ok(Self {
            mount: Arc::clone(mount),
            class,
            tid,
            reservation,
            counts,
            state: TransState::Active,
            held: Vec::new(),
            items: Vec::new(),
        })
    }

    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    pub fn class(&self) -> TransClass {
        self.class
    }

    pub fn reservation(&self) -> u64 {
        self.reservation
    }

    /// Log counts left; a roll needs at least two
    pub fn log_counts(&self) -> u32 {
        self.counts
    }

    /// Bytes of log space currently held
    fn held_bytes(&self) -> u64 {
        self.reservation * self.counts as u64
    }

    pub fn state(&self) -> TransState {
        self.state
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// True once anything has been logged
    pub fn is_dirty(&self) -> bool {
        !self.items.is_empty()
    }

    fn check_active(&self) -> XfsResult<()> {
        if self.state != TransState::Active {
            return Err(XfsError::InvalidTransaction(format!(
                "tid {} is {:?}",
                self.tid, self.state
            )));
        }
        Ok(())
    }

    /// Lock an inode into the transaction. The I/O lock is taken before the
    /// inode lock; joining a lock already held is a no-op.
    pub fn join_inode(&mut self, inode: &Arc<Inode>, flags: LockFlags) -> XfsResult<()> {
        self.check_active()?;
        let (io, meta) = (flags.iolock_mode(), flags.ilock_mode());
        if io.is_none() && meta.is_none() {
            return Err(XfsError::InvalidTransaction(format!(
                "join of inode {} without lock flags",
                inode.ino()
            )));
        }
        if let Some(mode) = io {
            self.acquire(LockTarget::Io(Arc::clone(inode)), mode)?;
        }
        if let Some(mode) = meta {
            self.acquire(LockTarget::Meta(Arc::clone(inode)), mode)?;
        }
        Ok(())
    }

    /// Join several inodes in ascending inode number order: all I/O locks
    /// first, then all inode locks
    pub fn join_inodes(&mut self, inodes: &[Arc<Inode>], flags: LockFlags) -> XfsResult<()> {
        self.check_active()?;
        let mut sorted: Vec<&Arc<Inode>> = inodes.iter().collect();
        sorted.sort_by_key(|inode| inode.ino());
        sorted.dedup_by_key(|inode| inode.ino());
        if let Some(mode) = flags.iolock_mode() {
            for inode in &sorted {
                self.acquire(LockTarget::Io(Arc::clone(inode)), mode)?;
            }
        }
        if let Some(mode) = flags.ilock_mode() {
            for inode in &sorted {
                self.acquire(LockTarget::Meta(Arc::clone(inode)), mode)?;
            }
        }
        Ok(())
    }

    /// Lock a buffer exclusively into the transaction
    pub fn join_buf(&mut self, buf: &Arc<Buf>) -> XfsResult<()> {
        self.check_active()?;
        self.acquire(LockTarget::Buf(Arc::clone(buf)), LockMode::Exclusive)
    }

    /// Join the buffer for a block the caller will initialise completely
    pub fn get_buf(&mut self, blkno: BlockNumber) -> XfsResult<Arc<Buf>> {
        let buf = self.mount.bufs().get(blkno)?;
        self.join_buf(&buf)?;
        buf.set_valid(true);
        Ok(buf)
    }

    /// Join the buffer for a block, reading it if needed
    pub fn read_buf(&mut self, blkno: BlockNumber) -> XfsResult<Arc<Buf>> {
        let buf = self.mount.bufs().read(blkno)?;
        self.join_buf(&buf)?;
        Ok(buf)
    }

    fn acquire(&mut self, target: LockTarget, mode: LockMode) -> XfsResult<()> {
        let key = target.key();
        if let Some(held) = self.held.iter().find(|h| h.key == key) {
            if held.mode == LockMode::Shared && mode == LockMode::Exclusive {
                return Err(XfsError::InvalidTransaction(format!(
                    "tid {}: {:?} held shared, cannot upgrade",
                    self.tid, key
                )));
            }
            return Ok(());
        }

        let highest = self.held.iter().map(|h| h.key).max();
        match highest {
            Some(top) if key < top => {
                if !target.try_lock(mode) {
                    if self.is_dirty() {
                        return Err(XfsError::LockOrder(format!(
                            "tid {}: {:?} is contended and sorts below {:?}, with items already logged",
                            self.tid, key, top
                        )));
                    }
                    self.back_off(target, mode);
                    return Ok(());
                }
            }
            _ => target.lock(mode),
        }
        let before = target.capture();
        self.held.push(HeldLock {
            key,
            mode,
            target,
            before,
        });
        Ok(())
    }

    /// Drop every lock above `target`, take `target`, then retake the
    /// dropped ones in canonical order. Only legal while nothing is logged.
    fn back_off(&mut self, target: LockTarget, mode: LockMode) {
        let key = target.key();
        let mut released = Vec::new();
        let mut i = self.held.len();
        while i > 0 {
            i -= 1;
            if self.held[i].key > key {
                let held = self.held.remove(i);
                held.target.unlock(held.mode);
                released.push(held);
            }
        }
        log::debug!(
            "tid {}: backing off {} locks to take {:?}",
            self.tid,
            released.len(),
            key
        );
        self.mount.update_stats(|s| s.lock_backoffs += 1);

        target.lock(mode);
        let before = target.capture();
        self.held.push(HeldLock {
            key,
            mode,
            target,
            before,
        });

        released.sort_by_key(|held| held.key);
        for held in released {
            held.target.lock(held.mode);
            // Someone else may have committed while the lock was dropped
            let before = held.target.capture();
            self.held.push(HeldLock { before, ..held });
        }
    }

    fn held(&self, key: LockKey) -> Option<&HeldLock> {
        self.held.iter().find(|h| h.key == key)
    }

    /// Record that `mask` fields of the inode changed. The inode lock must
    /// be held exclusive.
    pub fn log_inode(&mut self, inode: &Arc<Inode>, mask: FieldMask) -> XfsResult<()> {
        self.check_active()?;
        if mask.is_empty() {
            return Ok(());
        }
        let key = LockKey::Meta(inode.ino());
        match self.held(key) {
            Some(held) if held.mode == LockMode::Exclusive => {}
            _ => {
                return Err(XfsError::InvalidTransaction(format!(
                    "tid {}: inode {} logged without its ilock held exclusive",
                    self.tid,
                    inode.ino()
                )))
            }
        }
        if let Some(LoggedItem::Inode { mask: logged, .. }) =
            self.items.iter_mut().find(|item| item.key() == key)
        {
            *logged |= mask;
            return Ok(());
        }
        inode.pin();
        self.items.push(LoggedItem::Inode {
            inode: Arc::clone(inode),
            mask,
        });
        Ok(())
    }

    /// Record that `range` of the buffer changed. Overlapping and adjacent
    /// ranges coalesce.
    pub fn log_buf(&mut self, buf: &Arc<Buf>, range: Range<usize>) -> XfsResult<()> {
        self.check_active()?;
        let key = LockKey::Buf(buf.blkno());
        if self.held(key).is_none() {
            return Err(XfsError::InvalidTransaction(format!(
                "tid {}: buffer {} logged without being joined",
                self.tid,
                buf.blkno()
            )));
        }
        if range.start >= range.end || range.end > self.mount.bufs().block_size() {
            return Err(XfsError::InvalidInput(format!(
                "range {:?} of buffer {}",
                range,
                buf.blkno()
            )));
        }
        let max_ranges = self.mount.config().max_buffer_ranges as usize;
        if let Some(LoggedItem::Buf { ranges, .. }) =
            self.items.iter_mut().find(|item| item.key() == key)
        {
            ranges.insert(range);
            if ranges.len() > max_ranges {
                ranges.collapse();
            }
            return Ok(());
        }
        buf.pin();
        let mut ranges = RangeSet::new();
        ranges.insert(range);
        self.items.push(LoggedItem::Buf {
            buf: Arc::clone(buf),
            ranges,
        });
        Ok(())
    }

    /// Start record, one record per item, commit record
    fn encode_records(&self) -> Vec<PendingRecord> {
        let payloads: Vec<Vec<u8>> = self.items.iter().map(LoggedItem::payload).collect();

        let crc = items_crc(payloads.iter().map(|p| p.as_slice()));
        let count = payloads.len() as u32;
        let mut records = Vec::with_capacity(payloads.len() + 2);
        records.push(PendingRecord::new(
            RecordType::Start,
            encode_start(self.class.to_u8(), self.reservation),
        ));
        records.extend(
            payloads
                .into_iter()
                .map(|payload| PendingRecord::new(RecordType::Item, payload)),
        );
        records.push(PendingRecord::new(RecordType::Commit, encode_commit(count, crc)));
        records
    }

    /// Write logged items to the log and hand them to the AIL. On any
    /// failure the filesystem is shut down and the in-core changes undone.
    fn write_items(&mut self) -> XfsResult<Option<(Lsn, u64)>> {
        if self.items.is_empty() {
            return Ok(None);
        }
        if self.mount.is_shutdown() {
            self.undo_items();
            return Err(XfsError::Shutdown);
        }

        let records = self.encode_records();
        let lbs = self.mount.config().log_block_size as usize;
        let blocks: u64 = records
            .iter()
            .map(|r| record_blocks(r.payload.len(), lbs) as u64)
            .sum();
        let written = blocks * lbs as u64;
        if written > self.reservation {
            log::error!(
                "tid {} ({}) needs {} log bytes but reserved {}",
                self.tid,
                self.class,
                written,
                self.reservation
            );
            self.mount.shutdown("transaction overran its reservation");
            self.undo_items();
            return Err(XfsError::Overrun {
                reserved: self.reservation,
                needed: written,
            });
        }

        let lsn = {
            let mut log = self.mount.log();
            let lsn = match log.append(self.tid, &records) {
                Ok(lsn) => lsn,
                Err(e) => {
                    drop(log);
                    self.mount.shutdown(&format!("log write failed: {}", e));
                    self.undo_items();
                    return Err(e);
                }
            };
            // Inserted before the log lock drops so a checkpoint cannot move
            // the tail past these records while they are outside the AIL
            for item in &self.items {
                self.mount.ail().insert(lsn, item.committed());
            }
            lsn
        };

        for item in self.items.drain(..) {
            item.unpin();
        }
        self.mount.update_stats(|s| s.log_bytes += written);
        log::trace!("tid {}: committed at {} ({} bytes)", self.tid, lsn, written);
        Ok(Some((lsn, written)))
    }

    /// Put logged objects back the way they were at join time and unpin them
    fn undo_items(&mut self) {
        let items: Vec<LoggedItem> = self.items.drain(..).rev().collect();
        for item in items {
            if let Some(before) = self.held(item.key()).and_then(|held| held.before.as_ref()) {
                item.restore(before);
            }
            item.unpin();
        }
    }

    fn release_locks(&mut self) {
        while let Some(held) = self.held.pop() {
            held.target.unlock(held.mode);
        }
    }

    /// Commit: log the changes, release locks in reverse order, return the
    /// unused reservation. Returns the commit LSN, or None if nothing was
    /// logged.
    pub fn commit(mut self) -> XfsResult<Option<Lsn>> {
        self.check_active()?;
        let result = self.write_items();
        match &result {
            Ok(Some((_, written))) => self.mount.space().commit(self.held_bytes(), *written),
            Ok(None) | Err(_) => self.mount.space().release(self.held_bytes()),
        }
        self.release_locks();
        match &result {
            Ok(Some(_)) => {
                self.state = TransState::Committed;
                self.mount.update_stats(|s| s.committed += 1);
            }
            Ok(None) => {
                self.state = TransState::Committed;
                self.mount.update_stats(|s| {
                    s.committed += 1;
                    s.empty_commits += 1;
                });
            }
            Err(_) => {
                self.state = TransState::Cancelled;
                self.mount.update_stats(|s| s.cancelled += 1);
            }
        }
        result.map(|done| done.map(|(lsn, _)| lsn))
    }

    /// Commit what is logged so far but keep every lock and continue under
    /// a new tid. The written part of the current log count is charged to
    /// the log and the rest of it returned; the next log count is already
    /// held, so this never waits for space. Fails without side effects when
    /// no further log count is held.
    pub fn roll(&mut self) -> XfsResult<Option<Lsn>> {
        self.check_active()?;
        if self.counts < 2 {
            return Err(XfsError::InvalidTransaction(format!(
                "tid {} ({}) has no log count left to roll into",
                self.tid, self.class
            )));
        }
        let lsn = match self.write_items() {
            Ok(Some((lsn, written))) => {
                self.mount.space().commit(self.reservation, written);
                self.counts -= 1;
                Some(lsn)
            }
            Ok(None) => None,
            Err(e) => {
                self.mount.space().release(self.held_bytes());
                self.abandon();
                return Err(e);
            }
        };

        let old = self.tid;
        self.tid = self.mount.next_tid();
        for held in &mut self.held {
            held.before = held.target.capture();
        }
        self.mount.update_stats(|s| {
            s.committed += 1;
            s.rolled += 1;
        });
        log::debug!(
            "tid {} rolled into tid {} ({} log counts left)",
            old,
            self.tid,
            self.counts
        );
        Ok(lsn)
    }

    /// Tear down after a failed roll, when the reservation is already gone
    fn abandon(&mut self) {
        self.release_locks();
        self.counts = 0;
        self.state = TransState::Cancelled;
        self.mount.update_stats(|s| s.cancelled += 1);
    }

    /// Discard every logged change, release locks, return the reservation
    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        if self.state != TransState::Active {
            return;
        }
        if self.is_dirty() {
            log::debug!("tid {}: cancelling {} logged items", self.tid, self.items.len());
        }
        self.undo_items();
        self.release_locks();
        self.mount.space().release(self.held_bytes());
        self.state = TransState::Cancelled;
        self.mount.update_stats(|s| s.cancelled += 1);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("class", &self.class)
            .field("state", &self.state)
            .field("reservation", &self.reservation)
            .field("counts", &self.counts)
            .field("held", &self.held.iter().map(|h| h.key).collect::<Vec<_>>())
            .field("items", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BlockDevice;
    use crate::item::ItemPayload;
    use crate::test_utils::{small_config, MemFs};
    use crate::wal::{LogReader, RecordRead};
    use std::thread;
    use std::time::Duration;
    use xfstx_core::MountConfig;

    const SCRATCH: BlockNumber = 100;

    #[test]
    fn test_commit_inserts_into_ail() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let inode = mount.inodes().get(2).unwrap();

        let mut tp = mount.trans_alloc(TransClass::Create).unwrap();
        tp.join_inode(&inode, LockFlags::ILOCK_EXCL).unwrap();
        let buf = tp.get_buf(SCRATCH).unwrap();
        buf.write_at(8, b"metadata");
        tp.log_buf(&buf, 8..16).unwrap();
        inode.update(|core| core.uid = 42);
        tp.log_inode(&inode, FieldMask::UID).unwrap();
        let lsn = tp.commit().unwrap().unwrap();

        assert!(buf.is_dirty() && !buf.is_pinned() && !buf.is_locked());
        assert!(inode.is_dirty() && !inode.is_pinned() && !inode.is_meta_locked());
        assert_eq!(mount.ail().len(), 2);
        assert_eq!(mount.ail().min_lsn(), Some(lsn));

        // Only the written blocks stay charged until a checkpoint
        let used = mount.space().used_bytes();
        assert!(used > 0);
        assert_eq!(mount.space().reserved_bytes(), 0);
        mount.checkpoint().unwrap();
        assert!(mount.ail().is_empty());
        assert_eq!(mount.space().free_bytes(), mount.space().total_bytes());
        assert_eq!(&fs.data.read_block(SCRATCH).unwrap()[8..16], b"metadata");
    }

    #[test]
    fn test_empty_commit_returns_reservation() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let free = mount.space().free_bytes();

        let mut tp = mount.trans_alloc(TransClass::Setattr).unwrap();
        let inode = mount.inodes().get(3).unwrap();
        tp.join_inode(&inode, LockFlags::ILOCK_SHARED).unwrap();
        assert!(inode.is_meta_locked());
        assert_eq!(tp.commit().unwrap(), None);

        assert!(!inode.is_meta_locked());
        assert_eq!(mount.space().free_bytes(), free);
        assert_eq!(mount.stats().transactions.empty_commits, 1);
    }

    #[test]
    fn test_cancel_restores_before_images() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let free = mount.space().free_bytes();
        let inode = mount.inodes().get(2).unwrap();
        let before = inode.core();

        let mut tp = mount.trans_alloc(TransClass::Write).unwrap();
        tp.join_inode(&inode, LockFlags::ILOCK_EXCL).unwrap();
        let buf = tp.read_buf(SCRATCH).unwrap();
        buf.write_at(0, &[0xAB; 32]);
        tp.log_buf(&buf, 0..32).unwrap();
        inode.update(|core| core.size = 4096);
        tp.log_inode(&inode, FieldMask::SIZE).unwrap();
        assert!(buf.is_pinned());
        tp.cancel();

        assert_eq!(inode.core(), before);
        assert_eq!(&buf.data()[..32], &[0u8; 32]);
        assert!(!buf.is_dirty() && !buf.is_pinned() && !buf.is_locked());
        assert!(mount.ail().is_empty());
        assert_eq!(mount.space().free_bytes(), free);
    }

    #[test]
    fn test_drop_cancels() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let free = mount.space().free_bytes();
        {
            let mut tp = mount.trans_alloc(TransClass::Sb).unwrap();
            let buf = tp.read_buf(SCRATCH).unwrap();
            buf.write_at(0, b"lost");
            tp.log_buf(&buf, 0..4).unwrap();
        }
        assert_eq!(mount.space().free_bytes(), free);
        assert_eq!(mount.stats().transactions.cancelled, 1);
        assert_eq!(&mount.bufs().read(SCRATCH).unwrap().data()[..4], &[0u8; 4]);
    }

    #[test]
    fn test_log_requires_locks() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let inode = mount.inodes().get(2).unwrap();
        let buf = mount.bufs().read(SCRATCH).unwrap();

        let mut tp = mount.trans_alloc(TransClass::Setattr).unwrap();
        assert!(matches!(
            tp.log_inode(&inode, FieldMask::MODE),
            Err(XfsError::InvalidTransaction(_))
        ));
        tp.join_inode(&inode, LockFlags::ILOCK_SHARED).unwrap();
        assert!(matches!(
            tp.log_inode(&inode, FieldMask::MODE),
            Err(XfsError::InvalidTransaction(_))
        ));
        assert!(matches!(
            tp.join_inode(&inode, LockFlags::ILOCK_EXCL),
            Err(XfsError::InvalidTransaction(_))
        ));
        assert!(matches!(
            tp.log_buf(&buf, 0..4),
            Err(XfsError::InvalidTransaction(_))
        ));
        tp.join_buf(&buf).unwrap();
        assert!(matches!(
            tp.log_buf(&buf, 500..600),
            Err(XfsError::InvalidInput(_))
        ));
        tp.cancel();
    }

    #[test]
    fn test_too_many_ranges_collapse() {
        let config = MountConfig {
            max_buffer_ranges: 2,
            ..small_config()
        };
        let fs = MemFs::new(config);
        let mount = fs.mount();

        let mut tp = mount.trans_alloc(TransClass::Write).unwrap();
        let buf = tp.read_buf(SCRATCH).unwrap();
        for offset in [0usize, 100, 200] {
            buf.write_at(offset, &[1u8; 4]);
            tp.log_buf(&buf, offset..offset + 4).unwrap();
        }
        let lsn = tp.commit().unwrap().unwrap();

        let lbs = mount.config().log_block_size as usize;
        let start_blocks = record_blocks(16, lbs);
        let reader = LogReader::new(Arc::new(fs.log.clone()), mount.config().log_blocks, None);
        let record = match reader.read_record(lsn.advance(start_blocks, mount.config().log_blocks)) {
            Ok(RecordRead::Valid(record)) => record,
            other => panic!("item record not readable: {:?}", other.map(|_| ())),
        };
        match ItemPayload::decode(&record.payload).unwrap() {
            ItemPayload::Buf { ranges, .. } => {
                assert_eq!(ranges.len(), 1);
                assert_eq!(ranges[0].0, 0);
                assert_eq!(ranges[0].1.len(), 204);
            }
            other => panic!("unexpected item {}", other.describe()),
        }
    }

    #[test]
    fn test_roll_keeps_locks() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let inode = mount.inodes().get(5).unwrap();

        let mut tp = mount.trans_alloc_rolling(TransClass::Truncate).unwrap();
        tp.join_inode(&inode, LockFlags::IOLOCK_EXCL | LockFlags::ILOCK_EXCL)
            .unwrap();
        inode.update(|core| core.size = 100);
        tp.log_inode(&inode, FieldMask::SIZE).unwrap();
        let first_tid = tp.tid();
        let first = tp.roll().unwrap().unwrap();

        assert_ne!(tp.tid(), first_tid);
        assert!(inode.is_meta_exclusive() && inode.is_io_locked());
        assert!(!tp.is_dirty());
        assert_eq!(tp.state(), TransState::Active);

        inode.update(|core| core.size = 0);
        tp.log_inode(&inode, FieldMask::SIZE).unwrap();
        let second = tp.commit().unwrap().unwrap();
        assert!(second > first);
        assert!(!inode.is_meta_locked() && !inode.is_io_locked());
        assert_eq!(mount.ail().lsn_of(crate::ail::ItemKey::Inode(5)), Some(second));
        assert_eq!(mount.stats().transactions.rolled, 1);
    }

    #[test]
    fn test_roll_spends_one_log_count() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let inode = mount.inodes().get(6).unwrap();
        let unit = mount.reservations().reservation(TransClass::Truncate);
        assert_eq!(mount.reservations().log_count(TransClass::Truncate), 2);

        // A plain transaction holds a single count and cannot roll
        let mut plain = mount.trans_alloc(TransClass::Truncate).unwrap();
        assert_eq!(plain.log_counts(), 1);
        assert!(matches!(plain.roll(), Err(XfsError::InvalidTransaction(_))));
        assert_eq!(plain.state(), TransState::Active);
        plain.cancel();
        assert_eq!(mount.space().reserved_bytes(), 0);

        let mut tp = mount.trans_alloc_rolling(TransClass::Truncate).unwrap();
        assert_eq!(mount.space().reserved_bytes(), 2 * unit);
        tp.join_inode(&inode, LockFlags::ILOCK_EXCL).unwrap();
        inode.update(|core| core.size = 10);
        tp.log_inode(&inode, FieldMask::SIZE).unwrap();
        tp.roll().unwrap().unwrap();

        // The written part moved to the log, the rest of that count came back
        assert_eq!(tp.log_counts(), 1);
        assert_eq!(mount.space().reserved_bytes(), unit);
        // Start, inode and commit records, one block each
        assert_eq!(mount.space().used_bytes(), 3 * 512);

        assert!(matches!(tp.roll(), Err(XfsError::InvalidTransaction(_))));
        assert!(inode.is_meta_exclusive());
        assert_eq!(tp.commit().unwrap(), None);
        assert_eq!(mount.space().reserved_bytes(), 0);
        assert!(!inode.is_meta_locked());
    }

    #[test]
    fn test_out_of_order_join_backs_off() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let inode = mount.inodes().get(7).unwrap();
        inode.lock_meta(LockMode::Exclusive);

        let worker = {
            let mount = Arc::clone(&mount);
            let inode = Arc::clone(&inode);
            thread::spawn(move || {
                let mut tp = mount.trans_alloc(TransClass::Write).unwrap();
                let buf = tp.read_buf(SCRATCH).unwrap();
                // Sorts below the buffer and is contended: back off
                tp.join_inode(&inode, LockFlags::ILOCK_EXCL).unwrap();
                assert!(inode.is_meta_exclusive() && buf.is_locked());
                buf.write_at(0, b"ok");
                tp.log_buf(&buf, 0..2).unwrap();
                tp.commit().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        inode.unlock_meta(LockMode::Exclusive);
        worker.join().unwrap();
        assert_eq!(mount.stats().transactions.lock_backoffs, 1);
    }

    #[test]
    fn test_out_of_order_join_after_logging_fails() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let inode = mount.inodes().get(7).unwrap();
        inode.lock_meta(LockMode::Exclusive);

        let mut tp = mount.trans_alloc(TransClass::Write).unwrap();
        let buf = tp.read_buf(SCRATCH).unwrap();
        buf.write_at(0, b"x");
        tp.log_buf(&buf, 0..1).unwrap();
        assert!(matches!(
            tp.join_inode(&inode, LockFlags::ILOCK_EXCL),
            Err(XfsError::LockOrder(_))
        ));
        tp.cancel();
        inode.unlock_meta(LockMode::Exclusive);
        assert!(!buf.is_locked());
    }

    #[test]
    fn test_begin_after_shutdown_fails() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        mount.shutdown("test");
        assert!(matches!(
            mount.trans_alloc(TransClass::Create),
            Err(XfsError::Shutdown)
        ));
    }
}
