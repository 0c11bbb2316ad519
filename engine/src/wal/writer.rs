// Log writer
// The single append cursor: lays records down at the head of the circular log

use super::format::{
    payload_capacity, BlockPrefix, RecordHeader, RecordType, BLOCK_KIND_HEADER,
    BLOCK_KIND_PAYLOAD, BLOCK_KIND_STALE, LOG_BLOCK_PREFIX,
};
use crate::device::BlockDevice;
use crate::types::{Lsn, TransactionId};
use std::sync::Arc;
use uuid::Uuid;
use xfstx_core::XfsResult;

/// A record waiting to be appended
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub rtype: RecordType,
    pub payload: Vec<u8>,
}

impl PendingRecord {
    pub fn new(rtype: RecordType, payload: Vec<u8>) -> Self {
        Self { rtype, payload }
    }
}

/// Appends records at the log head. Callers serialise access with a mutex,
/// which makes the append order the commit order.
pub struct LogWriter {
    dev: Arc<dyn BlockDevice>,
    log_blocks: u32,
    uuid: Uuid,
    /// Next block to write
    head: Lsn,
    /// Oldest block still needed by recovery
    tail: Lsn,
    blocks_written: u64,
}

impl LogWriter {
    /// Resume appending at `head` with an empty log
    pub fn new(dev: Arc<dyn BlockDevice>, log_blocks: u32, uuid: Uuid, head: Lsn) -> Self {
        Self {
            dev,
            log_blocks,
            uuid,
            head,
            tail: head,
            blocks_written: 0,
        }
    }

    /// Zero the whole log and write an unmount record at (1, 0)
    pub fn format(dev: Arc<dyn BlockDevice>, log_blocks: u32, uuid: Uuid) -> XfsResult<Self> {
        let zero = vec![0u8; dev.block_size()];
        for block in 0..log_blocks as u64 {
            dev.write_block(block, &zero)?;
        }
        let mut writer = Self::new(dev, log_blocks, uuid, Lsn::new(1, 0));
        writer.write_unmount()?;
        log::info!("Formatted log of {} blocks", log_blocks);
        Ok(writer)
    }

    pub fn head(&self) -> Lsn {
        self.head
    }

    pub fn tail(&self) -> Lsn {
        self.tail
    }

    pub fn log_blocks(&self) -> u32 {
        self.log_blocks
    }

    pub fn block_size(&self) -> usize {
        self.dev.block_size()
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    /// Move the tail forward after a checkpoint. Returns the blocks freed.
    pub fn advance_tail(&mut self, new_tail: Lsn) -> u64 {
        if new_tail <= self.tail {
            return 0;
        }
        let new_tail = new_tail.min(self.head);
        let freed = self.tail.blocks_until(new_tail, self.log_blocks);
        self.tail = new_tail;
        freed
    }

    /// Blocks between tail and head
    pub fn used_blocks(&self) -> u64 {
        self.tail.blocks_until(self.head, self.log_blocks)
    }

    /// Append one transaction's records and sync the log device.
    /// Returns the LSN of the first record.
    pub fn append(&mut self, tid: TransactionId, records: &[PendingRecord]) -> XfsResult<Lsn> {
        let first = self.head;
        let mut pos = self.head;
        for record in records {
            pos = self.write_record(pos, record.rtype, tid, &record.payload)?;
        }
        self.dev.sync()?;
        self.head = pos;
        log::trace!(
            "tid {}: appended {} records at {}, head now {}",
            tid,
            records.len(),
            first,
            self.head
        );
        Ok(first)
    }

    /// Write an unmount record: the log is empty, tail = head afterwards
    pub fn write_unmount(&mut self) -> XfsResult<Lsn> {
        let lsn = self.head;
        // The record names itself as tail, which marks the log clean
        self.tail = lsn;
        let next = self.write_record(lsn, RecordType::Unmount, 0, &[])?;
        self.dev.sync()?;
        self.head = next;
        self.tail = next;
        log::debug!("Unmount record written at {}", lsn);
        Ok(lsn)
    }

    /// Restamp blocks from the head up to `until` with the previous cycle so
    /// that a later head search does not mistake leftovers of a torn write
    /// for live records.
    pub fn clear_stale(&mut self, until: Lsn) -> XfsResult<u64> {
        let count = self.head.blocks_until(until, self.log_blocks);
        let mut block = vec![0u8; self.dev.block_size()];
        for i in 0..count {
            let pos = self.head.advance(i as u32, self.log_blocks);
            BlockPrefix {
                cycle: pos.cycle().saturating_sub(1),
                kind: BLOCK_KIND_STALE,
            }
            .write_into(&mut block);
            self.dev.write_block(pos.block() as u64, &block)?;
        }
        if count > 0 {
            self.dev.sync()?;
            log::debug!("Cleared {} stale log blocks after {}", count, self.head);
        }
        Ok(count)
    }

    /// Write one record at `pos`, returning the position after it
    fn write_record(
        &mut self,
        pos: Lsn,
        rtype: RecordType,
        tid: TransactionId,
        payload: &[u8],
    ) -> XfsResult<Lsn> {
        let block_size = self.dev.block_size();
        let header = RecordHeader::new(rtype, tid, pos, self.tail, payload, self.uuid, block_size);

        let mut block = vec![0u8; block_size];
        BlockPrefix {
            cycle: pos.cycle(),
            kind: BLOCK_KIND_HEADER,
        }
        .write_into(&mut block);
        let header_bytes = header.encode();
        let body = LOG_BLOCK_PREFIX + header_bytes.len();
        block[LOG_BLOCK_PREFIX..body].copy_from_slice(&header_bytes);
        if header.is_inline() {
            block[body..body + payload.len()].copy_from_slice(payload);
        }
        self.dev.write_block(pos.block() as u64, &block)?;
        self.blocks_written += 1;

        let mut next = pos.advance(1, self.log_blocks);
        if !header.is_inline() {
            for chunk in payload.chunks(payload_capacity(block_size)) {
                block.fill(0);
                BlockPrefix {
                    cycle: next.cycle(),
                    kind: BLOCK_KIND_PAYLOAD,
                }
                .write_into(&mut block);
                block[LOG_BLOCK_PREFIX..LOG_BLOCK_PREFIX + chunk.len()].copy_from_slice(chunk);
                self.dev.write_block(next.block() as u64, &block)?;
                self.blocks_written += 1;
                next = next.advance(1, self.log_blocks);
            }
        }
        Ok(next)
    }
}
