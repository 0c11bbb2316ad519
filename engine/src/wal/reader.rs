// Log reader
// Physical access to records: head search, record validation, backward walk

use super::format::{
    payload_capacity, BlockPrefix, RecordHeader, BLOCK_KIND_HEADER, BLOCK_KIND_PAYLOAD,
    LOG_BLOCK_PREFIX, RECORD_HEADER_SIZE,
};
use crate::device::BlockDevice;
use crate::types::Lsn;
use std::sync::Arc;
use uuid::Uuid;
use xfstx_core::{XfsError, XfsResult};

/// A record read back from the log
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// Position just past the record
    pub fn end(&self, log_blocks: u32) -> Lsn {
        self.header.lsn.advance(self.header.total_blocks(), log_blocks)
    }
}

/// Outcome of reading a record at a given position
#[derive(Debug)]
pub enum RecordRead {
    Valid(LogRecord),
    /// Not a usable record; the reason is kept for diagnostics
    Invalid(String),
}

pub struct LogReader {
    dev: Arc<dyn BlockDevice>,
    log_blocks: u32,
    /// Records stamped with another filesystem's UUID are rejected
    uuid: Option<Uuid>,
}

impl LogReader {
    pub fn new(dev: Arc<dyn BlockDevice>, log_blocks: u32, uuid: Option<Uuid>) -> Self {
        Self {
            dev,
            log_blocks,
            uuid,
        }
    }

    pub fn log_blocks(&self) -> u32 {
        self.log_blocks
    }

    pub fn prefix(&self, block: u32) -> XfsResult<BlockPrefix> {
        Ok(BlockPrefix::read_from(&self.dev.read_block(block as u64)?))
    }

    /// Locate the head: the first block whose cycle stamp differs from
    /// block 0's. Stamps are monotone (current cycle, then the previous
    /// one), so a binary search finds the boundary. If every block carries
    /// the same cycle the log ended exactly at the last block.
    pub fn find_head(&self) -> XfsResult<Lsn> {
        let first_cycle = self.prefix(0)?.cycle;
        if first_cycle == 0 {
            return Err(XfsError::RecoveryFailed("log is not formatted".to_string()));
        }
        let last_cycle = self.prefix(self.log_blocks - 1)?.cycle;
        if last_cycle == first_cycle {
            return Ok(Lsn::new(first_cycle + 1, 0));
        }

        // Invariant: block `lo` carries first_cycle, block `hi` does not
        let (mut lo, mut hi) = (0u32, self.log_blocks - 1);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.prefix(mid)?.cycle == first_cycle {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(Lsn::new(first_cycle, hi))
    }

    /// Read and fully validate the record whose header should sit at `lsn`
    pub fn read_record(&self, lsn: Lsn) -> XfsResult<RecordRead> {
        let block = self.dev.read_block(lsn.block() as u64)?;
        let prefix = BlockPrefix::read_from(&block);
        if prefix.kind != BLOCK_KIND_HEADER {
            return Ok(RecordRead::Invalid(format!("block {} is not a record header", lsn)));
        }
        if prefix.cycle != lsn.cycle() {
            return Ok(RecordRead::Invalid(format!(
                "block {} stamped with cycle {}",
                lsn, prefix.cycle
            )));
        }
        let header = match RecordHeader::decode(&block[LOG_BLOCK_PREFIX..]) {
            Ok(header) => header,
            Err(e) => return Ok(RecordRead::Invalid(format!("{}: {}", lsn, e))),
        };
        if header.lsn != lsn {
            return Ok(RecordRead::Invalid(format!(
                "header at {} claims lsn {}",
                lsn, header.lsn
            )));
        }
        if let Some(uuid) = self.uuid {
            if header.uuid != uuid {
                return Ok(RecordRead::Invalid(format!(
                    "record at {} belongs to filesystem {}",
                    lsn, header.uuid
                )));
            }
        }
        if header.total_blocks() > self.log_blocks {
            return Ok(RecordRead::Invalid(format!(
                "record at {} spans {} blocks",
                lsn,
                header.total_blocks()
            )));
        }

        let block_size = self.dev.block_size();
        let len = header.payload_len as usize;
        let payload = if header.is_inline() {
            let start = LOG_BLOCK_PREFIX + RECORD_HEADER_SIZE;
            if start + len > block_size {
                return Ok(RecordRead::Invalid(format!(
                    "inline payload of {} bytes at {} overflows the block",
                    len, lsn
                )));
            }
            block[start..start + len].to_vec()
        } else {
            if (header.payload_blocks as usize) * payload_capacity(block_size) < len {
                return Ok(RecordRead::Invalid(format!(
                    "record at {} too short for its payload",
                    lsn
                )));
            }
            let mut payload = Vec::with_capacity(len);
            let mut pos = lsn;
            for _ in 0..header.payload_blocks {
                pos = pos.advance(1, self.log_blocks);
                let data = self.dev.read_block(pos.block() as u64)?;
                let prefix = BlockPrefix::read_from(&data);
                if prefix.kind != BLOCK_KIND_PAYLOAD || prefix.cycle != pos.cycle() {
                    return Ok(RecordRead::Invalid(format!(
                        "payload block {} of record {} is stale",
                        pos, lsn
                    )));
                }
                let take = (len - payload.len()).min(payload_capacity(block_size));
                payload.extend_from_slice(&data[LOG_BLOCK_PREFIX..LOG_BLOCK_PREFIX + take]);
            }
            payload
        };

        if crc32c::crc32c(&payload) != header.payload_crc {
            return Ok(RecordRead::Invalid(format!("payload checksum mismatch at {}", lsn)));
        }
        Ok(RecordRead::Valid(LogRecord { header, payload }))
    }

    /// Walk backwards from `head` to the last valid record that ends at or
    /// before it
    pub fn last_record_before(&self, head: Lsn) -> XfsResult<Option<LogRecord>> {
        let mut pos = head;
        for _ in 0..self.log_blocks {
            pos = retreat(pos, self.log_blocks);
            if pos.cycle() == 0 {
                break;
            }
            let prefix = self.prefix(pos.block())?;
            if prefix.kind != BLOCK_KIND_HEADER || prefix.cycle != pos.cycle() {
                continue;
            }
            if let RecordRead::Valid(record) = self.read_record(pos)? {
                if record.end(self.log_blocks) <= head {
                    return Ok(Some(record));
                }
                log::debug!("Record at {} runs past head {}, skipping", pos, head);
            }
        }
        Ok(None)
    }
}

/// The LSN one block before `lsn`
fn retreat(lsn: Lsn, log_blocks: u32) -> Lsn {
    if lsn.block() == 0 {
        Lsn::new(lsn.cycle().saturating_sub(1), log_blocks - 1)
    } else {
        Lsn::new(lsn.cycle(), lsn.block() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::wal::format::RecordType;
    use crate::wal::writer::{LogWriter, PendingRecord};

    fn setup(blocks: u32) -> (MemDevice, LogWriter, LogReader, Uuid) {
        let dev = MemDevice::new(512, blocks as u64);
        let uuid = Uuid::new_v4();
        let writer = LogWriter::format(Arc::new(dev.clone()), blocks, uuid).unwrap();
        let reader = LogReader::new(Arc::new(dev.clone()), blocks, Some(uuid));
        (dev, writer, reader, uuid)
    }

    fn item(len: usize) -> PendingRecord {
        PendingRecord::new(RecordType::Item, vec![0xC3; len])
    }

    #[test]
    fn test_head_after_format() {
        let (_dev, _writer, reader, _) = setup(32);
        assert_eq!(reader.find_head().unwrap(), Lsn::new(1, 1));
    }

    #[test]
    fn test_head_after_wrap() {
        let (_dev, mut writer, reader, _) = setup(16);
        for tid in 1..=4 {
            writer.append(tid, &[item(1000)]).unwrap();
        }
        // 1 + 4 * 3 = 13, then 3 more wrap to block 2 of cycle 2
        writer.append(5, &[item(1000)]).unwrap();
        assert_eq!(writer.head(), Lsn::new(2, 0));
        writer.append(6, &[item(1000)]).unwrap();
        assert_eq!(writer.head(), Lsn::new(2, 3));
        assert_eq!(reader.find_head().unwrap(), writer.head());
    }

    #[test]
    fn test_head_when_log_ends_at_last_block() {
        let (_dev, mut writer, reader, _) = setup(16);
        for tid in 1..=5 {
            writer.append(tid, &[item(1000)]).unwrap();
        }
        assert_eq!(writer.head(), Lsn::new(2, 0));
        assert_eq!(reader.find_head().unwrap(), Lsn::new(2, 0));
    }

    #[test]
    fn test_read_record_and_payload_checks() {
        let (dev, mut writer, reader, _) = setup(32);
        let lsn = writer.append(7, &[item(700)]).unwrap();
        match reader.read_record(lsn).unwrap() {
            RecordRead::Valid(record) => {
                assert_eq!(record.header.tid, 7);
                assert_eq!(record.payload, vec![0xC3; 700]);
                assert_eq!(record.end(32), writer.head());
            }
            RecordRead::Invalid(reason) => panic!("unexpected: {}", reason),
        }

        // Damage the payload block
        dev.corrupt_byte(lsn.block() as u64 + 1, 100);
        assert!(matches!(reader.read_record(lsn).unwrap(), RecordRead::Invalid(_)));
    }

    #[test]
    fn test_foreign_uuid_rejected() {
        let (dev, mut writer, _reader, _) = setup(32);
        let lsn = writer.append(1, &[item(10)]).unwrap();
        let other = LogReader::new(Arc::new(dev), 32, Some(Uuid::new_v4()));
        assert!(matches!(other.read_record(lsn).unwrap(), RecordRead::Invalid(_)));
    }

    #[test]
    fn test_backward_walk_skips_torn_record() {
        let (dev, mut writer, reader, _) = setup(32);
        let good = writer.append(1, &[item(10)]).unwrap();
        // Header makes it, the second payload block does not
        dev.fail_after(2);
        assert!(writer.append(2, &[item(1000)]).is_err());
        dev.heal();

        let head = reader.find_head().unwrap();
        assert_eq!(head, Lsn::new(1, 4));
        let last = reader.last_record_before(head).unwrap().unwrap();
        assert_eq!(last.header.lsn, good);
    }
}
