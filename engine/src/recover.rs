// Log recovery
// Scan the log for committed transactions, replay them, then leave the log empty

use crate::device::BlockDevice;
use crate::inode::{inode_location, InodeCore, INODE_CORE_SIZE};
use crate::item::ItemPayload;
use crate::types::{FieldMask, Lsn, TransactionId};
use crate::wal::format::{decode_commit, decode_start, items_crc, BLOCK_KIND_HEADER};
use crate::wal::{LogReader, LogRecord, LogWriter, RecordRead, RecordType};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;
use xfstx_core::{MountConfig, XfsError, XfsResult};

/// Recovery phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    /// Locate head and tail, collect complete transactions
    Scan,
    /// Apply them oldest first
    Replay,
    /// Write results home and empty the log
    Done,
}

/// Recovery statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryStats {
    /// The log ended with an unmount record; nothing to replay
    pub clean: bool,
    pub tail: Lsn,
    pub head: Lsn,
    pub records_scanned: u64,
    pub transactions_found: u64,
    pub transactions_replayed: u64,
    /// Started but never committed (torn at the head)
    pub transactions_skipped: u64,
    pub items_replayed: u64,
    pub inode_items: u64,
    pub buffer_items: u64,
    pub blocks_written: u64,
    /// An invalid record at the head was discarded
    pub torn_tail: bool,
    pub max_tid: TransactionId,
}

/// What mount needs to resume logging
#[derive(Debug)]
pub struct RecoveryOutcome {
    /// First free log block; the log is empty (tail = head)
    pub head: Lsn,
    pub stats: RecoveryStats,
}

/// A transaction whose start and commit records were both found intact
#[derive(Debug)]
struct CommittedTrans {
    tid: TransactionId,
    lsn: Lsn,
    items: Vec<ItemPayload>,
}

#[derive(Debug)]
struct OpenTrans {
    items: Vec<Vec<u8>>,
}

struct ScanResult {
    /// Where logging resumes: the end of the last complete commit
    head: Lsn,
    /// Head as found from the cycle stamps
    physical_head: Lsn,
    committed: Vec<CommittedTrans>,
}

pub struct LogRecovery {
    config: MountConfig,
    data_dev: Arc<dyn BlockDevice>,
    log_dev: Arc<dyn BlockDevice>,
    reader: LogReader,
    uuid: Uuid,
    state: RecoveryState,
    stats: RecoveryStats,
}

impl LogRecovery {
    pub fn new(
        config: &MountConfig,
        uuid: Uuid,
        data_dev: Arc<dyn BlockDevice>,
        log_dev: Arc<dyn BlockDevice>,
    ) -> Self {
        Self {
            config: config.clone(),
            reader: LogReader::new(Arc::clone(&log_dev), config.log_blocks, Some(uuid)),
            data_dev,
            log_dev,
            uuid,
            state: RecoveryState::Scan,
            stats: RecoveryStats::default(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Run Scan -> Replay -> Done
    pub fn run(mut self) -> XfsResult<RecoveryOutcome> {
        log::info!("Starting log recovery");
        let scan = self.scan()?;
        if self.stats.clean {
            log::info!("Log is clean at {}", scan.head);
            self.state = RecoveryState::Done;
            return Ok(RecoveryOutcome {
                head: scan.head,
                stats: self.stats,
            });
        }

        self.state = RecoveryState::Replay;
        let blocks = self.replay(&scan.committed)?;

        self.state = RecoveryState::Done;
        let head = self.finish(&scan, blocks)?;
        log::info!(
            "Recovery complete: {} transactions replayed, {} skipped, {} blocks written",
            self.stats.transactions_replayed,
            self.stats.transactions_skipped,
            self.stats.blocks_written
        );
        Ok(RecoveryOutcome {
            head,
            stats: self.stats,
        })
    }

    fn scan(&mut self) -> XfsResult<ScanResult> {
        let log_blocks = self.config.log_blocks;
        let physical_head = self.reader.find_head()?;
        let last = self
            .reader
            .last_record_before(physical_head)?
            .ok_or_else(|| XfsError::RecoveryFailed("no valid record in the log".to_string()))?;

        let tail = last.header.tail_lsn;
        if tail > last.header.lsn || tail.blocks_until(physical_head, log_blocks) > log_blocks as u64 {
            return Err(XfsError::RecoveryFailed(format!(
                "record at {} names impossible tail {}",
                last.header.lsn, tail
            )));
        }
        self.stats.tail = tail;
        log::debug!("Scan: physical head {}, tail {}", physical_head, tail);

        if last.header.rtype == RecordType::Unmount && last.header.tail_lsn == last.header.lsn {
            self.stats.clean = true;
            self.stats.head = last.end(log_blocks);
            return Ok(ScanResult {
                head: self.stats.head,
                physical_head,
                committed: Vec::new(),
            });
        }

        let mut open: HashMap<TransactionId, OpenTrans> = HashMap::new();
        let mut committed = Vec::new();
        let mut resume = tail;
        let mut pos = tail;

        while pos < physical_head {
            let record = match self.reader.read_record(pos)? {
                RecordRead::Valid(record) if record.end(log_blocks) <= physical_head => record,
                RecordRead::Valid(_) => {
                    self.handle_invalid(pos, physical_head, "record runs past the head")?;
                    break;
                }
                RecordRead::Invalid(reason) => {
                    self.handle_invalid(pos, physical_head, &reason)?;
                    break;
                }
            };
            self.stats.records_scanned += 1;
            let end = record.end(log_blocks);
            if self.absorb(record, &mut open, &mut committed)? {
                resume = end;
            }
            pos = end;
        }

        self.stats.transactions_skipped = open.len() as u64;
        for tid in open.keys() {
            log::warn!("Transaction {} has no commit record, discarding", tid);
        }
        self.stats.head = resume;
        Ok(ScanResult {
            head: resume,
            physical_head,
            committed,
        })
    }

    /// Fold one record into the scan. Returns true if the log is consistent
    /// up to the end of this record (a commit or an unmount).
    fn absorb(
        &mut self,
        record: LogRecord,
        open: &mut HashMap<TransactionId, OpenTrans>,
        committed: &mut Vec<CommittedTrans>,
    ) -> XfsResult<bool> {
        let header = &record.header;
        match header.rtype {
            RecordType::Start => {
                decode_start(&record.payload).map_err(recovery_error)?;
                self.stats.transactions_found += 1;
                self.stats.max_tid = self.stats.max_tid.max(header.tid);
                open.insert(header.tid, OpenTrans { items: Vec::new() });
                log::trace!("tid {} starts at {}", header.tid, header.lsn);
                Ok(false)
            }
            RecordType::Item => {
                match open.get_mut(&header.tid) {
                    Some(trans) => trans.items.push(record.payload),
                    None => log::debug!("Item for unknown tid {} at {}", header.tid, header.lsn),
                }
                Ok(false)
            }
            RecordType::Commit => {
                let Some(trans) = open.remove(&header.tid) else {
                    log::debug!("Commit for unknown tid {} at {}", header.tid, header.lsn);
                    return Ok(false);
                };
                let (count, crc) = decode_commit(&record.payload).map_err(recovery_error)?;
                let actual = items_crc(trans.items.iter().map(|p| p.as_slice()));
                if count as usize != trans.items.len() || crc != actual {
                    return Err(XfsError::RecoveryFailed(format!(
                        "commit of tid {} at {} expects {} items (crc 0x{:08x}), log holds {} (crc 0x{:08x})",
                        header.tid,
                        header.lsn,
                        count,
                        crc,
                        trans.items.len(),
                        actual
                    )));
                }
                let items = trans
                    .items
                    .iter()
                    .map(|payload| ItemPayload::decode(payload))
                    .collect::<XfsResult<Vec<_>>>()
                    .map_err(recovery_error)?;
                committed.push(CommittedTrans {
                    tid: header.tid,
                    lsn: header.lsn,
                    items,
                });
                Ok(true)
            }
            RecordType::Unmount => Ok(true),
        }
    }

    /// An unreadable record is a torn write only if nothing committed
    /// follows it; otherwise the middle of the log is damaged.
    fn handle_invalid(&mut self, pos: Lsn, head: Lsn, reason: &str) -> XfsResult<()> {
        let log_blocks = self.config.log_blocks;
        let mut probe = pos.advance(1, log_blocks);
        while probe < head {
            let prefix = self.reader.prefix(probe.block())?;
            if prefix.kind == BLOCK_KIND_HEADER && prefix.cycle == probe.cycle() {
                if let RecordRead::Valid(later) = self.reader.read_record(probe)? {
                    if later.header.rtype == RecordType::Commit && later.end(log_blocks) <= head {
                        return Err(XfsError::RecoveryFailed(format!(
                            "corrupt record at {} ({}) precedes committed tid {} at {}",
                            pos, reason, later.header.tid, probe
                        )));
                    }
                }
            }
            probe = probe.advance(1, log_blocks);
        }
        log::warn!("Torn write at {}: {}; truncating log", pos, reason);
        self.stats.torn_tail = true;
        Ok(())
    }

    /// Apply committed transactions in log order to copies of their blocks
    fn replay(&mut self, committed: &[CommittedTrans]) -> XfsResult<BTreeMap<u64, Vec<u8>>> {
        let mut blocks: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        let block_size = self.data_dev.block_size();

        for trans in committed {
            log::debug!(
                "Replaying tid {} from {} ({} items)",
                trans.tid,
                trans.lsn,
                trans.items.len()
            );
            for item in &trans.items {
                match item {
                    ItemPayload::Inode { ino, mask, core } => {
                        if *ino == 0 || *ino >= self.config.inode_count as u64 {
                            return Err(XfsError::RecoveryFailed(format!(
                                "tid {} logs inode {} outside the inode table",
                                trans.tid, ino
                            )));
                        }
                        let (blkno, offset) = inode_location(&self.config, *ino);
                        let data = self.block(&mut blocks, blkno)?;
                        let slot = &mut data[offset..offset + INODE_CORE_SIZE];
                        let mut current = match InodeCore::decode(*ino, slot) {
                            Ok(current) => current,
                            Err(_) if *mask == FieldMask::ALL => InodeCore {
                                ino: *ino,
                                ..Default::default()
                            },
                            Err(e) => return Err(recovery_error(e)),
                        };
                        current.copy_fields(core, *mask);
                        slot.copy_from_slice(&current.encode());
                        self.stats.inode_items += 1;
                    }
                    ItemPayload::Buf { blkno, ranges } => {
                        if *blkno >= self.data_dev.block_count() {
                            return Err(XfsError::RecoveryFailed(format!(
                                "tid {} logs block {} beyond the device",
                                trans.tid, blkno
                            )));
                        }
                        let data = self.block(&mut blocks, *blkno)?;
                        for (offset, bytes) in ranges {
                            let start = *offset as usize;
                            if start + bytes.len() > block_size {
                                return Err(XfsError::RecoveryFailed(format!(
                                    "tid {} logs bytes {}..{} of block {}",
                                    trans.tid,
                                    start,
                                    start + bytes.len(),
                                    blkno
                                )));
                            }
                            data[start..start + bytes.len()].copy_from_slice(bytes);
                        }
                        self.stats.buffer_items += 1;
                    }
                }
                self.stats.items_replayed += 1;
            }
            self.stats.transactions_replayed += 1;
        }
        Ok(blocks)
    }

    fn block<'a>(
        &self,
        blocks: &'a mut BTreeMap<u64, Vec<u8>>,
        blkno: u64,
    ) -> XfsResult<&'a mut Vec<u8>> {
        if !blocks.contains_key(&blkno) {
            let data = self.data_dev.read_block(blkno)?;
            blocks.insert(blkno, data);
        }
        blocks
            .get_mut(&blkno)
            .ok_or_else(|| XfsError::RecoveryFailed(format!("block {} vanished", blkno)))
    }

    /// Write replayed blocks home, then empty the log
    fn finish(&mut self, scan: &ScanResult, blocks: BTreeMap<u64, Vec<u8>>) -> XfsResult<Lsn> {
        for (blkno, data) in &blocks {
            self.data_dev.write_block(*blkno, data)?;
            self.stats.blocks_written += 1;
        }
        self.data_dev.sync()?;

        let mut writer = LogWriter::new(
            Arc::clone(&self.log_dev),
            self.config.log_blocks,
            self.uuid,
            scan.head,
        );
        writer.write_unmount()?;
        writer.clear_stale(scan.physical_head)?;
        self.stats.head = writer.head();
        Ok(writer.head())
    }
}

fn recovery_error(e: XfsError) -> XfsError {
    match e {
        XfsError::Corrupt(msg) => XfsError::RecoveryFailed(msg),
        other => other,
    }
}
