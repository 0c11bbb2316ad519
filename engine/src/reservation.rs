// Transaction reservations
// Worst-case log footprint per transaction class, derived from the log format

use crate::item::{BUF_ITEM_HEADER, DQUOT_ITEM_PAYLOAD, INODE_ITEM_PAYLOAD, RANGE_ENTRY};
use crate::types::TransClass;
use crate::wal::format::record_blocks;
use serde::Serialize;
use xfstx_core::{MountConfig, XfsError, XfsResult};

/// Start and commit records bracketing every transaction
const TRANS_OVERHEAD_RECORDS: u64 = 2;

/// Items a class may log at most, and its permanent log count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClassShape {
    inodes: u64,
    buffers: u64,
    dquots: u64,
    log_count: u32,
}

const fn shape(inodes: u64, buffers: u64, dquots: u64, log_count: u32) -> ClassShape {
    ClassShape {
        inodes,
        buffers,
        dquots,
        log_count,
    }
}

fn class_shape(class: TransClass) -> ClassShape {
    match class {
        TransClass::Write => shape(1, 2, 1, 2),
        TransClass::Truncate => shape(1, 2, 1, 2),
        TransClass::Create => shape(2, 3, 3, 2),
        TransClass::Mkdir => shape(2, 5, 3, 2),
        TransClass::Link => shape(2, 1, 0, 2),
        TransClass::Remove => shape(2, 4, 3, 2),
        TransClass::Symlink => shape(2, 4, 3, 2),
        TransClass::Rename => shape(4, 5, 0, 2),
        TransClass::Ifree => shape(1, 1, 1, 1),
        TransClass::Setattr => shape(1, 0, 1, 1),
        TransClass::AttrSet => shape(1, 2, 1, 2),
        TransClass::AttrRemove => shape(1, 2, 1, 2),
        TransClass::GrowData => shape(0, 3, 0, 1),
        TransClass::Sb => shape(0, 1, 0, 1),
    }
}

/// Reservation of one class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassReservation {
    pub class: TransClass,
    /// Bytes for one log count
    pub bytes: u64,
    pub log_count: u32,
}

/// Precomputed reservation table, one entry per transaction class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransReservations {
    entries: Vec<ClassReservation>,
    log_block_size: u64,
}

impl TransReservations {
    /// Pure function of the geometry; no I/O
    pub fn compute(config: &MountConfig) -> Self {
        let lbs = config.log_block_size as usize;
        let inode_item = record_blocks(INODE_ITEM_PAYLOAD, lbs) as u64;
        let buffer_payload = BUF_ITEM_HEADER
            + config.max_buffer_ranges as usize * RANGE_ENTRY
            + config.block_size as usize;
        let buffer_item = record_blocks(buffer_payload, lbs) as u64;
        let dquot_item = if config.quota_enabled {
            record_blocks(DQUOT_ITEM_PAYLOAD, lbs) as u64
        } else {
            0
        };

        let entries = TransClass::ALL
            .iter()
            .map(|&class| {
                let s = class_shape(class);
                let blocks = TRANS_OVERHEAD_RECORDS
                    + s.inodes * inode_item
                    + s.buffers * buffer_item
                    + s.dquots * dquot_item;
                ClassReservation {
                    class,
                    bytes: blocks * config.log_block_size as u64,
                    log_count: s.log_count,
                }
            })
            .collect();

        Self {
            entries,
            log_block_size: config.log_block_size as u64,
        }
    }

    fn entry(&self, class: TransClass) -> &ClassReservation {
        // Entries are built from TransClass::ALL in discriminant order
        &self.entries[class.to_u8() as usize]
    }

    /// Log bytes reserved for one transaction of `class`
    pub fn reservation(&self, class: TransClass) -> u64 {
        self.entry(class).bytes
    }

    /// Permanent reservation count used by rolling transactions
    pub fn log_count(&self, class: TransClass) -> u32 {
        self.entry(class).log_count
    }

    /// Largest permanent reservation in the table
    pub fn max_permanent(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.bytes * e.log_count as u64)
            .max()
            .unwrap_or(0)
    }

    /// Mount-time check: every class, with its full log count, must fit
    /// in the log or it could wait for space forever
    pub fn check_fits(&self, log_bytes: u64) -> XfsResult<()> {
        if log_bytes == 0 {
            return Err(XfsError::Configuration("zero-size log".to_string()));
        }
        for entry in &self.entries {
            let needed = entry.bytes * entry.log_count as u64;
            if needed > log_bytes {
                return Err(XfsError::Configuration(format!(
                    "{} reservation of {} bytes ({} x {}) exceeds log of {} bytes",
                    entry.class, needed, entry.bytes, entry.log_count, log_bytes
                )));
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[ClassReservation] {
        &self.entries
    }

    pub fn log_block_size(&self) -> u64 {
        self.log_block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let config = MountConfig::default();
        let res = TransReservations::compute(&config);
        // inode item 1 block; buffer item 16 + 16*8 + 4096 = 4240 bytes -> 1 + 9 blocks
        assert_eq!(res.reservation(TransClass::Setattr), 3 * 512);
        assert_eq!(res.reservation(TransClass::Create), (2 + 2 + 3 * 10) * 512);
        assert_eq!(res.reservation(TransClass::Rename), (2 + 4 + 5 * 10) * 512);
        assert_eq!(res.log_count(TransClass::Rename), 2);
        assert_eq!(res.log_count(TransClass::Sb), 1);
        res.check_fits(config.log_bytes()).unwrap();
    }

    #[test]
    fn test_quota_adds_dquot_items() {
        let plain = TransReservations::compute(&MountConfig::default());
        let quota = TransReservations::compute(&MountConfig {
            quota_enabled: true,
            ..Default::default()
        });
        assert_eq!(
            quota.reservation(TransClass::Create) - plain.reservation(TransClass::Create),
            3 * 512
        );
        assert_eq!(
            quota.reservation(TransClass::Link),
            plain.reservation(TransClass::Link)
        );
    }

    #[test]
    fn test_monotone_in_block_size() {
        let small = TransReservations::compute(&MountConfig {
            block_size: 1024,
            ..Default::default()
        });
        let large = TransReservations::compute(&MountConfig::default());
        for class in TransClass::ALL {
            assert!(small.reservation(class) <= large.reservation(class));
        }
    }

    #[test]
    fn test_oversized_class_rejected() {
        let config = MountConfig {
            log_blocks: 64,
            ..Default::default()
        };
        let res = TransReservations::compute(&config);
        assert!(matches!(
            res.check_fits(config.log_bytes()),
            Err(XfsError::Configuration(_))
        ));
        assert!(res.max_permanent() > config.log_bytes());
    }
}
