// Mount context
// Owns every per-filesystem structure; recovery runs before a mount is handed out

use crate::ail::Ail;
use crate::buf::{BufCache, BufStats};
use crate::checkpoint::{self, CheckpointStats, Checkpointer};
use crate::device::BlockDevice;
use crate::inode::InodeCache;
use crate::recover::{LogRecovery, RecoveryStats};
use crate::reservation::TransReservations;
use crate::space::{LogSpace, SpaceStats};
use crate::superblock::{Superblock, SB_BLOCK};
use crate::sync::lock;
use crate::trans::Transaction;
use crate::types::{Lsn, TransClass, TransactionId};
use crate::wal::LogWriter;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;
use xfstx_core::{MountConfig, XfsError, XfsResult};

/// Transaction counters kept by the mount
#[derive(Debug, Default, Clone, Serialize)]
pub struct TransStats {
    pub started: u64,
    pub committed: u64,
    /// Commits that had nothing logged
    pub empty_commits: u64,
    pub cancelled: u64,
    pub rolled: u64,
    pub log_bytes: u64,
    pub lock_backoffs: u64,
    pub checkpoints: u64,
    pub items_written: u64,
}

/// Snapshot of everything worth reporting about a mount
#[derive(Debug, Clone, Serialize)]
pub struct MountStats {
    pub transactions: TransStats,
    pub space: SpaceStats,
    pub buffers: BufStats,
    pub ail_items: usize,
    pub log_head: Lsn,
    pub log_tail: Lsn,
    pub log_free_bytes: u64,
    pub shutdown: bool,
}

pub struct Mount {
    config: MountConfig,
    uuid: Uuid,
    data_dev: Arc<dyn BlockDevice>,
    reservations: TransReservations,
    bufs: BufCache,
    inodes: InodeCache,
    space: LogSpace,
    /// The single append cursor
    log: Mutex<LogWriter>,
    ail: Ail,
    /// Serialises checkpoint passes
    checkpoint_lock: Mutex<()>,
    checkpointer: Mutex<Option<Checkpointer>>,
    shutdown: AtomicBool,
    unmounted: AtomicBool,
    next_tid: AtomicU64,
    stats: Mutex<TransStats>,
    recovery: RecoveryStats,
}

impl Mount {
    /// Validate the configuration, recover the log, and return a live mount
    pub fn mount(
        config: MountConfig,
        data_dev: Arc<dyn BlockDevice>,
        log_dev: Arc<dyn BlockDevice>,
    ) -> XfsResult<Arc<Mount>> {
        config.validate()?;
        if data_dev.block_size() != config.block_size as usize {
            return Err(XfsError::Configuration(format!(
                "data device block size {} does not match {}",
                data_dev.block_size(),
                config.block_size
            )));
        }
        if log_dev.block_size() != config.log_block_size as usize
            || log_dev.block_count() < config.log_blocks as u64
        {
            return Err(XfsError::Configuration(format!(
                "log device ({} x {} bytes) cannot hold a log of {} x {} bytes",
                log_dev.block_count(),
                log_dev.block_size(),
                config.log_blocks,
                config.log_block_size
            )));
        }

        let reservations = TransReservations::compute(&config);
        reservations.check_fits(config.log_bytes())?;

        let sb = Superblock::decode(&data_dev.read_block(SB_BLOCK)?)?;
        sb.check_geometry(&config)?;

        let outcome = LogRecovery::new(
            &config,
            sb.uuid,
            Arc::clone(&data_dev),
            Arc::clone(&log_dev),
        )
        .run()?;

        // Replay may have grown the filesystem
        let sb = Superblock::decode(&data_dev.read_block(SB_BLOCK)?)?;
        if sb.data_blocks > data_dev.block_count() {
            return Err(XfsError::Corrupt(format!(
                "superblock claims {} blocks on a device of {}",
                sb.data_blocks,
                data_dev.block_count()
            )));
        }
        let mut config = config;
        config.data_blocks = sb.data_blocks;

        let mount = Arc::new(Mount {
            uuid: sb.uuid,
            reservations,
            bufs: BufCache::new(Arc::clone(&data_dev)),
            inodes: InodeCache::new(Arc::clone(&data_dev), config.clone()),
            space: LogSpace::new(config.log_bytes()),
            log: Mutex::new(LogWriter::new(
                Arc::clone(&log_dev),
                config.log_blocks,
                sb.uuid,
                outcome.head,
            )),
            ail: Ail::new(),
            checkpoint_lock: Mutex::new(()),
            checkpointer: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            unmounted: AtomicBool::new(false),
            next_tid: AtomicU64::new(outcome.stats.max_tid + 1),
            stats: Mutex::new(TransStats::default()),
            recovery: outcome.stats,
            data_dev,
            config,
        });

        if let Some(ms) = mount.config.checkpoint_interval_ms {
            let checkpointer =
                Checkpointer::start(Arc::downgrade(&mount), Duration::from_millis(ms))?;
            *lock(&mount.checkpointer) = Some(checkpointer);
        }

        log::info!(
            "Mounted filesystem {} ({} data blocks, log {} x {} bytes, head {})",
            mount.uuid,
            mount.config.data_blocks,
            mount.config.log_blocks,
            mount.config.log_block_size,
            outcome.head
        );
        Ok(mount)
    }

    /// Start a transaction of the given class
    pub fn trans_alloc(self: &Arc<Self>, class: TransClass) -> XfsResult<Transaction> {
        Transaction::begin(self, class)
    }

    /// Start a transaction holding its class's whole permanent reservation
    pub fn trans_alloc_rolling(self: &Arc<Self>, class: TransClass) -> XfsResult<Transaction> {
        Transaction::begin_rolling(self, class)
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn reservations(&self) -> &TransReservations {
        &self.reservations
    }

    pub fn bufs(&self) -> &BufCache {
        &self.bufs
    }

    pub fn inodes(&self) -> &InodeCache {
        &self.inodes
    }

    pub fn space(&self) -> &LogSpace {
        &self.space
    }

    pub fn ail(&self) -> &Ail {
        &self.ail
    }

    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    pub(crate) fn data_dev(&self) -> &Arc<dyn BlockDevice> {
        &self.data_dev
    }

    pub(crate) fn log(&self) -> MutexGuard<'_, LogWriter> {
        lock(&self.log)
    }

    pub(crate) fn next_tid(&self) -> TransactionId {
        self.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn update_stats<F: FnOnce(&mut TransStats)>(&self, f: F) {
        f(&mut lock(&self.stats));
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::SeqCst)
    }

    /// Enter the shutdown state: every later operation fails with `Shutdown`
    /// and nothing more is written home
    pub fn shutdown(&self, reason: &str) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("Filesystem {} shutting down: {}", self.uuid, reason);
        self.space.shutdown();
        if let Some(checkpointer) = lock(&self.checkpointer).as_ref() {
            checkpointer.signal_stop();
        }
    }

    /// Write committed items home and advance the log tail
    pub fn checkpoint(&self) -> XfsResult<CheckpointStats> {
        if self.is_shutdown() {
            return Err(XfsError::Shutdown);
        }
        let _serial = lock(&self.checkpoint_lock);
        match checkpoint::push_ail(self) {
            Ok(stats) => {
                self.update_stats(|s| {
                    s.checkpoints += 1;
                    s.items_written += stats.items_written;
                });
                Ok(stats)
            }
            Err(e) => {
                self.shutdown(&format!("checkpoint write failed: {}", e));
                Err(e)
            }
        }
    }

    /// Drain the AIL, stop background work and write an unmount record
    pub fn unmount(&self) -> XfsResult<()> {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(checkpointer) = lock(&self.checkpointer).take() {
            checkpointer.stop();
        }
        if self.is_shutdown() {
            log::warn!("Unmounting a shut down filesystem; the log is left for recovery");
            return Err(XfsError::Shutdown);
        }

        let mut idle_passes = 0;
        while !self.ail.is_empty() {
            let stats = self.checkpoint()?;
            if stats.items_written == 0 {
                idle_passes += 1;
                if idle_passes > 100 {
                    return Err(XfsError::InvalidTransaction(format!(
                        "{} items still locked or pinned at unmount",
                        self.ail.len()
                    )));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        let lsn = {
            let mut log = self.log();
            log.write_unmount()
        };
        match lsn {
            Ok(lsn) => {
                log::info!("Unmounted filesystem {} (unmount record at {})", self.uuid, lsn);
                Ok(())
            }
            Err(e) => {
                self.shutdown(&format!("unmount record write failed: {}", e));
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> MountStats {
        let (log_head, log_tail) = {
            let log = self.log();
            (log.head(), log.tail())
        };
        MountStats {
            transactions: lock(&self.stats).clone(),
            space: self.space.stats(),
            buffers: self.bufs.stats(),
            ail_items: self.ail.len(),
            log_head,
            log_tail,
            log_free_bytes: self.space.free_bytes(),
            shutdown: self.is_shutdown(),
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        // Without an unmount the on-disk state is whatever a crash would leave
        if let Some(checkpointer) = lock(&self.checkpointer).take() {
            checkpointer.stop();
        }
    }
}
