// Checkpointing
// Writes AIL items to their final locations and moves the log tail forward

use crate::ail::AilItem;
use crate::mount::Mount;
use crate::sync::{lock, wait_timeout};
use crate::types::LockMode;
use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use xfstx_core::XfsResult;

/// Result of one checkpoint pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct CheckpointStats {
    /// Items written home and removed from the AIL
    pub items_written: u64,
    /// Items left behind because they were locked or pinned
    pub items_skipped: u64,
    /// Log blocks released by moving the tail
    pub blocks_freed: u64,
    /// Idle buffers and inodes dropped from the caches
    pub evicted: u64,
}

/// Flush every AIL item that is neither locked nor pinned, sync the data
/// device, then move the tail to the oldest item still waiting.
pub(crate) fn push_ail(mount: &Mount) -> XfsResult<CheckpointStats> {
    let mut stats = CheckpointStats::default();

    for (lsn, item) in mount.ail().snapshot() {
        // Holding the item lock means no transaction is modifying it and any
        // re-log has already moved it in the AIL
        let written = match &item {
            AilItem::Buf(buf) => {
                if !buf.try_lock(LockMode::Shared) {
                    stats.items_skipped += 1;
                    continue;
                }
                let result = mount.bufs().flush(buf);
                let written = matches!(result, Ok(true)) && mount.ail().remove_if_at(item.key(), lsn);
                buf.unlock(LockMode::Shared);
                result?;
                written
            }
            AilItem::Inode(inode) => {
                if !inode.try_lock_meta(LockMode::Shared) {
                    stats.items_skipped += 1;
                    continue;
                }
                let result = mount.inodes().flush(inode);
                let written =
                    matches!(result, Ok(true)) && mount.ail().remove_if_at(item.key(), lsn);
                inode.unlock_meta(LockMode::Shared);
                result?;
                written
            }
        };
        if written {
            stats.items_written += 1;
            match item {
                AilItem::Buf(buf) => mount.bufs().release(buf),
                AilItem::Inode(inode) => mount.inodes().put(inode),
            }
        } else {
            stats.items_skipped += 1;
        }
    }

    mount.data_dev().sync()?;
    stats.evicted = (mount.bufs().reclaim() + mount.inodes().reclaim()) as u64;

    // Commits insert into the AIL under the log lock, so the minimum read
    // here cannot miss a record that is already on disk
    let freed = {
        let mut log = mount.log();
        let new_tail = mount.ail().min_lsn().unwrap_or_else(|| log.head());
        log.advance_tail(new_tail)
    };
    stats.blocks_freed = freed;
    if freed > 0 {
        mount
            .space()
            .release_used(freed * mount.config().log_block_size as u64);
    }

    log::debug!(
        "Checkpoint: {} items written, {} skipped, {} log blocks freed, {} evicted",
        stats.items_written,
        stats.items_skipped,
        stats.blocks_freed,
        stats.evicted
    );
    Ok(stats)
}

/// Background AIL pusher
pub(crate) struct Checkpointer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub(crate) fn start(mount: Weak<Mount>, interval: Duration) -> XfsResult<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("xfstx-ail".to_string())
            .spawn(move || run(mount, thread_stop, interval))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit without waiting for it
    pub(crate) fn signal_stop(&self) {
        let (flag, cond) = &*self.stop;
        *lock(flag) = true;
        cond.notify_all();
    }

    /// Stop the thread and wait for it, unless called from the thread itself
    pub(crate) fn stop(mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(mount: Weak<Mount>, stop: Arc<(Mutex<bool>, Condvar)>, interval: Duration) {
    log::debug!("Checkpoint thread started, interval {:?}", interval);
    let (flag, cond) = &*stop;
    loop {
        {
            let stopped = lock(flag);
            if *stopped {
                break;
            }
            let stopped = wait_timeout(cond, stopped, interval);
            if *stopped {
                break;
            }
        }
        let Some(mount) = mount.upgrade() else {
            break;
        };
        if mount.is_shutdown() {
            break;
        }
        if !mount.ail().is_empty() {
            if let Err(e) = mount.checkpoint() {
                log::error!("Background checkpoint failed: {}", e);
                break;
            }
        }
    }
    log::debug!("Checkpoint thread exiting");
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{small_config, MemFs};
    use crate::types::{FieldMask, LockFlags, LockMode, TransClass};
    use std::time::{Duration, Instant};
    use xfstx_core::MountConfig;

    #[test]
    fn test_locked_item_holds_the_tail() {
        let fs = MemFs::new(small_config());
        let mount = fs.mount();
        let inode = mount.inodes().get(4).unwrap();
        let other = mount.inodes().get(5).unwrap();

        for target in [&inode, &other] {
            let mut tp = mount.trans_alloc(TransClass::Setattr).unwrap();
            tp.join_inode(target, LockFlags::ILOCK_EXCL).unwrap();
            target.update(|core| core.gid = 9);
            tp.log_inode(target, FieldMask::GID).unwrap();
            tp.commit().unwrap();
        }
        let oldest = mount.ail().min_lsn().unwrap();

        inode.lock_meta(LockMode::Exclusive);
        let stats = mount.checkpoint().unwrap();
        assert_eq!((stats.items_written, stats.items_skipped), (1, 1));
        assert_eq!(mount.stats().log_tail, oldest);
        assert!(mount.space().used_bytes() > 0);

        inode.unlock_meta(LockMode::Exclusive);
        let stats = mount.checkpoint().unwrap();
        assert_eq!(stats.items_written, 1);
        assert!(stats.blocks_freed > 0);
        assert_eq!(mount.stats().log_tail, mount.stats().log_head);
        assert_eq!(mount.space().used_bytes(), 0);
    }

    #[test]
    fn test_background_thread_drains_ail() {
        let config = MountConfig {
            checkpoint_interval_ms: Some(5),
            ..small_config()
        };
        let fs = MemFs::new(config);
        let mount = fs.mount();
        let inode = mount.inodes().get(6).unwrap();

        let mut tp = mount.trans_alloc(TransClass::Setattr).unwrap();
        tp.join_inode(&inode, LockFlags::ILOCK_EXCL).unwrap();
        inode.update(|core| core.uid = 3);
        tp.log_inode(&inode, FieldMask::UID).unwrap();
        tp.commit().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !mount.ail().is_empty() {
            assert!(Instant::now() < deadline, "checkpoint thread never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(mount.stats().transactions.checkpoints > 0);
        assert!(!inode.is_dirty());
    }
}
