// Test utilities
// Small in-memory filesystems for unit tests; never touches real storage

use crate::device::MemDevice;
use crate::mkfs::mkfs;
use crate::mount::Mount;
use std::sync::Arc;
use xfstx_core::MountConfig;

/// 512-byte blocks, 64 inodes, 256 data blocks, 256 log blocks and no
/// background checkpointer so tests control write-back
pub fn small_config() -> MountConfig {
    MountConfig {
        block_size: 512,
        log_block_size: 512,
        log_blocks: 256,
        data_blocks: 256,
        inode_count: 64,
        inode_size: 128,
        checkpoint_interval_ms: None,
        ..Default::default()
    }
}

/// A formatted pair of in-memory devices
pub struct MemFs {
    pub config: MountConfig,
    pub data: MemDevice,
    pub log: MemDevice,
}

impl MemFs {
    pub fn new(config: MountConfig) -> Self {
        let data = MemDevice::new(config.block_size as usize, config.data_blocks);
        let log = MemDevice::new(config.log_block_size as usize, config.log_blocks as u64);
        mkfs(&config, Arc::new(data.clone()), Arc::new(log.clone())).unwrap();
        Self { config, data, log }
    }

    pub fn mount(&self) -> Arc<Mount> {
        Mount::mount(
            self.config.clone(),
            Arc::new(self.data.clone()),
            Arc::new(self.log.clone()),
        )
        .unwrap()
    }
}
