// Shared fixtures for the engine integration tests
// In-memory devices, crash images and a namespace consistency check

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use xfstx::superblock::{Superblock, SB_BLOCK};
use xfstx::{
    mkfs, BlockDevice, MemDevice, MetadataOps, Mount, MountConfig, XfsOps, XfsResult, ROOT_INO,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 512-byte blocks and no background checkpointer
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

/// A log just big enough for two Rename reservations at a time
pub fn tight_log_config() -> MountConfig {
    MountConfig {
        log_blocks: 48,
        ..small_config()
    }
}

/// Larger geometry with the checkpointer running
pub fn stress_config() -> MountConfig {
    MountConfig {
        block_size: 1024,
        log_block_size: 512,
        log_blocks: 512,
        data_blocks: 1024,
        inode_count: 256,
        inode_size: 128,
        checkpoint_interval_ms: Some(5),
        ..Default::default()
    }
}

pub struct Rig {
    pub config: MountConfig,
    pub data: MemDevice,
    pub log: MemDevice,
}

impl Rig {
    pub fn new(config: MountConfig) -> Self {
        init_logging();
        let data = MemDevice::new(config.block_size as usize, config.data_blocks);
        let log = MemDevice::new(config.log_block_size as usize, config.log_blocks as u64);
        mkfs(&config, Arc::new(data.clone()), Arc::new(log.clone())).unwrap();
        Self { config, data, log }
    }

    pub fn try_mount(&self) -> XfsResult<Arc<Mount>> {
        Mount::mount(
            self.config.clone(),
            Arc::new(self.data.clone()),
            Arc::new(self.log.clone()),
        )
    }

    pub fn mount(&self) -> Arc<Mount> {
        self.try_mount().unwrap()
    }

    /// The devices as they would be found after a power cut right now
    pub fn crash_image(&self) -> Rig {
        Rig {
            config: self.config.clone(),
            data: self.data.snapshot(),
            log: self.log.snapshot(),
        }
    }

    pub fn superblock(&self) -> Superblock {
        Superblock::decode(&self.data.read_block(SB_BLOCK).unwrap()).unwrap()
    }

    pub fn same_data(&self, other: &Rig) -> bool {
        (0..self.config.data_blocks)
            .all(|b| self.data.read_block(b).unwrap() == other.data.read_block(b).unwrap())
    }
}

/// Walk the namespace from the root and check link counts and the free
/// counters in the superblock. Returns the number of live inodes.
pub fn check_namespace(ops: &XfsOps, sb: &Superblock, config: &MountConfig) -> u64 {
    let mut refs: HashMap<u64, u32> = HashMap::new();
    let mut subdirs: HashMap<u64, u32> = HashMap::new();
    let mut dirs = vec![ROOT_INO];
    let mut seen_dirs = vec![ROOT_INO];

    while let Some(dir) = dirs.pop() {
        for entry in ops.readdir(dir).unwrap() {
            let core = ops.stat(entry.ino).unwrap();
            *refs.entry(entry.ino).or_default() += 1;
            if core.is_dir() {
                *subdirs.entry(dir).or_default() += 1;
                dirs.push(entry.ino);
                seen_dirs.push(entry.ino);
            }
        }
    }

    let mut blocks_used = 0;
    for (&ino, &count) in &refs {
        let core = ops.stat(ino).unwrap();
        if !core.is_dir() {
            assert_eq!(core.nlink, count, "link count of inode {}", ino);
        }
        if core.data_block != 0 {
            blocks_used += 1;
        }
    }
    for &dir in &seen_dirs {
        let core = ops.stat(dir).unwrap();
        let expected = 2 + subdirs.get(&dir).copied().unwrap_or(0);
        assert_eq!(core.nlink, expected, "link count of directory {}", dir);
    }

    // Root and the reserved inode 0 are not in `refs`
    let live = refs.len() as u64 + 1;
    assert_eq!(sb.free_inodes, config.inode_count as u64 - live - 1);
    assert_eq!(
        sb.free_blocks,
        sb.data_blocks - config.first_data_block() - 1 - blocks_used
    );
    live
}
