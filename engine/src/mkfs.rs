// Filesystem creation
// Lays down the superblock, bitmaps, inode table, root directory and an empty log

use crate::device::BlockDevice;
use crate::inode::{inode_location, InodeCore, INODE_CORE_SIZE, ROOT_INO, S_IFDIR};
use crate::superblock::{Superblock, BLOCK_BITMAP_BLOCK, INODE_BITMAP_BLOCK, SB_BLOCK};
use crate::wal::LogWriter;
use std::sync::Arc;
use uuid::Uuid;
use xfstx_core::config::RESERVED_HEADER_BLOCKS;
use xfstx_core::{MountConfig, XfsError, XfsResult};

/// Set bit `bit` in a bitmap block
pub(crate) fn set_bit(bitmap: &mut [u8], bit: u64) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

/// Format `data_dev` and `log_dev` with the geometry in `config`.
/// Returns the UUID of the new filesystem.
pub fn mkfs(
    config: &MountConfig,
    data_dev: Arc<dyn BlockDevice>,
    log_dev: Arc<dyn BlockDevice>,
) -> XfsResult<Uuid> {
    config.validate()?;
    if data_dev.block_size() != config.block_size as usize
        || data_dev.block_count() < config.data_blocks
    {
        return Err(XfsError::Configuration(format!(
            "data device ({} x {} bytes) cannot hold {} x {} bytes",
            data_dev.block_count(),
            data_dev.block_size(),
            config.data_blocks,
            config.block_size
        )));
    }
    if log_dev.block_size() != config.log_block_size as usize
        || log_dev.block_count() < config.log_blocks as u64
    {
        return Err(XfsError::Configuration(format!(
            "log device ({} x {} bytes) cannot hold {} x {} bytes",
            log_dev.block_count(),
            log_dev.block_size(),
            config.log_blocks,
            config.log_block_size
        )));
    }

    let uuid = Uuid::new_v4();
    let block_size = config.block_size as usize;
    let first_data_block = config.first_data_block();
    let root_block = first_data_block;

    log::info!(
        "Creating filesystem {}: {} blocks of {} bytes, {} inodes, log {} x {} bytes",
        uuid,
        config.data_blocks,
        config.block_size,
        config.inode_count,
        config.log_blocks,
        config.log_block_size
    );

    let zero = vec![0u8; block_size];
    for block in RESERVED_HEADER_BLOCKS..first_data_block {
        data_dev.write_block(block, &zero)?;
    }
    data_dev.write_block(root_block, &zero)?;

    // Inode 0 is never handed out; inode 1 is the root
    let mut inode_bitmap = vec![0u8; block_size];
    set_bit(&mut inode_bitmap, 0);
    set_bit(&mut inode_bitmap, ROOT_INO);
    data_dev.write_block(INODE_BITMAP_BLOCK, &inode_bitmap)?;

    // Header, inode table and the root directory block
    let mut block_bitmap = vec![0u8; block_size];
    for block in 0..=root_block {
        set_bit(&mut block_bitmap, block);
    }
    data_dev.write_block(BLOCK_BITMAP_BLOCK, &block_bitmap)?;

    let now = chrono::Utc::now().timestamp();
    let root = InodeCore {
        ino: ROOT_INO,
        mode: S_IFDIR | 0o755,
        nlink: 2,
        gen: 1,
        size: block_size as u64,
        nblocks: 1,
        atime: now,
        mtime: now,
        ctime: now,
        data_block: root_block,
        ..Default::default()
    };
    let (block, offset) = inode_location(config, ROOT_INO);
    let mut table = data_dev.read_block(block)?;
    table[offset..offset + INODE_CORE_SIZE].copy_from_slice(&root.encode());
    data_dev.write_block(block, &table)?;

    let sb = Superblock {
        block_size: config.block_size,
        log_block_size: config.log_block_size,
        log_blocks: config.log_blocks,
        inode_count: config.inode_count,
        inode_size: config.inode_size,
        data_blocks: config.data_blocks,
        free_blocks: config.data_blocks - root_block - 1,
        free_inodes: config.inode_count as u64 - 2,
        root_ino: ROOT_INO,
        uuid,
    };
    let mut sb_block = vec![0u8; block_size];
    let encoded = sb.encode();
    sb_block[..encoded.len()].copy_from_slice(&encoded);
    data_dev.write_block(SB_BLOCK, &sb_block)?;
    data_dev.sync()?;

    LogWriter::format(log_dev, config.log_blocks, uuid)?;
    Ok(uuid)
}
