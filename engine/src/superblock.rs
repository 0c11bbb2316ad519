// Superblock
// Geometry, free counters and the filesystem UUID stamped into every log record

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use static_assertions::const_assert;
use std::io::{Cursor, Read};
use uuid::Uuid;
use xfstx_core::{MountConfig, XfsError, XfsResult};

/// Superblock magic "XFSB"
pub const SB_MAGIC: u32 = 0x5846_5342;
pub const SB_VERSION: u32 = 1;

pub const SB_BLOCK: u64 = 0;
pub const INODE_BITMAP_BLOCK: u64 = 1;
pub const BLOCK_BITMAP_BLOCK: u64 = 2;

/// Encoded size; transactions log exactly this range of block 0
pub const SUPERBLOCK_SIZE: usize = 80;
const_assert!(SUPERBLOCK_SIZE <= 512);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: u32,
    pub log_block_size: u32,
    pub log_blocks: u32,
    pub inode_count: u32,
    pub inode_size: u32,
    /// Blocks in use by the filesystem; grows with `grow`
    pub data_blocks: u64,
    pub free_blocks: u64,
    pub free_inodes: u64,
    pub root_ino: u64,
    pub uuid: Uuid,
}

impl Superblock {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUPERBLOCK_SIZE);
        // Writes into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u32::<LittleEndian>(SB_MAGIC)?;
        buf.write_u32::<LittleEndian>(SB_VERSION)?;
        buf.write_u32::<LittleEndian>(self.block_size)?;
        buf.write_u32::<LittleEndian>(self.log_block_size)?;
        buf.write_u32::<LittleEndian>(self.log_blocks)?;
        buf.write_u32::<LittleEndian>(self.inode_count)?;
        buf.write_u32::<LittleEndian>(self.inode_size)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(self.data_blocks)?;
        buf.write_u64::<LittleEndian>(self.free_blocks)?;
        buf.write_u64::<LittleEndian>(self.free_inodes)?;
        buf.write_u64::<LittleEndian>(self.root_ino)?;
        buf.extend_from_slice(self.uuid.as_bytes());
        Ok(())
    }

    pub fn decode(data: &[u8]) -> XfsResult<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(XfsError::Corrupt("superblock truncated".to_string()));
        }
        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != SB_MAGIC {
            return Err(XfsError::Corrupt(format!(
                "bad superblock magic 0x{:08x}",
                magic
            )));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != SB_VERSION {
            return Err(XfsError::Corrupt(format!(
                "unsupported superblock version {}",
                version
            )));
        }
        let block_size = cursor.read_u32::<LittleEndian>()?;
        let log_block_size = cursor.read_u32::<LittleEndian>()?;
        let log_blocks = cursor.read_u32::<LittleEndian>()?;
        let inode_count = cursor.read_u32::<LittleEndian>()?;
        let inode_size = cursor.read_u32::<LittleEndian>()?;
        cursor.read_u32::<LittleEndian>()?;
        let data_blocks = cursor.read_u64::<LittleEndian>()?;
        let free_blocks = cursor.read_u64::<LittleEndian>()?;
        let free_inodes = cursor.read_u64::<LittleEndian>()?;
        let root_ino = cursor.read_u64::<LittleEndian>()?;
        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;
        Ok(Self {
            block_size,
            log_block_size,
            log_blocks,
            inode_count,
            inode_size,
            data_blocks,
            free_blocks,
            free_inodes,
            root_ino,
            uuid: Uuid::from_bytes(uuid),
        })
    }

    /// The on-disk geometry must match what the mount was asked for
    pub fn check_geometry(&self, config: &MountConfig) -> XfsResult<()> {
        let pairs = [
            ("block_size", self.block_size, config.block_size),
            ("log_block_size", self.log_block_size, config.log_block_size),
            ("log_blocks", self.log_blocks, config.log_blocks),
            ("inode_count", self.inode_count, config.inode_count),
            ("inode_size", self.inode_size, config.inode_size),
        ];
        for (name, on_disk, wanted) in pairs {
            if on_disk != wanted {
                return Err(XfsError::Configuration(format!(
                    "{} is {} on disk but {} in the mount configuration",
                    name, on_disk, wanted
                )));
            }
        }
        Ok(())
    }
}
