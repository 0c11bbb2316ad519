// Mount configuration
// Geometry of the data device and the log, plus runtime tunables

use crate::error::{XfsError, XfsResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Blocks at the start of the data device before the inode table:
/// superblock, inode bitmap, block bitmap.
pub const RESERVED_HEADER_BLOCKS: u64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Data device block size in bytes
    pub block_size: u32,
    /// Log block size in bytes
    pub log_block_size: u32,
    /// Size of the circular log in log blocks
    pub log_blocks: u32,
    /// Size of the data device in blocks
    pub data_blocks: u64,
    /// Number of inodes in the inode table
    pub inode_count: u32,
    /// On-disk inode size in bytes
    pub inode_size: u32,
    /// Whether quota items are accounted in reservations
    pub quota_enabled: bool,
    /// Background checkpoint interval; None disables the checkpoint thread
    pub checkpoint_interval_ms: Option<u64>,
    /// Maximum distinct dirty ranges a buffer item records before collapsing
    pub max_buffer_ranges: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            log_block_size: 512,
            log_blocks: 8192, // 4MB with 512 byte log blocks
            data_blocks: 4096,
            inode_count: 1024,
            inode_size: 256,
            quota_enabled: false,
            checkpoint_interval_ms: Some(1000),
            max_buffer_ranges: 16,
        }
    }
}

impl MountConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> XfsResult<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: MountConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the geometry for mount-time fatal errors
    pub fn validate(&self) -> XfsResult<()> {
        if self.log_blocks == 0 {
            return Err(XfsError::Configuration("zero-size log".to_string()));
        }
        if !self.block_size.is_power_of_two() || !(512..=65536).contains(&self.block_size) {
            return Err(XfsError::Configuration(format!(
                "invalid block size {}",
                self.block_size
            )));
        }
        if !self.log_block_size.is_power_of_two() || !(256..=65536).contains(&self.log_block_size) {
            return Err(XfsError::Configuration(format!(
                "invalid log block size {}",
                self.log_block_size
            )));
        }
        if !self.inode_size.is_power_of_two()
            || self.inode_size < 128
            || self.inode_size > self.block_size
        {
            return Err(XfsError::Configuration(format!(
                "invalid inode size {}",
                self.inode_size
            )));
        }
        if self.inode_count < 2 || self.inode_count as u64 > self.bits_per_block() {
            return Err(XfsError::Configuration(format!(
                "inode count {} must be between 2 and {}",
                self.inode_count,
                self.bits_per_block()
            )));
        }
        if self.data_blocks > self.bits_per_block() {
            return Err(XfsError::Configuration(format!(
                "data device of {} blocks does not fit one bitmap block",
                self.data_blocks
            )));
        }
        if self.data_blocks <= self.first_data_block() {
            return Err(XfsError::Configuration(format!(
                "data device of {} blocks leaves no data blocks",
                self.data_blocks
            )));
        }
        if self.max_buffer_ranges == 0 {
            return Err(XfsError::Configuration(
                "max_buffer_ranges must be at least 1".to_string(),
            ));
        }
        if let Some(0) = self.checkpoint_interval_ms {
            return Err(XfsError::Configuration(
                "checkpoint interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Bits in one bitmap block
    pub fn bits_per_block(&self) -> u64 {
        self.block_size as u64 * 8
    }

    pub fn inodes_per_block(&self) -> u32 {
        self.block_size / self.inode_size
    }

    pub fn inode_table_blocks(&self) -> u64 {
        (self.inode_count as u64).div_ceil(self.inodes_per_block() as u64)
    }

    pub fn first_data_block(&self) -> u64 {
        RESERVED_HEADER_BLOCKS + self.inode_table_blocks()
    }

    /// Total log size in bytes
    pub fn log_bytes(&self) -> u64 {
        self.log_blocks as u64 * self.log_block_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = MountConfig::default();
        config.validate().unwrap();
        assert_eq!(config.inodes_per_block(), 16);
        assert_eq!(config.inode_table_blocks(), 64);
        assert_eq!(config.first_data_block(), 67);
        assert_eq!(config.log_bytes(), 8192 * 512);
    }

    #[test]
    fn test_zero_log_is_fatal() {
        let config = MountConfig {
            log_blocks: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(XfsError::Configuration(_))));
    }

    #[test]
    fn test_inode_count_bounded_by_bitmap() {
        let config = MountConfig {
            block_size: 512,
            inode_size: 128,
            inode_count: 5000,
            data_blocks: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"log_blocks\": 256, \"quota_enabled\": true}}").unwrap();

        let config = MountConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.log_blocks, 256);
        assert!(config.quota_enabled);
        assert_eq!(config.block_size, 4096);
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            MountConfig::from_json_file(file.path()),
            Err(XfsError::Serialization(_))
        ));
    }
}
