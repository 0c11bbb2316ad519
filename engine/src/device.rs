// Block device access
// The write primitive consumed by the buffer cache, the inode cache and the log

use crate::sync::lock;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use xfstx_core::{XfsError, XfsResult};

/// Fixed-size block device
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;
    fn block_count(&self) -> u64;
    fn read_block(&self, block: u64) -> XfsResult<Vec<u8>>;
    fn write_block(&self, block: u64, data: &[u8]) -> XfsResult<()>;
    fn sync(&self) -> XfsResult<()>;
}

fn check_request(dev: &dyn BlockDevice, block: u64, len: Option<usize>) -> XfsResult<()> {
    if block >= dev.block_count() {
        return Err(XfsError::InvalidInput(format!(
            "block {} beyond device end {}",
            block,
            dev.block_count()
        )));
    }
    if let Some(len) = len {
        if len != dev.block_size() {
            return Err(XfsError::InvalidInput(format!(
                "Invalid block size: expected {}, got {}",
                dev.block_size(),
                len
            )));
        }
    }
    Ok(())
}

struct MemStorage {
    data: Vec<u8>,
    /// Writes still allowed before the device starts failing
    writes_left: Option<u64>,
    writes: u64,
}

/// In-memory block device.
///
/// Clones share the same storage, so a test can keep a handle after handing
/// one to a mount. `fail_after` makes the device refuse writes after a given
/// number of successful ones, which models both a dying disk and a crash in
/// the middle of a multi-block write.
#[derive(Clone)]
pub struct MemDevice {
    storage: Arc<Mutex<MemStorage>>,
    block_size: usize,
    block_count: u64,
}

impl MemDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            storage: Arc::new(Mutex::new(MemStorage {
                data: vec![0u8; block_size * block_count as usize],
                writes_left: None,
                writes: 0,
            })),
            block_size,
            block_count,
        }
    }

    /// Fail every write after the next `writes` succeed
    pub fn fail_after(&self, writes: u64) {
        lock(&self.storage).writes_left = Some(writes);
    }

    /// Stop injecting failures
    pub fn heal(&self) {
        lock(&self.storage).writes_left = None;
    }

    pub fn write_count(&self) -> u64 {
        lock(&self.storage).writes
    }

    /// Independent copy of the current contents, as found after a power cut
    pub fn snapshot(&self) -> MemDevice {
        let storage = lock(&self.storage);
        MemDevice {
            storage: Arc::new(Mutex::new(MemStorage {
                data: storage.data.clone(),
                writes_left: None,
                writes: 0,
            })),
            block_size: self.block_size,
            block_count: self.block_count,
        }
    }

    /// Flip one byte in place; used to model media corruption
    pub fn corrupt_byte(&self, block: u64, offset: usize) {
        let mut storage = lock(&self.storage);
        let index = block as usize * self.block_size + offset;
        storage.data[index] ^= 0xFF;
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64) -> XfsResult<Vec<u8>> {
        check_request(self, block, None)?;
        let storage = lock(&self.storage);
        let start = block as usize * self.block_size;
        Ok(storage.data[start..start + self.block_size].to_vec())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> XfsResult<()> {
        check_request(self, block, Some(data.len()))?;
        let mut storage = lock(&self.storage);
        if let Some(left) = storage.writes_left {
            if left == 0 {
                return Err(XfsError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected write failure at block {}", block),
                )));
            }
            storage.writes_left = Some(left - 1);
        }
        let start = block as usize * self.block_size;
        storage.data[start..start + self.block_size].copy_from_slice(data);
        storage.writes += 1;
        Ok(())
    }

    fn sync(&self) -> XfsResult<()> {
        Ok(())
    }
}

/// Block device backed by an image file
pub struct FileDevice {
    file: Mutex<File>,
    block_size: usize,
    block_count: u64,
}

impl FileDevice {
    /// Create (or truncate) an image file of the given geometry
    pub fn create(path: &Path, block_size: usize, block_count: u64) -> XfsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_size as u64 * block_count)?;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            block_count,
        })
    }

    /// Open an existing image; the block count follows from the file length
    pub fn open(path: &Path, block_size: usize) -> XfsResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len == 0 || len % block_size as u64 != 0 {
            return Err(XfsError::InvalidInput(format!(
                "{}: length {} is not a multiple of {}",
                path.display(),
                len,
                block_size
            )));
        }
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            block_count: len / block_size as u64,
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64) -> XfsResult<Vec<u8>> {
        check_request(self, block, None)?;
        let mut file = lock(&self.file);
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        let mut buffer = vec![0u8; self.block_size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> XfsResult<()> {
        check_request(self, block, Some(data.len()))?;
        let mut file = lock(&self.file);
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync(&self) -> XfsResult<()> {
        lock(&self.file).sync_all()?;
        Ok(())
    }
}
