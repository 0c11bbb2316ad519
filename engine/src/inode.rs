// In-core inodes and the inode cache
// Each inode carries an I/O lock and a metadata lock, and lives in exactly one cache slot

use crate::device::BlockDevice;
use crate::sync::{lock, MrLock};
use crate::types::{FieldMask, Ino, LockMode};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use static_assertions::const_assert;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use xfstx_core::config::RESERVED_HEADER_BLOCKS;
use xfstx_core::{MountConfig, XfsError, XfsResult};

/// On-disk inode magic "IN"
pub const INODE_MAGIC: u16 = 0x494E;
pub const INODE_VERSION: u8 = 1;

/// Encoded size of the inode core
pub const INODE_CORE_SIZE: usize = 84;
const_assert!(INODE_CORE_SIZE <= 128);

pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;

/// Root directory inode
pub const ROOT_INO: Ino = 1;

/// Persistent inode fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeCore {
    pub ino: Ino,
    /// File type and permission bits; zero marks a free inode
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub gen: u32,
    pub flags: u32,
    pub size: u64,
    pub nblocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Single data block (directories keep their entries here)
    pub data_block: u64,
}

impl InodeCore {
    pub fn is_free(&self) -> bool {
        self.mode == 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INODE_CORE_SIZE);
        // Writes into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u16::<LittleEndian>(INODE_MAGIC)?;
        buf.write_u8(INODE_VERSION)?;
        buf.write_u8(0)?;
        buf.write_u16::<LittleEndian>(self.mode)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(self.ino)?;
        buf.write_u32::<LittleEndian>(self.uid)?;
        buf.write_u32::<LittleEndian>(self.gid)?;
        buf.write_u32::<LittleEndian>(self.nlink)?;
        buf.write_u32::<LittleEndian>(self.gen)?;
        buf.write_u32::<LittleEndian>(self.flags)?;
        buf.write_u64::<LittleEndian>(self.size)?;
        buf.write_u64::<LittleEndian>(self.nblocks)?;
        buf.write_i64::<LittleEndian>(self.atime)?;
        buf.write_i64::<LittleEndian>(self.mtime)?;
        buf.write_i64::<LittleEndian>(self.ctime)?;
        buf.write_u64::<LittleEndian>(self.data_block)?;
        Ok(())
    }

    /// Decode an inode core. An all-zero slot (never written) decodes as a
    /// free inode.
    pub fn decode(ino: Ino, data: &[u8]) -> XfsResult<Self> {
        if data.len() < INODE_CORE_SIZE {
            return Err(XfsError::Corrupt(format!("inode {} core truncated", ino)));
        }
        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u16::<LittleEndian>()?;
        if magic == 0 {
            return Ok(InodeCore {
                ino,
                ..Default::default()
            });
        }
        if magic != INODE_MAGIC {
            return Err(XfsError::Corrupt(format!(
                "inode {}: bad magic 0x{:04x}",
                ino, magic
            )));
        }
        let version = cursor.read_u8()?;
        if version != INODE_VERSION {
            return Err(XfsError::Corrupt(format!(
                "inode {}: unsupported version {}",
                ino, version
            )));
        }
        cursor.read_u8()?;
        let mode = cursor.read_u16::<LittleEndian>()?;
        cursor.read_u16::<LittleEndian>()?;
        let stored_ino = cursor.read_u64::<LittleEndian>()?;
        if stored_ino != ino {
            return Err(XfsError::Corrupt(format!(
                "inode {} slot holds inode {}",
                ino, stored_ino
            )));
        }
        Ok(InodeCore {
            ino,
            mode,
            uid: cursor.read_u32::<LittleEndian>()?,
            gid: cursor.read_u32::<LittleEndian>()?,
            nlink: cursor.read_u32::<LittleEndian>()?,
            gen: cursor.read_u32::<LittleEndian>()?,
            flags: cursor.read_u32::<LittleEndian>()?,
            size: cursor.read_u64::<LittleEndian>()?,
            nblocks: cursor.read_u64::<LittleEndian>()?,
            atime: cursor.read_i64::<LittleEndian>()?,
            mtime: cursor.read_i64::<LittleEndian>()?,
            ctime: cursor.read_i64::<LittleEndian>()?,
            data_block: cursor.read_u64::<LittleEndian>()?,
        })
    }

    /// Overwrite the fields selected by `mask` with the values in `src`
    pub fn copy_fields(&mut self, src: &InodeCore, mask: FieldMask) {
        if mask.contains(FieldMask::MODE) {
            self.mode = src.mode;
        }
        if mask.contains(FieldMask::UID) {
            self.uid = src.uid;
        }
        if mask.contains(FieldMask::GID) {
            self.gid = src.gid;
        }
        if mask.contains(FieldMask::NLINK) {
            self.nlink = src.nlink;
        }
        if mask.contains(FieldMask::SIZE) {
            self.size = src.size;
        }
        if mask.contains(FieldMask::NBLOCKS) {
            self.nblocks = src.nblocks;
        }
        if mask.contains(FieldMask::ATIME) {
            self.atime = src.atime;
        }
        if mask.contains(FieldMask::MTIME) {
            self.mtime = src.mtime;
        }
        if mask.contains(FieldMask::CTIME) {
            self.ctime = src.ctime;
        }
        if mask.contains(FieldMask::GEN) {
            self.gen = src.gen;
        }
        if mask.contains(FieldMask::FLAGS) {
            self.flags = src.flags;
        }
        if mask.contains(FieldMask::DATA_BLOCK) {
            self.data_block = src.data_block;
        }
    }
}

/// Where an inode lives on the data device: (block, byte offset)
pub fn inode_location(config: &MountConfig, ino: Ino) -> (u64, usize) {
    let per_block = config.inodes_per_block() as u64;
    let block = RESERVED_HEADER_BLOCKS + ino / per_block;
    let offset = (ino % per_block) as usize * config.inode_size as usize;
    (block, offset)
}

/// In-core inode
pub struct Inode {
    ino: Ino,
    /// Guards data content
    iolock: MrLock,
    /// Guards the inode core
    ilock: MrLock,
    core: Mutex<InodeCore>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
}

impl Inode {
    fn new(core: InodeCore) -> Self {
        Self {
            ino: core.ino,
            iolock: MrLock::new("iolock"),
            ilock: MrLock::new("ilock"),
            core: Mutex::new(core),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
        }
    }

    pub fn ino(&self) -> Ino {
        self.ino
    }

    pub fn lock_io(&self, mode: LockMode) {
        self.iolock.lock(mode);
    }

    pub fn try_lock_io(&self, mode: LockMode) -> bool {
        self.iolock.try_lock(mode)
    }

    pub fn unlock_io(&self, mode: LockMode) {
        self.iolock.unlock(mode);
    }

    pub fn lock_meta(&self, mode: LockMode) {
        self.ilock.lock(mode);
    }

    pub fn try_lock_meta(&self, mode: LockMode) -> bool {
        self.ilock.try_lock(mode)
    }

    pub fn unlock_meta(&self, mode: LockMode) {
        self.ilock.unlock(mode);
    }

    pub fn is_meta_locked(&self) -> bool {
        self.ilock.is_locked()
    }

    pub fn is_meta_exclusive(&self) -> bool {
        self.ilock.is_exclusive()
    }

    pub fn is_io_locked(&self) -> bool {
        self.iolock.is_locked()
    }

    /// Snapshot of the inode core
    pub fn core(&self) -> InodeCore {
        *lock(&self.core)
    }

    /// Modify the inode core. Callers hold the ilock exclusive.
    pub fn update<F: FnOnce(&mut InodeCore)>(&self, f: F) {
        debug_assert!(self.ilock.is_exclusive(), "inode {} modified unlocked", self.ino);
        f(&mut lock(&self.core));
    }

    pub(crate) fn set_core(&self, core: InodeCore) {
        *lock(&self.core) = core;
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        let previous = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "inode {} unpinned below zero", self.ino);
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::SeqCst) > 0
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("core", &self.core())
            .field("dirty", &self.is_dirty())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

/// Cache of in-core inodes keyed by inode number.
///
/// Inodes are written straight into their slot in the inode table with a
/// read-modify-write of the containing block; the flush mutex serialises
/// those so two inodes sharing a block cannot lose each other's update.
pub struct InodeCache {
    dev: Arc<dyn BlockDevice>,
    config: MountConfig,
    inodes: Mutex<HashMap<Ino, Arc<Inode>>>,
    flush_lock: Mutex<()>,
}

impl InodeCache {
    pub fn new(dev: Arc<dyn BlockDevice>, config: MountConfig) -> Self {
        Self {
            dev,
            config,
            inodes: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
        }
    }

    fn check_ino(&self, ino: Ino) -> XfsResult<()> {
        if ino == 0 || ino >= self.config.inode_count as u64 {
            return Err(XfsError::InvalidInput(format!("inode {} out of range", ino)));
        }
        Ok(())
    }

    /// Get a referenced in-core inode, reading it from the inode table on a miss
    pub fn get(&self, ino: Ino) -> XfsResult<Arc<Inode>> {
        self.check_ino(ino)?;
        let mut inodes = lock(&self.inodes);
        if let Some(inode) = inodes.get(&ino) {
            return Ok(Arc::clone(inode));
        }
        let (block, offset) = inode_location(&self.config, ino);
        let data = self.dev.read_block(block)?;
        let core = InodeCore::decode(ino, &data[offset..offset + INODE_CORE_SIZE])?;
        let inode = Arc::new(Inode::new(core));
        inodes.insert(ino, Arc::clone(&inode));
        Ok(inode)
    }

    /// Drop a reference; clean, idle inodes leave the cache
    pub fn put(&self, inode: Arc<Inode>) {
        let mut inodes = lock(&self.inodes);
        if Arc::strong_count(&inode) == 2
            && !inode.is_dirty()
            && !inode.is_pinned()
            && !inode.is_meta_locked()
            && !inode.is_io_locked()
        {
            inodes.remove(&inode.ino);
        }
    }

    /// Write an inode home. Returns false if it is pinned and must wait.
    pub fn flush(&self, inode: &Inode) -> XfsResult<bool> {
        if inode.is_pinned() {
            return Ok(false);
        }
        if !inode.is_dirty() {
            return Ok(true);
        }
        let _guard = lock(&self.flush_lock);
        let (block, offset) = inode_location(&self.config, inode.ino);
        let mut data = self.dev.read_block(block)?;
        data[offset..offset + INODE_CORE_SIZE].copy_from_slice(&inode.core().encode());
        self.dev.write_block(block, &data)?;
        inode.dirty.store(false, Ordering::SeqCst);
        log::trace!("Flushed inode {} to block {}", inode.ino, block);
        Ok(true)
    }

    /// Evict every clean inode nobody else references
    pub fn reclaim(&self) -> usize {
        let mut inodes = lock(&self.inodes);
        let before = inodes.len();
        inodes.retain(|_, inode| {
            Arc::strong_count(inode) > 1
                || inode.is_dirty()
                || inode.is_pinned()
                || inode.is_meta_locked()
                || inode.is_io_locked()
        });
        before - inodes.len()
    }

    pub fn cached(&self) -> usize {
        lock(&self.inodes).len()
    }
}
