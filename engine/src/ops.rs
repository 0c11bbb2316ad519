// Filesystem operations
// Namespace and attribute updates, each one transaction over the mount

use crate::buf::Buf;
use crate::inode::{Inode, InodeCore, S_IFDIR, S_IFMT, S_IFREG};
use crate::mount::Mount;
use crate::superblock::{
    Superblock, BLOCK_BITMAP_BLOCK, INODE_BITMAP_BLOCK, SB_BLOCK, SUPERBLOCK_SIZE,
};
use crate::trans::Transaction;
use crate::types::{BlockNumber, FieldMask, Ino, LockFlags, LockMode, TransClass};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use xfstx_core::{XfsError, XfsResult};

/// Size of one directory entry: {ino u64, name_len u8, name}
pub const DIRENT_SIZE: usize = 64;
pub const MAX_NAME_LEN: usize = DIRENT_SIZE - 9;

/// Permission bits accepted from callers
const PERM_MASK: u16 = 0o7777;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
}

/// Attributes to change; `None` leaves a field alone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

/// Metadata operations over a mounted filesystem
pub trait MetadataOps {
    /// Create a regular file; returns its inode number
    fn create(&self, parent: Ino, name: &str, mode: u16) -> XfsResult<Ino>;

    /// Create a directory; returns its inode number
    fn mkdir(&self, parent: Ino, name: &str, mode: u16) -> XfsResult<Ino>;

    /// Add another name for a non-directory inode
    fn link(&self, ino: Ino, parent: Ino, name: &str) -> XfsResult<()>;

    /// Remove a name; the inode is freed with its last link. Directories
    /// must be empty.
    fn unlink(&self, parent: Ino, name: &str) -> XfsResult<()>;

    /// Move a name, replacing an existing non-directory target
    fn rename(&self, src_parent: Ino, src_name: &str, dst_parent: Ino, dst_name: &str)
        -> XfsResult<()>;

    /// Set a regular file's size, allocating or freeing its block
    fn truncate(&self, ino: Ino, size: u64) -> XfsResult<()>;

    fn setattr(&self, ino: Ino, attr: &SetAttr) -> XfsResult<()>;

    fn lookup(&self, parent: Ino, name: &str) -> XfsResult<Ino>;

    fn stat(&self, ino: Ino) -> XfsResult<InodeCore>;

    fn readdir(&self, dir: Ino) -> XfsResult<Vec<DirEntry>>;

    /// Grow the filesystem to `data_blocks`; returns the new size
    fn grow(&self, data_blocks: u64) -> XfsResult<u64>;
}

fn check_name(name: &str) -> XfsResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') || name.contains('\0') {
        return Err(XfsError::InvalidInput(format!("invalid name {:?}", name)));
    }
    Ok(())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn bit_is_set(bitmap: &[u8], bit: u64) -> bool {
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

fn entry_range(slot: usize) -> Range<usize> {
    slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE
}

fn entry_at(block: &[u8], slot: usize) -> Option<DirEntry> {
    let raw = &block[entry_range(slot)];
    let ino = LittleEndian::read_u64(&raw[0..8]);
    if ino == 0 {
        return None;
    }
    let len = (raw[8] as usize).min(MAX_NAME_LEN);
    Some(DirEntry {
        ino,
        name: String::from_utf8_lossy(&raw[9..9 + len]).into_owned(),
    })
}

fn encode_entry(ino: Ino, name: &str) -> [u8; DIRENT_SIZE] {
    let mut raw = [0u8; DIRENT_SIZE];
    LittleEndian::write_u64(&mut raw[0..8], ino);
    raw[8] = name.len() as u8;
    raw[9..9 + name.len()].copy_from_slice(name.as_bytes());
    raw
}

fn dir_entries(block: &[u8]) -> Vec<DirEntry> {
    (0..block.len() / DIRENT_SIZE)
        .filter_map(|slot| entry_at(block, slot))
        .collect()
}

fn find_entry(block: &[u8], name: &str) -> Option<(usize, Ino)> {
    (0..block.len() / DIRENT_SIZE).find_map(|slot| match entry_at(block, slot) {
        Some(entry) if entry.name == name => Some((slot, entry.ino)),
        _ => None,
    })
}

fn free_slot(block: &[u8]) -> Option<usize> {
    (0..block.len() / DIRENT_SIZE).find(|&slot| entry_at(block, slot).is_none())
}

fn write_entry(tp: &mut Transaction, dir: &Arc<Buf>, slot: usize, entry: [u8; DIRENT_SIZE]) -> XfsResult<()> {
    let range = entry_range(slot);
    dir.write_at(range.start, &entry);
    tp.log_buf(dir, range)
}

fn log_bit(tp: &mut Transaction, bitmap: &Arc<Buf>, bit: u64, set: bool) -> XfsResult<()> {
    let byte = (bit / 8) as usize;
    let mask = 1u8 << (bit % 8);
    let old = bitmap.data()[byte];
    let new = if set { old | mask } else { old & !mask };
    bitmap.write_at(byte, &[new]);
    tp.log_buf(bitmap, byte..byte + 1)
}

fn update_sb<F>(tp: &mut Transaction, sb_buf: &Arc<Buf>, f: F) -> XfsResult<()>
where
    F: FnOnce(&mut Superblock) -> XfsResult<()>,
{
    let mut sb = Superblock::decode(&sb_buf.data())?;
    f(&mut sb)?;
    sb_buf.write_at(0, &sb.encode());
    tp.log_buf(sb_buf, 0..SUPERBLOCK_SIZE)
}

/// Join buffers in ascending block order. `true` marks a block the caller
/// initialises completely, which is not read.
fn join_blocks(
    tp: &mut Transaction,
    blocks: &[(BlockNumber, bool)],
) -> XfsResult<BTreeMap<BlockNumber, Arc<Buf>>> {
    let mut sorted = blocks.to_vec();
    sorted.sort();
    sorted.dedup_by_key(|(blkno, _)| *blkno);
    let mut bufs = BTreeMap::new();
    for (blkno, fresh) in sorted {
        let buf = if fresh {
            tp.get_buf(blkno)?
        } else {
            tp.read_buf(blkno)?
        };
        bufs.insert(blkno, buf);
    }
    Ok(bufs)
}

/// Return an inode and its data block to the free pools
fn free_inode(
    tp: &mut Transaction,
    bufs: &BTreeMap<BlockNumber, Arc<Buf>>,
    inode: &Arc<Inode>,
) -> XfsResult<()> {
    let core = inode.core();
    log_bit(tp, &bufs[&INODE_BITMAP_BLOCK], inode.ino(), false)?;
    let freed_block = core.data_block != 0;
    if freed_block {
        log_bit(tp, &bufs[&BLOCK_BITMAP_BLOCK], core.data_block, false)?;
    }
    update_sb(tp, &bufs[&SB_BLOCK], |sb| {
        sb.free_inodes += 1;
        if freed_block {
            sb.free_blocks += 1;
        }
        Ok(())
    })?;
    inode.update(|c| {
        *c = InodeCore {
            ino: core.ino,
            gen: core.gen,
            ..Default::default()
        }
    });
    tp.log_inode(inode, FieldMask::ALL)?;
    log::trace!("Freed inode {}", core.ino);
    Ok(())
}

/// Outcome of one attempt at an operation that guesses from unlocked state
enum Attempt<T> {
    Done(T),
    Retry,
}

/// The engine's `MetadataOps` implementation.
///
/// Operations read unlocked state to decide which inodes and blocks they
/// need, lock everything in canonical order, then re-verify. A guess that
/// went stale cancels the transaction and starts over.
pub struct XfsOps {
    mount: Arc<Mount>,
}

impl XfsOps {
    pub fn new(mount: Arc<Mount>) -> Self {
        Self { mount }
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    fn inode(&self, ino: Ino) -> XfsResult<Arc<Inode>> {
        self.mount.inodes().get(ino)
    }

    fn retry<T, F>(&self, op: &str, mut attempt: F) -> XfsResult<T>
    where
        F: FnMut() -> XfsResult<Attempt<T>>,
    {
        let mut tries = 0u64;
        loop {
            match attempt()? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry => {
                    tries += 1;
                    log::debug!("{}: raced with another transaction, retry {}", op, tries);
                }
            }
        }
    }

    /// First clear bit in `range` of a bitmap, read without locking
    fn peek_free_bit(&self, bitmap: BlockNumber, range: Range<u64>) -> XfsResult<Option<u64>> {
        let buf = self.mount.bufs().read(bitmap)?;
        let found = {
            let data = buf.data();
            range.into_iter().find(|&bit| !bit_is_set(&data, bit))
        };
        self.mount.bufs().release(buf);
        Ok(found)
    }

    fn peek_sb(&self) -> XfsResult<Superblock> {
        let buf = self.mount.bufs().read(SB_BLOCK)?;
        let sb = Superblock::decode(&buf.data());
        self.mount.bufs().release(buf);
        sb
    }

    fn peek_free_inode(&self) -> XfsResult<Ino> {
        self.peek_free_bit(INODE_BITMAP_BLOCK, 1..self.mount.config().inode_count as u64)?
            .ok_or_else(|| XfsError::NoSpace("no free inodes".to_string()))
    }

    fn peek_free_block(&self) -> XfsResult<BlockNumber> {
        let sb = self.peek_sb()?;
        self.peek_free_bit(
            BLOCK_BITMAP_BLOCK,
            self.mount.config().first_data_block()..sb.data_blocks,
        )?
        .ok_or_else(|| XfsError::NoSpace("no free blocks".to_string()))
    }

    /// Look a name up from unlocked state
    fn peek_lookup(&self, parent: Ino, name: &str) -> XfsResult<Option<Ino>> {
        let inode = self.inode(parent)?;
        let core = inode.core();
        self.mount.inodes().put(inode);
        check_dir(&core)?;
        let buf = self.mount.bufs().read(core.data_block)?;
        let found = find_entry(&buf.data(), name).map(|(_, ino)| ino);
        self.mount.bufs().release(buf);
        Ok(found)
    }

    /// Run `f` over a directory block under shared locks
    fn with_dir_block<T, F>(&self, dir: Ino, f: F) -> XfsResult<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        let inode = self.inode(dir)?;
        inode.lock_meta(LockMode::Shared);
        let core = inode.core();
        let result = check_dir(&core).and_then(|()| {
            let buf = self.mount.bufs().read(core.data_block)?;
            buf.lock(LockMode::Shared);
            let value = f(&buf.data());
            buf.unlock(LockMode::Shared);
            self.mount.bufs().release(buf);
            Ok(value)
        });
        inode.unlock_meta(LockMode::Shared);
        self.mount.inodes().put(inode);
        result
    }

    fn create_inode(&self, parent_ino: Ino, name: &str, mode: u16, dir: bool) -> XfsResult<Ino> {
        check_name(name)?;
        let class = if dir { TransClass::Mkdir } else { TransClass::Create };
        self.retry(if dir { "mkdir" } else { "create" }, || {
            let candidate = self.peek_free_inode()?;
            let block = if dir { Some(self.peek_free_block()?) } else { None };
            let parent = self.inode(parent_ino)?;
            let new = self.inode(candidate)?;

            let mut tp = self.mount.trans_alloc(class)?;
            tp.join_inodes(&[Arc::clone(&parent), Arc::clone(&new)], LockFlags::ILOCK_EXCL)?;
            let pcore = parent.core();
            check_dir(&pcore)?;

            let mut blocks = vec![
                (SB_BLOCK, false),
                (INODE_BITMAP_BLOCK, false),
                (pcore.data_block, false),
            ];
            if let Some(block) = block {
                blocks.push((BLOCK_BITMAP_BLOCK, false));
                blocks.push((block, true));
            }
            let bufs = join_blocks(&mut tp, &blocks)?;

            let stale_inode = bit_is_set(&bufs[&INODE_BITMAP_BLOCK].data(), candidate)
                || !new.core().is_free();
            let stale_block = block.is_some_and(|b| bit_is_set(&bufs[&BLOCK_BITMAP_BLOCK].data(), b));
            if stale_inode || stale_block {
                tp.cancel();
                return Ok(Attempt::Retry);
            }

            let dir_buf = &bufs[&pcore.data_block];
            if find_entry(&dir_buf.data(), name).is_some() {
                return Err(XfsError::Exists(name.to_string()));
            }
            let slot = free_slot(&dir_buf.data())
                .ok_or_else(|| XfsError::NoSpace(format!("directory {} is full", parent_ino)))?;

            log_bit(&mut tp, &bufs[&INODE_BITMAP_BLOCK], candidate, true)?;
            if let Some(block) = block {
                log_bit(&mut tp, &bufs[&BLOCK_BITMAP_BLOCK], block, true)?;
                let fresh = &bufs[&block];
                let size = fresh.data().len();
                fresh.write_at(0, &vec![0u8; size]);
                tp.log_buf(fresh, 0..size)?;
            }
            update_sb(&mut tp, &bufs[&SB_BLOCK], |sb| {
                if sb.free_inodes == 0 || (dir && sb.free_blocks == 0) {
                    return Err(XfsError::Corrupt("superblock free counts disagree with bitmaps".to_string()));
                }
                sb.free_inodes -= 1;
                if dir {
                    sb.free_blocks -= 1;
                }
                Ok(())
            })?;

            let time = now();
            let block_size = self.mount.config().block_size as u64;
            new.update(|core| {
                *core = InodeCore {
                    ino: candidate,
                    mode: (if dir { S_IFDIR } else { S_IFREG }) | (mode & PERM_MASK),
                    nlink: if dir { 2 } else { 1 },
                    gen: core.gen.wrapping_add(1),
                    size: if dir { block_size } else { 0 },
                    nblocks: if dir { 1 } else { 0 },
                    atime: time,
                    mtime: time,
                    ctime: time,
                    data_block: block.unwrap_or(0),
                    ..Default::default()
                };
            });
            tp.log_inode(&new, FieldMask::ALL)?;

            write_entry(&mut tp, dir_buf, slot, encode_entry(candidate, name))?;
            let mut mask = FieldMask::TIMESTAMPS;
            parent.update(|core| {
                core.mtime = time;
                core.ctime = time;
                if dir {
                    core.nlink += 1;
                }
            });
            if dir {
                mask |= FieldMask::NLINK;
            }
            tp.log_inode(&parent, mask)?;
            tp.commit()?;
            log::debug!("Created inode {} as {:?} in directory {}", candidate, name, parent_ino);
            Ok(Attempt::Done(candidate))
        })
    }
}

fn check_dir(core: &InodeCore) -> XfsResult<()> {
    if core.is_free() {
        return Err(XfsError::NotFound(format!("inode {}", core.ino)));
    }
    if !core.is_dir() {
        return Err(XfsError::InvalidInput(format!("inode {} is not a directory", core.ino)));
    }
    Ok(())
}

fn check_live(core: &InodeCore) -> XfsResult<()> {
    if core.is_free() {
        return Err(XfsError::NotFound(format!("inode {}", core.ino)));
    }
    Ok(())
}

impl MetadataOps for XfsOps {
    fn create(&self, parent: Ino, name: &str, mode: u16) -> XfsResult<Ino> {
        self.create_inode(parent, name, mode, false)
    }

    fn mkdir(&self, parent: Ino, name: &str, mode: u16) -> XfsResult<Ino> {
        self.create_inode(parent, name, mode, true)
    }

    fn link(&self, ino: Ino, parent_ino: Ino, name: &str) -> XfsResult<()> {
        check_name(name)?;
        let parent = self.inode(parent_ino)?;
        let target = self.inode(ino)?;
        let mut tp = self.mount.trans_alloc(TransClass::Link)?;
        tp.join_inodes(&[Arc::clone(&parent), Arc::clone(&target)], LockFlags::ILOCK_EXCL)?;
        let pcore = parent.core();
        check_dir(&pcore)?;
        let tcore = target.core();
        check_live(&tcore)?;
        if tcore.is_dir() {
            return Err(XfsError::InvalidInput(format!("cannot link directory {}", ino)));
        }

        let bufs = join_blocks(&mut tp, &[(pcore.data_block, false)])?;
        let dir_buf = &bufs[&pcore.data_block];
        if find_entry(&dir_buf.data(), name).is_some() {
            return Err(XfsError::Exists(name.to_string()));
        }
        let slot = free_slot(&dir_buf.data())
            .ok_or_else(|| XfsError::NoSpace(format!("directory {} is full", parent_ino)))?;
        write_entry(&mut tp, dir_buf, slot, encode_entry(ino, name))?;

        let time = now();
        target.update(|core| {
            core.nlink += 1;
            core.ctime = time;
        });
        tp.log_inode(&target, FieldMask::NLINK | FieldMask::CTIME)?;
        parent.update(|core| {
            core.mtime = time;
            core.ctime = time;
        });
        tp.log_inode(&parent, FieldMask::TIMESTAMPS)?;
        tp.commit()?;
        Ok(())
    }

    fn unlink(&self, parent_ino: Ino, name: &str) -> XfsResult<()> {
        check_name(name)?;
        self.retry("unlink", || {
            let child_ino = self
                .peek_lookup(parent_ino, name)?
                .ok_or_else(|| XfsError::NotFound(name.to_string()))?;
            let parent = self.inode(parent_ino)?;
            let child = self.inode(child_ino)?;

            let mut tp = self.mount.trans_alloc(TransClass::Remove)?;
            tp.join_inodes(&[Arc::clone(&parent), Arc::clone(&child)], LockFlags::ILOCK_EXCL)?;
            let pcore = parent.core();
            check_dir(&pcore)?;
            let ccore = child.core();
            let is_dir = ccore.is_dir();
            let frees = is_dir || ccore.nlink <= 1;

            let mut blocks = vec![(pcore.data_block, false)];
            if frees {
                blocks.extend([
                    (SB_BLOCK, false),
                    (INODE_BITMAP_BLOCK, false),
                    (BLOCK_BITMAP_BLOCK, false),
                ]);
            }
            if is_dir {
                blocks.push((ccore.data_block, false));
            }
            let bufs = join_blocks(&mut tp, &blocks)?;

            let dir_buf = &bufs[&pcore.data_block];
            let slot = match find_entry(&dir_buf.data(), name) {
                Some((slot, ino)) if ino == child_ino => slot,
                _ => {
                    tp.cancel();
                    return Ok(Attempt::Retry);
                }
            };
            if is_dir && !dir_entries(&bufs[&ccore.data_block].data()).is_empty() {
                return Err(XfsError::NotEmpty(name.to_string()));
            }

            write_entry(&mut tp, dir_buf, slot, [0u8; DIRENT_SIZE])?;
            let time = now();
            parent.update(|core| {
                core.mtime = time;
                core.ctime = time;
                if is_dir {
                    core.nlink = core.nlink.saturating_sub(1);
                }
            });
            tp.log_inode(
                &parent,
                if is_dir {
                    FieldMask::TIMESTAMPS | FieldMask::NLINK
                } else {
                    FieldMask::TIMESTAMPS
                },
            )?;

            if frees {
                free_inode(&mut tp, &bufs, &child)?;
            } else {
                child.update(|core| {
                    core.nlink -= 1;
                    core.ctime = time;
                });
                tp.log_inode(&child, FieldMask::NLINK | FieldMask::CTIME)?;
            }
            tp.commit()?;
            log::debug!("Removed {:?} (inode {}) from directory {}", name, child_ino, parent_ino);
            Ok(Attempt::Done(()))
        })
    }

    fn rename(
        &self,
        src_parent: Ino,
        src_name: &str,
        dst_parent: Ino,
        dst_name: &str,
    ) -> XfsResult<()> {
        check_name(src_name)?;
        check_name(dst_name)?;
        self.retry("rename", || {
            let src_ino = self
                .peek_lookup(src_parent, src_name)?
                .ok_or_else(|| XfsError::NotFound(src_name.to_string()))?;
            if src_parent == dst_parent && src_name == dst_name {
                return Ok(Attempt::Done(()));
            }
            // Only the direct case is caught; deeper cycles are not detected
            if src_ino == dst_parent {
                return Err(XfsError::InvalidInput(format!(
                    "cannot move directory {} into itself",
                    src_ino
                )));
            }
            let dst_ino = self.peek_lookup(dst_parent, dst_name)?;

            let sp = self.inode(src_parent)?;
            let dp = self.inode(dst_parent)?;
            let src = self.inode(src_ino)?;
            let mut inodes = vec![Arc::clone(&sp), Arc::clone(&dp), Arc::clone(&src)];
            let dst = match dst_ino {
                Some(ino) => {
                    let dst = self.inode(ino)?;
                    inodes.push(Arc::clone(&dst));
                    Some(dst)
                }
                None => None,
            };

            let mut tp = self.mount.trans_alloc(TransClass::Rename)?;
            tp.join_inodes(&inodes, LockFlags::ILOCK_EXCL)?;
            let spcore = sp.core();
            let dpcore = dp.core();
            check_dir(&spcore)?;
            check_dir(&dpcore)?;
            let src_core = src.core();

            let dst_frees = match &dst {
                Some(dst) if dst.ino() == src_ino => false,
                Some(dst) => {
                    let core = dst.core();
                    if core.is_dir() {
                        return Err(XfsError::Exists(format!(
                            "{} is a directory",
                            dst_name
                        )));
                    }
                    core.nlink <= 1
                }
                None => false,
            };
            let mut blocks = vec![(spcore.data_block, false), (dpcore.data_block, false)];
            if dst_frees {
                blocks.extend([
                    (SB_BLOCK, false),
                    (INODE_BITMAP_BLOCK, false),
                    (BLOCK_BITMAP_BLOCK, false),
                ]);
            }
            let bufs = join_blocks(&mut tp, &blocks)?;
            let src_dir = &bufs[&spcore.data_block];
            let dst_dir = &bufs[&dpcore.data_block];

            let src_slot = match find_entry(&src_dir.data(), src_name) {
                Some((slot, ino)) if ino == src_ino => slot,
                _ => {
                    tp.cancel();
                    return Ok(Attempt::Retry);
                }
            };
            let dst_slot = find_entry(&dst_dir.data(), dst_name);
            if dst_slot.map(|(_, ino)| ino) != dst_ino {
                tp.cancel();
                return Ok(Attempt::Retry);
            }

            if dst_ino == Some(src_ino) {
                // Both names already refer to the same inode
                tp.commit()?;
                return Ok(Attempt::Done(()));
            }

            let time = now();
            match dst_slot {
                Some((slot, _)) => {
                    write_entry(&mut tp, dst_dir, slot, encode_entry(src_ino, dst_name))?;
                    write_entry(&mut tp, src_dir, src_slot, [0u8; DIRENT_SIZE])?;
                }
                None if src_parent == dst_parent => {
                    write_entry(&mut tp, src_dir, src_slot, encode_entry(src_ino, dst_name))?;
                }
                None => {
                    let slot = free_slot(&dst_dir.data()).ok_or_else(|| {
                        XfsError::NoSpace(format!("directory {} is full", dst_parent))
                    })?;
                    write_entry(&mut tp, dst_dir, slot, encode_entry(src_ino, dst_name))?;
                    write_entry(&mut tp, src_dir, src_slot, [0u8; DIRENT_SIZE])?;
                }
            }

            let moves_dir = src_core.is_dir() && src_parent != dst_parent;
            sp.update(|core| {
                core.mtime = time;
                core.ctime = time;
                if moves_dir {
                    core.nlink = core.nlink.saturating_sub(1);
                }
            });
            tp.log_inode(&sp, FieldMask::TIMESTAMPS | FieldMask::NLINK)?;
            if src_parent != dst_parent {
                dp.update(|core| {
                    core.mtime = time;
                    core.ctime = time;
                    if moves_dir {
                        core.nlink += 1;
                    }
                });
                tp.log_inode(&dp, FieldMask::TIMESTAMPS | FieldMask::NLINK)?;
            }
            src.update(|core| core.ctime = time);
            tp.log_inode(&src, FieldMask::CTIME)?;

            if let Some(dst) = &dst {
                if dst_frees {
                    free_inode(&mut tp, &bufs, dst)?;
                } else {
                    dst.update(|core| {
                        core.nlink -= 1;
                        core.ctime = time;
                    });
                    tp.log_inode(dst, FieldMask::NLINK | FieldMask::CTIME)?;
                }
            }
            tp.commit()?;
            log::debug!(
                "Renamed {}/{:?} to {}/{:?}",
                src_parent,
                src_name,
                dst_parent,
                dst_name
            );
            Ok(Attempt::Done(()))
        })
    }

    fn truncate(&self, ino: Ino, size: u64) -> XfsResult<()> {
        let block_size = self.mount.config().block_size as u64;
        if size > block_size {
            return Err(XfsError::InvalidInput(format!(
                "size {} exceeds the single block of {} bytes",
                size, block_size
            )));
        }
        self.retry("truncate", || {
            let inode = self.inode(ino)?;
            let guess = inode.core();
            check_live(&guess)?;
            let candidate = if size > 0 && guess.data_block == 0 {
                Some(self.peek_free_block()?)
            } else {
                None
            };

            let mut tp = self.mount.trans_alloc(TransClass::Truncate)?;
            tp.join_inode(&inode, LockFlags::IOLOCK_EXCL | LockFlags::ILOCK_EXCL)?;
            let core = inode.core();
            check_live(&core)?;
            if core.mode & S_IFMT != S_IFREG {
                return Err(XfsError::InvalidInput(format!("inode {} is not a regular file", ino)));
            }

            let frees = size == 0 && core.data_block != 0;
            let allocates = size > 0 && core.data_block == 0;
            if allocates && candidate.is_none() {
                tp.cancel();
                return Ok(Attempt::Retry);
            }
            let mut mask = FieldMask::SIZE | FieldMask::TIMESTAMPS;
            let mut data_block = core.data_block;
            if frees || allocates {
                let bufs = join_blocks(&mut tp, &[(SB_BLOCK, false), (BLOCK_BITMAP_BLOCK, false)])?;
                let bitmap = &bufs[&BLOCK_BITMAP_BLOCK];
                if allocates {
                    let block = candidate.unwrap_or_default();
                    if bit_is_set(&bitmap.data(), block) {
                        tp.cancel();
                        return Ok(Attempt::Retry);
                    }
                    log_bit(&mut tp, bitmap, block, true)?;
                    data_block = block;
                } else {
                    log_bit(&mut tp, bitmap, core.data_block, false)?;
                    data_block = 0;
                }
                update_sb(&mut tp, &bufs[&SB_BLOCK], |sb| {
                    if allocates {
                        sb.free_blocks = sb.free_blocks.checked_sub(1).ok_or_else(|| {
                            XfsError::Corrupt("superblock free counts disagree with bitmaps".to_string())
                        })?;
                    } else {
                        sb.free_blocks += 1;
                    }
                    Ok(())
                })?;
                mask |= FieldMask::DATA_BLOCK | FieldMask::NBLOCKS;
            }

            let time = now();
            inode.update(|c| {
                c.size = size;
                c.data_block = data_block;
                c.nblocks = if data_block == 0 { 0 } else { 1 };
                c.mtime = time;
                c.ctime = time;
            });
            tp.log_inode(&inode, mask)?;
            tp.commit()?;
            Ok(Attempt::Done(()))
        })
    }

    fn setattr(&self, ino: Ino, attr: &SetAttr) -> XfsResult<()> {
        let inode = self.inode(ino)?;
        let mut tp = self.mount.trans_alloc(TransClass::Setattr)?;
        tp.join_inode(&inode, LockFlags::ILOCK_EXCL)?;
        check_live(&inode.core())?;

        let mut mask = FieldMask::CTIME;
        let time = now();
        inode.update(|core| {
            if let Some(mode) = attr.mode {
                core.mode = (core.mode & S_IFMT) | (mode & PERM_MASK);
                mask |= FieldMask::MODE;
            }
            if let Some(uid) = attr.uid {
                core.uid = uid;
                mask |= FieldMask::UID;
            }
            if let Some(gid) = attr.gid {
                core.gid = gid;
                mask |= FieldMask::GID;
            }
            if let Some(atime) = attr.atime {
                core.atime = atime;
                mask |= FieldMask::ATIME;
            }
            if let Some(mtime) = attr.mtime {
                core.mtime = mtime;
                mask |= FieldMask::MTIME;
            }
            core.ctime = time;
        });
        tp.log_inode(&inode, mask)?;
        tp.commit()?;
        Ok(())
    }

    fn lookup(&self, parent: Ino, name: &str) -> XfsResult<Ino> {
        check_name(name)?;
        self.with_dir_block(parent, |block| find_entry(block, name).map(|(_, ino)| ino))?
            .ok_or_else(|| XfsError::NotFound(name.to_string()))
    }

    fn stat(&self, ino: Ino) -> XfsResult<InodeCore> {
        let inode = self.inode(ino)?;
        inode.lock_meta(LockMode::Shared);
        let core = inode.core();
        inode.unlock_meta(LockMode::Shared);
        self.mount.inodes().put(inode);
        check_live(&core)?;
        Ok(core)
    }

    fn readdir(&self, dir: Ino) -> XfsResult<Vec<DirEntry>> {
        self.with_dir_block(dir, dir_entries)
    }

    fn grow(&self, data_blocks: u64) -> XfsResult<u64> {
        let config = self.mount.config();
        let limit = self.mount.data_dev().block_count().min(config.bits_per_block());
        let mut tp = self.mount.trans_alloc(TransClass::GrowData)?;
        let sb_buf = tp.read_buf(SB_BLOCK)?;
        update_sb(&mut tp, &sb_buf, |sb| {
            if data_blocks <= sb.data_blocks || data_blocks > limit {
                return Err(XfsError::InvalidInput(format!(
                    "cannot grow from {} to {} blocks (limit {})",
                    sb.data_blocks, data_blocks, limit
                )));
            }
            sb.free_blocks += data_blocks - sb.data_blocks;
            sb.data_blocks = data_blocks;
            Ok(())
        })?;
        tp.commit()?;
        log::info!("Grew filesystem {} to {} blocks", self.mount.uuid(), data_blocks);
        Ok(data_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::ROOT_INO;
    use crate::test_utils::{small_config, MemFs};

    fn ops() -> (MemFs, XfsOps) {
        let fs = MemFs::new(small_config());
        let ops = XfsOps::new(fs.mount());
        (fs, ops)
    }

    #[test]
    fn test_dirent_encoding() {
        let mut block = vec![0u8; 512];
        block[entry_range(3)].copy_from_slice(&encode_entry(9, "file"));
        assert_eq!(find_entry(&block, "file"), Some((3, 9)));
        assert_eq!(free_slot(&block), Some(0));
        assert_eq!(
            dir_entries(&block),
            vec![DirEntry {
                ino: 9,
                name: "file".to_string()
            }]
        );
        assert!(check_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(check_name("a/b").is_err());
        assert!(check_name("").is_err());
    }

    #[test]
    fn test_create_lookup_stat() {
        let (_fs, ops) = ops();
        let ino = ops.create(ROOT_INO, "hello", 0o644).unwrap();
        assert_eq!(ops.lookup(ROOT_INO, "hello").unwrap(), ino);
        let core = ops.stat(ino).unwrap();
        assert_eq!(core.mode, S_IFREG | 0o644);
        assert_eq!(core.nlink, 1);
        assert!(matches!(
            ops.create(ROOT_INO, "hello", 0o644),
            Err(XfsError::Exists(_))
        ));
        assert!(matches!(
            ops.lookup(ROOT_INO, "missing"),
            Err(XfsError::NotFound(_))
        ));

        let sb = ops.peek_sb().unwrap();
        assert_eq!(sb.free_inodes, small_config().inode_count as u64 - 3);
    }

    #[test]
    fn test_mkdir_and_rmdir() {
        let (_fs, ops) = ops();
        let root_links = ops.stat(ROOT_INO).unwrap().nlink;
        let dir = ops.mkdir(ROOT_INO, "sub", 0o755).unwrap();
        assert_eq!(ops.stat(ROOT_INO).unwrap().nlink, root_links + 1);
        let file = ops.create(dir, "inner", 0o600).unwrap();
        assert_eq!(ops.readdir(dir).unwrap()[0].ino, file);

        assert!(matches!(ops.unlink(ROOT_INO, "sub"), Err(XfsError::NotEmpty(_))));
        ops.unlink(dir, "inner").unwrap();
        ops.unlink(ROOT_INO, "sub").unwrap();
        assert_eq!(ops.stat(ROOT_INO).unwrap().nlink, root_links);
        assert!(matches!(ops.stat(dir), Err(XfsError::NotFound(_))));

        let config = small_config();
        let sb = ops.peek_sb().unwrap();
        assert_eq!(sb.free_inodes, config.inode_count as u64 - 2);
        assert_eq!(sb.free_blocks, config.data_blocks - config.first_data_block() - 1);
    }

    #[test]
    fn test_link_and_unlink_counts() {
        let (_fs, ops) = ops();
        let ino = ops.create(ROOT_INO, "a", 0o644).unwrap();
        ops.link(ino, ROOT_INO, "b").unwrap();
        assert_eq!(ops.stat(ino).unwrap().nlink, 2);
        ops.unlink(ROOT_INO, "a").unwrap();
        assert_eq!(ops.stat(ino).unwrap().nlink, 1);
        assert_eq!(ops.lookup(ROOT_INO, "b").unwrap(), ino);
        ops.unlink(ROOT_INO, "b").unwrap();
        assert!(ops.stat(ino).is_err());

        let dir = ops.mkdir(ROOT_INO, "d", 0o755).unwrap();
        assert!(matches!(
            ops.link(dir, ROOT_INO, "d2"),
            Err(XfsError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rename_between_directories() {
        let (_fs, ops) = ops();
        let a = ops.mkdir(ROOT_INO, "a", 0o755).unwrap();
        let b = ops.mkdir(ROOT_INO, "b", 0o755).unwrap();
        let sub = ops.mkdir(a, "sub", 0o755).unwrap();
        let file = ops.create(a, "f", 0o644).unwrap();
        let victim = ops.create(b, "g", 0o644).unwrap();

        ops.rename(a, "f", b, "g").unwrap();
        assert_eq!(ops.lookup(b, "g").unwrap(), file);
        assert!(ops.lookup(a, "f").is_err());
        assert!(ops.stat(victim).is_err());

        ops.rename(a, "sub", b, "sub").unwrap();
        assert_eq!(ops.stat(a).unwrap().nlink, 2);
        assert_eq!(ops.stat(b).unwrap().nlink, 3);

        ops.rename(b, "g", b, "h").unwrap();
        assert_eq!(ops.lookup(b, "h").unwrap(), file);
        assert_eq!(ops.readdir(b).unwrap().len(), 2);

        assert!(matches!(
            ops.rename(b, "h", b, "sub"),
            Err(XfsError::Exists(_))
        ));
        assert!(matches!(
            ops.rename(ROOT_INO, "b", b, "loop"),
            Err(XfsError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_truncate_allocates_and_frees() {
        let (_fs, ops) = ops();
        let ino = ops.create(ROOT_INO, "data", 0o644).unwrap();
        let free = ops.peek_sb().unwrap().free_blocks;

        ops.truncate(ino, 300).unwrap();
        let core = ops.stat(ino).unwrap();
        assert_eq!(core.size, 300);
        assert_ne!(core.data_block, 0);
        assert_eq!(ops.peek_sb().unwrap().free_blocks, free - 1);

        ops.truncate(ino, 0).unwrap();
        let core = ops.stat(ino).unwrap();
        assert_eq!((core.size, core.data_block, core.nblocks), (0, 0, 0));
        assert_eq!(ops.peek_sb().unwrap().free_blocks, free);

        assert!(matches!(ops.truncate(ino, 4096), Err(XfsError::InvalidInput(_))));
        assert!(matches!(ops.truncate(ROOT_INO, 1), Err(XfsError::InvalidInput(_))));
    }

    #[test]
    fn test_setattr_keeps_file_type() {
        let (_fs, ops) = ops();
        let ino = ops.create(ROOT_INO, "f", 0o644).unwrap();
        ops.setattr(
            ino,
            &SetAttr {
                mode: Some(0o100_600),
                uid: Some(1000),
                mtime: Some(1_700_000_000),
                ..Default::default()
            },
        )
        .unwrap();
        let core = ops.stat(ino).unwrap();
        assert_eq!(core.mode, S_IFREG | 0o600);
        assert_eq!(core.uid, 1000);
        assert_eq!(core.gid, 0);
        assert_eq!(core.mtime, 1_700_000_000);
    }

    #[test]
    fn test_full_directory_is_no_space() {
        let (fs, ops) = ops();
        let slots = fs.config.block_size as usize / DIRENT_SIZE;
        for i in 0..slots {
            ops.create(ROOT_INO, &format!("f{}", i), 0o644).unwrap();
        }
        let free = ops.mount().space().free_bytes();
        assert!(matches!(
            ops.create(ROOT_INO, "overflow", 0o644),
            Err(XfsError::NoSpace(_))
        ));
        // The failed create was cancelled, not committed
        assert_eq!(ops.mount().space().free_bytes(), free);
        assert_eq!(ops.readdir(ROOT_INO).unwrap().len(), slots);
    }

    #[test]
    fn test_grow_adds_free_blocks() {
        let mut config = small_config();
        config.data_blocks = 128;
        let data = crate::device::MemDevice::new(512, 256);
        let log = crate::device::MemDevice::new(512, config.log_blocks as u64);
        crate::mkfs::mkfs(&config, Arc::new(data.clone()), Arc::new(log.clone())).unwrap();
        let mount = Mount::mount(config, Arc::new(data), Arc::new(log)).unwrap();
        let ops = XfsOps::new(mount);

        let before = ops.peek_sb().unwrap();
        assert_eq!(ops.grow(256).unwrap(), 256);
        let after = ops.peek_sb().unwrap();
        assert_eq!(after.data_blocks, 256);
        assert_eq!(after.free_blocks, before.free_blocks + 128);
        assert!(matches!(ops.grow(512), Err(XfsError::InvalidInput(_))));
        assert!(matches!(ops.grow(100), Err(XfsError::InvalidInput(_))));
    }

    #[test]
    fn test_checkpoint_drops_idle_cache_entries() {
        let (_fs, ops) = ops();
        let dir = ops.mkdir(ROOT_INO, "d", 0o755).unwrap();
        for i in 0..6 {
            let ino = ops.create(dir, &format!("f{}", i), 0o644).unwrap();
            ops.truncate(ino, 100).unwrap();
        }
        let mount = ops.mount();
        assert!(mount.bufs().cached() > 0);
        assert!(mount.inodes().cached() > 0);

        let stats = mount.checkpoint().unwrap();
        assert!(stats.evicted > 0);
        assert_eq!(mount.bufs().cached(), 0);
        assert_eq!(mount.inodes().cached(), 0);

        // Evicted state is read back from disk
        assert_eq!(ops.readdir(dir).unwrap().len(), 6);
        let f3 = ops.lookup(dir, "f3").unwrap();
        assert_eq!(ops.stat(f3).unwrap().size, 100);
        ops.create(dir, "f6", 0o644).unwrap();
        assert_eq!(ops.readdir(dir).unwrap().len(), 7);
    }
}
