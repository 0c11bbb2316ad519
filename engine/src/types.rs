// Common engine types
// Identifiers, log sequence numbers, lock modes and transaction classes

use serde::Serialize;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Inode number
pub type Ino = u64;

/// Data device block number
pub type BlockNumber = u64;

/// Transaction ID
pub type TransactionId = u64;

/// Log Sequence Number
/// Format: high 32 bits = log cycle, low 32 bits = block within the log
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Null LSN, never assigned to a written record
    pub const NULL: Lsn = Lsn(0);

    pub fn new(cycle: u32, block: u32) -> Self {
        Lsn(((cycle as u64) << 32) | block as u64)
    }

    pub fn cycle(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn block(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Distance in log blocks from `self` forward to `later` in a log of `log_blocks`.
    pub fn blocks_until(&self, later: Lsn, log_blocks: u32) -> u64 {
        let from = self.cycle() as u64 * log_blocks as u64 + self.block() as u64;
        let to = later.cycle() as u64 * log_blocks as u64 + later.block() as u64;
        to.saturating_sub(from)
    }

    /// LSN `count` blocks after this one, wrapping into the next cycle.
    pub fn advance(&self, count: u32, log_blocks: u32) -> Lsn {
        let absolute = self.block() as u64 + count as u64;
        let cycles = (absolute / log_blocks as u64) as u32;
        Lsn::new(self.cycle() + cycles, (absolute % log_blocks as u64) as u32)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cycle(), self.block())
    }
}

/// Lock mode for multi-reader locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Inode lock request flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockFlags(pub u32);

impl LockFlags {
    pub const NONE: LockFlags = LockFlags(0);
    pub const IOLOCK_SHARED: LockFlags = LockFlags(0x1);
    pub const IOLOCK_EXCL: LockFlags = LockFlags(0x2);
    pub const ILOCK_SHARED: LockFlags = LockFlags(0x4);
    pub const ILOCK_EXCL: LockFlags = LockFlags(0x8);

    pub fn contains(&self, other: LockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn iolock_mode(&self) -> Option<LockMode> {
        if self.contains(Self::IOLOCK_EXCL) {
            Some(LockMode::Exclusive)
        } else if self.contains(Self::IOLOCK_SHARED) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    pub fn ilock_mode(&self) -> Option<LockMode> {
        if self.contains(Self::ILOCK_EXCL) {
            Some(LockMode::Exclusive)
        } else if self.contains(Self::ILOCK_SHARED) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }
}

impl BitOr for LockFlags {
    type Output = LockFlags;

    fn bitor(self, rhs: LockFlags) -> LockFlags {
        LockFlags(self.0 | rhs.0)
    }
}

/// Inode core fields that can be logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FieldMask(pub u32);

impl FieldMask {
    pub const NONE: FieldMask = FieldMask(0);
    pub const MODE: FieldMask = FieldMask(1 << 0);
    pub const UID: FieldMask = FieldMask(1 << 1);
    pub const GID: FieldMask = FieldMask(1 << 2);
    pub const NLINK: FieldMask = FieldMask(1 << 3);
    pub const SIZE: FieldMask = FieldMask(1 << 4);
    pub const NBLOCKS: FieldMask = FieldMask(1 << 5);
    pub const ATIME: FieldMask = FieldMask(1 << 6);
    pub const MTIME: FieldMask = FieldMask(1 << 7);
    pub const CTIME: FieldMask = FieldMask(1 << 8);
    pub const GEN: FieldMask = FieldMask(1 << 9);
    pub const FLAGS: FieldMask = FieldMask(1 << 10);
    pub const DATA_BLOCK: FieldMask = FieldMask(1 << 11);
    pub const ALL: FieldMask = FieldMask((1 << 12) - 1);

    /// Timestamps touched by most namespace operations
    pub const TIMESTAMPS: FieldMask = FieldMask((1 << 7) | (1 << 8));

    pub fn contains(&self, other: FieldMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }
}

impl BitOr for FieldMask {
    type Output = FieldMask;

    fn bitor(self, rhs: FieldMask) -> FieldMask {
        FieldMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: FieldMask) {
        self.0 |= rhs.0;
    }
}

/// Transaction reservation classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TransClass {
    Write,
    Truncate,
    Create,
    Mkdir,
    Link,
    Remove,
    Symlink,
    Rename,
    Ifree,
    Setattr,
    AttrSet,
    AttrRemove,
    GrowData,
    Sb,
}

impl TransClass {
    pub const ALL: [TransClass; 14] = [
        TransClass::Write,
        TransClass::Truncate,
        TransClass::Create,
        TransClass::Mkdir,
        TransClass::Link,
        TransClass::Remove,
        TransClass::Symlink,
        TransClass::Rename,
        TransClass::Ifree,
        TransClass::Setattr,
        TransClass::AttrSet,
        TransClass::AttrRemove,
        TransClass::GrowData,
        TransClass::Sb,
    ];

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<TransClass> {
        Self::ALL.get(value as usize).copied()
    }
}

impl fmt::Display for TransClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_parts_and_order() {
        let a = Lsn::new(1, 900);
        let b = Lsn::new(2, 3);
        assert!(a < b);
        assert_eq!(b.cycle(), 2);
        assert_eq!(b.block(), 3);
        assert_eq!(a.to_string(), "1:900");
    }

    #[test]
    fn test_lsn_wraps_cycle() {
        let lsn = Lsn::new(1, 1020);
        let next = lsn.advance(10, 1024);
        assert_eq!(next, Lsn::new(2, 6));
        assert_eq!(lsn.blocks_until(next, 1024), 10);
    }

    #[test]
    fn test_lock_flags_modes() {
        let flags = LockFlags::IOLOCK_SHARED | LockFlags::ILOCK_EXCL;
        assert_eq!(flags.iolock_mode(), Some(LockMode::Shared));
        assert_eq!(flags.ilock_mode(), Some(LockMode::Exclusive));
        assert_eq!(LockFlags::NONE.ilock_mode(), None);
    }

    #[test]
    fn test_class_roundtrip_through_u8() {
        for class in TransClass::ALL {
            assert_eq!(TransClass::from_u8(class.to_u8()), Some(class));
        }
        assert_eq!(TransClass::from_u8(200), None);
    }
}
