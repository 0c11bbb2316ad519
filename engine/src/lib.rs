// Transactional metadata engine
pub mod types;
pub mod sync;
pub mod device;

// Caches of lockable metadata objects
pub mod buf;
pub mod inode;
pub mod superblock;

// Write-ahead logging, reservation and write-back
pub mod item;
pub mod wal;
pub mod reservation;
pub mod space;
pub mod ail;
pub mod checkpoint;
pub mod recover;

pub mod trans;
pub mod mount;
pub mod ops;
pub mod mkfs;

#[cfg(test)]
pub mod test_utils;

pub use xfstx_core::{MountConfig, XfsError, XfsResult};

pub use buf::{Buf, BufCache, BufStats};
pub use checkpoint::CheckpointStats;
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use inode::{Inode, InodeCache, InodeCore, ROOT_INO};
pub use mkfs::mkfs;
pub use mount::{Mount, MountStats, TransStats};
pub use ops::{DirEntry, MetadataOps, SetAttr, XfsOps};
pub use recover::{RecoveryState, RecoveryStats};
pub use reservation::TransReservations;
pub use space::{LogSpace, SpaceStats};
pub use sync::Interrupt;
pub use trans::{TransState, Transaction};
pub use wal::{LogReader, LogRecord, LogWriter, RecordRead, RecordType};
pub use types::{BlockNumber, FieldMask, Ino, LockFlags, LockMode, Lsn, TransClass, TransactionId};
