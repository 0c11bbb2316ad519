// Log items
// Dirty byte-range tracking and the payload encoding of inode and buffer items

use crate::inode::{InodeCore, INODE_CORE_SIZE};
use crate::types::{BlockNumber, FieldMask, Ino};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::ops::Range;
use xfstx_core::{XfsError, XfsResult};

pub const ITEM_TYPE_INODE: u8 = 1;
pub const ITEM_TYPE_BUF: u8 = 2;

/// Inode item: {type, pad[3], mask u32, ino u64} followed by the full core
pub const INODE_ITEM_PAYLOAD: usize = 16 + INODE_CORE_SIZE;
/// Buffer item header: {type, pad[3], nranges u32, blkno u64}
pub const BUF_ITEM_HEADER: usize = 16;
/// One {offset u32, len u32} range descriptor
pub const RANGE_ENTRY: usize = 8;
/// Space set aside per dquot in reservations when quotas are enabled
pub const DQUOT_ITEM_PAYLOAD: usize = 64;

/// Sorted, disjoint, non-adjacent byte ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<usize>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range; overlapping or adjacent ranges merge
    pub fn insert(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if existing.end < merged.start || existing.start > merged.end {
                kept.push(existing);
            } else {
                merged = existing.start.min(merged.start)..existing.end.max(merged.end);
            }
        }
        let at = kept.partition_point(|r| r.start < merged.start);
        kept.insert(at, merged);
        self.ranges = kept;
    }

    /// Replace all ranges with their covering span
    pub fn collapse(&mut self) {
        if let Some(span) = self.span() {
            self.ranges = vec![span];
        }
    }

    pub fn span(&self) -> Option<Range<usize>> {
        match (self.ranges.first(), self.ranges.last()) {
            (Some(first), Some(last)) => Some(first.start..last.end),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total bytes covered
    pub fn bytes(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<usize>> {
        self.ranges.iter()
    }
}

/// Decoded contents of an item record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPayload {
    /// Absolute values of the masked fields (the whole core is carried)
    Inode {
        ino: Ino,
        mask: FieldMask,
        core: InodeCore,
    },
    /// New contents of each dirty byte range
    Buf {
        blkno: BlockNumber,
        ranges: Vec<(u32, Vec<u8>)>,
    },
}

impl ItemPayload {
    /// Capture the dirty ranges of a block
    pub fn buffer(blkno: BlockNumber, data: &[u8], ranges: &RangeSet) -> Self {
        ItemPayload::Buf {
            blkno,
            ranges: ranges
                .iter()
                .map(|r| (r.start as u32, data[r.clone()].to_vec()))
                .collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writes into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            ItemPayload::Inode { ino, mask, core } => {
                buf.write_u8(ITEM_TYPE_INODE)?;
                buf.extend_from_slice(&[0u8; 3]);
                buf.write_u32::<LittleEndian>(mask.0)?;
                buf.write_u64::<LittleEndian>(*ino)?;
                buf.extend_from_slice(&core.encode());
            }
            ItemPayload::Buf { blkno, ranges } => {
                buf.write_u8(ITEM_TYPE_BUF)?;
                buf.extend_from_slice(&[0u8; 3]);
                buf.write_u32::<LittleEndian>(ranges.len() as u32)?;
                buf.write_u64::<LittleEndian>(*blkno)?;
                for (offset, data) in ranges {
                    buf.write_u32::<LittleEndian>(*offset)?;
                    buf.write_u32::<LittleEndian>(data.len() as u32)?;
                }
                for (_, data) in ranges {
                    buf.extend_from_slice(data);
                }
            }
        }
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> XfsResult<Self> {
        let truncated = |_| XfsError::Corrupt("item payload truncated".to_string());
        let mut cursor = Cursor::new(payload);
        let item_type = cursor.read_u8().map_err(truncated)?;
        let mut pad = [0u8; 3];
        cursor.read_exact(&mut pad).map_err(truncated)?;
        match item_type {
            ITEM_TYPE_INODE => {
                let mask = FieldMask(cursor.read_u32::<LittleEndian>().map_err(truncated)?);
                let ino = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                let core = InodeCore::decode(ino, &payload[16..])?;
                Ok(ItemPayload::Inode { ino, mask, core })
            }
            ITEM_TYPE_BUF => {
                let count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                let blkno = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                if BUF_ITEM_HEADER + count * RANGE_ENTRY > payload.len() {
                    return Err(XfsError::Corrupt(format!(
                        "buffer item for block {} claims {} ranges",
                        blkno, count
                    )));
                }
                let mut extents = Vec::with_capacity(count);
                for _ in 0..count {
                    let offset = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
                    let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                    extents.push((offset, len));
                }
                let mut ranges = Vec::with_capacity(count);
                for (offset, len) in extents {
                    let mut data = vec![0u8; len];
                    cursor.read_exact(&mut data).map_err(truncated)?;
                    ranges.push((offset, data));
                }
                Ok(ItemPayload::Buf { blkno, ranges })
            }
            other => Err(XfsError::Corrupt(format!("unknown item type {}", other))),
        }
    }

    /// One-line summary for log dumps
    pub fn describe(&self) -> String {
        match self {
            ItemPayload::Inode { ino, mask, core } => format!(
                "inode {} mask 0x{:03x} mode 0{:o} nlink {} size {}",
                ino, mask.0, core.mode, core.nlink, core.size
            ),
            ItemPayload::Buf { blkno, ranges } => {
                let extents: Vec<String> = ranges
                    .iter()
                    .map(|(offset, data)| format!("{}+{}", offset, data.len()))
                    .collect();
                format!("buf {} ranges [{}]", blkno, extents.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::S_IFREG;

    #[test]
    fn test_overlapping_and_adjacent_ranges_coalesce() {
        let mut set = RangeSet::new();
        set.insert(10..20);
        set.insert(40..50);
        set.insert(15..25);
        assert_eq!(set.iter().cloned().collect::<Vec<_>>(), vec![10..25, 40..50]);

        // Adjacent on both sides bridges the gap
        set.insert(25..40);
        assert_eq!(set.iter().cloned().collect::<Vec<_>>(), vec![10..50]);
        assert_eq!(set.bytes(), 40);
    }

    #[test]
    fn test_ranges_stay_sorted() {
        let mut set = RangeSet::new();
        set.insert(100..101);
        set.insert(0..1);
        set.insert(50..51);
        set.insert(7..7);
        assert_eq!(set.len(), 3);
        assert_eq!(set.iter().next(), Some(&(0..1)));
        set.collapse();
        assert_eq!(set.iter().cloned().collect::<Vec<_>>(), vec![0..101]);
    }

    #[test]
    fn test_buffer_item_encoding() {
        let mut data = vec![0u8; 512];
        data[8..12].copy_from_slice(&[1, 2, 3, 4]);
        data[300] = 9;
        let mut set = RangeSet::new();
        set.insert(8..12);
        set.insert(300..301);

        let item = ItemPayload::buffer(17, &data, &set);
        let bytes = item.encode();
        assert_eq!(bytes.len(), BUF_ITEM_HEADER + 2 * RANGE_ENTRY + 5);
        assert_eq!(ItemPayload::decode(&bytes).unwrap(), item);
        assert_eq!(item.describe(), "buf 17 ranges [8+4, 300+1]");
    }

    #[test]
    fn test_inode_item_size_and_bad_input() {
        let core = InodeCore {
            ino: 12,
            mode: S_IFREG | 0o600,
            nlink: 1,
            ..Default::default()
        };
        let item = ItemPayload::Inode {
            ino: 12,
            mask: FieldMask::MODE | FieldMask::NLINK,
            core,
        };
        let bytes = item.encode();
        assert_eq!(bytes.len(), INODE_ITEM_PAYLOAD);
        assert_eq!(ItemPayload::decode(&bytes).unwrap(), item);

        assert!(ItemPayload::decode(&bytes[..10]).is_err());
        let mut bogus = bytes.clone();
        bogus[0] = 99;
        assert!(ItemPayload::decode(&bogus).is_err());
    }
}
