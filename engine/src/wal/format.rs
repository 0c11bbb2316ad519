// On-disk log format
// Block prefixes, record headers and their checksums

use crate::types::{Lsn, TransactionId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use static_assertions::const_assert;
use std::io::Cursor;
use uuid::Uuid;
use xfstx_core::{XfsError, XfsResult};

/// Log record magic "XFLG"
pub const LOG_MAGIC: u32 = 0x5846_4C47;
pub const LOG_VERSION: u16 = 1;

/// Every log block starts with {cycle: u32, kind: u8, pad: [u8; 3]}
pub const LOG_BLOCK_PREFIX: usize = 8;

/// Encoded record header, excluding the block prefix
pub const RECORD_HEADER_SIZE: usize = 64;

/// Smallest supported log block
pub const MIN_LOG_BLOCK_SIZE: usize = 256;

const_assert!(LOG_BLOCK_PREFIX + RECORD_HEADER_SIZE < MIN_LOG_BLOCK_SIZE);

/// Offset of header_crc within the encoded header
const HEADER_CRC_OFFSET: usize = RECORD_HEADER_SIZE - 4;

/// Log block kinds
pub const BLOCK_KIND_STALE: u8 = 0;
pub const BLOCK_KIND_HEADER: u8 = 1;
pub const BLOCK_KIND_PAYLOAD: u8 = 2;

/// Record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Start = 1,
    Item = 2,
    Commit = 3,
    Unmount = 4,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::Start),
            2 => Some(RecordType::Item),
            3 => Some(RecordType::Commit),
            4 => Some(RecordType::Unmount),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecordType::Start => "START",
            RecordType::Item => "ITEM",
            RecordType::Commit => "COMMIT",
            RecordType::Unmount => "UNMOUNT",
        }
    }
}

/// Bytes of payload carried by one payload block
pub fn payload_capacity(log_block_size: usize) -> usize {
    log_block_size - LOG_BLOCK_PREFIX
}

/// Bytes of payload that fit inline in the header block
pub fn inline_capacity(log_block_size: usize) -> usize {
    log_block_size - LOG_BLOCK_PREFIX - RECORD_HEADER_SIZE
}

/// Payload blocks needed for `bytes` of payload stored out of line
pub fn payload_blocks(bytes: usize, log_block_size: usize) -> u32 {
    bytes.div_ceil(payload_capacity(log_block_size)) as u32
}

/// Total log blocks occupied by one record carrying `payload_len` bytes.
/// Small payloads ride in the header block.
pub fn record_blocks(payload_len: usize, log_block_size: usize) -> u32 {
    if payload_len <= inline_capacity(log_block_size) {
        1
    } else {
        1 + payload_blocks(payload_len, log_block_size)
    }
}

/// Prefix stamped on every log block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPrefix {
    pub cycle: u32,
    pub kind: u8,
}

impl BlockPrefix {
    pub fn write_into(&self, block: &mut [u8]) {
        block[0..4].copy_from_slice(&self.cycle.to_le_bytes());
        block[4] = self.kind;
        block[5..8].fill(0);
    }

    pub fn read_from(block: &[u8]) -> Self {
        let mut cycle = [0u8; 4];
        cycle.copy_from_slice(&block[0..4]);
        BlockPrefix {
            cycle: u32::from_le_bytes(cycle),
            kind: block[4],
        }
    }
}

/// Log record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub rtype: RecordType,
    pub tid: TransactionId,
    /// Position of this header block
    pub lsn: Lsn,
    /// Log tail when the record was written
    pub tail_lsn: Lsn,
    pub payload_len: u32,
    /// Out-of-line payload blocks; zero when the payload is inline
    pub payload_blocks: u32,
    pub payload_crc: u32,
    pub uuid: Uuid,
}

impl RecordHeader {
    /// Build a header for `payload`, choosing inline or out-of-line storage
    pub fn new(
        rtype: RecordType,
        tid: TransactionId,
        lsn: Lsn,
        tail_lsn: Lsn,
        payload: &[u8],
        uuid: Uuid,
        log_block_size: usize,
    ) -> Self {
        let blocks = record_blocks(payload.len(), log_block_size) - 1;
        Self {
            rtype,
            tid,
            lsn,
            tail_lsn,
            payload_len: payload.len() as u32,
            payload_blocks: blocks,
            payload_crc: crc32c::crc32c(payload),
            uuid,
        }
    }

    /// Log blocks covered by the record, header included
    pub fn total_blocks(&self) -> u32 {
        1 + self.payload_blocks
    }

    pub fn is_inline(&self) -> bool {
        self.payload_blocks == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE);
        // Writes into a Vec cannot fail
        let _ = self.write_fields(&mut buf);
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        debug_assert_eq!(buf.len(), RECORD_HEADER_SIZE);
        buf
    }

    fn write_fields(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u32::<LittleEndian>(LOG_MAGIC)?;
        buf.write_u16::<LittleEndian>(LOG_VERSION)?;
        buf.write_u8(self.rtype as u8)?;
        buf.write_u8(0)?;
        buf.write_u64::<LittleEndian>(self.tid)?;
        buf.write_u32::<LittleEndian>(self.lsn.cycle())?;
        buf.write_u32::<LittleEndian>(self.lsn.block())?;
        buf.write_u32::<LittleEndian>(self.tail_lsn.cycle())?;
        buf.write_u32::<LittleEndian>(self.tail_lsn.block())?;
        buf.write_u32::<LittleEndian>(self.payload_len)?;
        buf.write_u32::<LittleEndian>(self.payload_blocks)?;
        buf.write_u32::<LittleEndian>(self.payload_crc)?;
        buf.extend_from_slice(self.uuid.as_bytes());
        Ok(())
    }

    /// Decode and verify a header. The CRC is computed over the header
    /// with the checksum field treated as zero.
    pub fn decode(data: &[u8]) -> XfsResult<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(XfsError::Corrupt("log record header truncated".to_string()));
        }
        let stored_crc = u32::from_le_bytes([
            data[HEADER_CRC_OFFSET],
            data[HEADER_CRC_OFFSET + 1],
            data[HEADER_CRC_OFFSET + 2],
            data[HEADER_CRC_OFFSET + 3],
        ]);
        let computed = crc32c::crc32c(&data[..HEADER_CRC_OFFSET]);
        if stored_crc != computed {
            return Err(XfsError::Corrupt(format!(
                "record header checksum mismatch: stored 0x{:08x}, computed 0x{:08x}",
                stored_crc, computed
            )));
        }

        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != LOG_MAGIC {
            return Err(XfsError::Corrupt(format!("bad log magic 0x{:08x}", magic)));
        }
        let version = cursor.read_u16::<LittleEndian>()?;
        if version != LOG_VERSION {
            return Err(XfsError::Corrupt(format!("unsupported log version {}", version)));
        }
        let raw_type = cursor.read_u8()?;
        let rtype = RecordType::from_u8(raw_type)
            .ok_or_else(|| XfsError::Corrupt(format!("unknown record type {}", raw_type)))?;
        cursor.read_u8()?;
        let tid = cursor.read_u64::<LittleEndian>()?;
        let lsn = Lsn::new(
            cursor.read_u32::<LittleEndian>()?,
            cursor.read_u32::<LittleEndian>()?,
        );
        let tail_lsn = Lsn::new(
            cursor.read_u32::<LittleEndian>()?,
            cursor.read_u32::<LittleEndian>()?,
        );
        let payload_len = cursor.read_u32::<LittleEndian>()?;
        let payload_blocks = cursor.read_u32::<LittleEndian>()?;
        let payload_crc = cursor.read_u32::<LittleEndian>()?;
        let mut uuid = [0u8; 16];
        std::io::Read::read_exact(&mut cursor, &mut uuid)?;

        Ok(Self {
            rtype,
            tid,
            lsn,
            tail_lsn,
            payload_len,
            payload_blocks,
            payload_crc,
            uuid: Uuid::from_bytes(uuid),
        })
    }
}

/// Payload of a start record: the reservation class and amount
pub fn encode_start(class: u8, reservation: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.push(class);
    buf.extend_from_slice(&[0u8; 7]);
    buf.extend_from_slice(&reservation.to_le_bytes());
    buf
}

pub fn decode_start(payload: &[u8]) -> XfsResult<(u8, u64)> {
    if payload.len() != 16 {
        return Err(XfsError::Corrupt(format!(
            "start record payload of {} bytes",
            payload.len()
        )));
    }
    let mut cursor = Cursor::new(&payload[8..]);
    Ok((payload[0], cursor.read_u64::<LittleEndian>()?))
}

/// Payload of a commit record: item count and CRC32C over the item payloads
pub fn encode_commit(item_count: u32, items_crc: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&item_count.to_le_bytes());
    buf.extend_from_slice(&items_crc.to_le_bytes());
    buf
}

pub fn decode_commit(payload: &[u8]) -> XfsResult<(u32, u32)> {
    if payload.len() != 8 {
        return Err(XfsError::Corrupt(format!(
            "commit record payload of {} bytes",
            payload.len()
        )));
    }
    let mut cursor = Cursor::new(payload);
    Ok((
        cursor.read_u32::<LittleEndian>()?,
        cursor.read_u32::<LittleEndian>()?,
    ))
}

/// Running CRC over a transaction's item payloads, in log order
pub fn items_crc<'a, I: IntoIterator<Item = &'a [u8]>>(payloads: I) -> u32 {
    payloads
        .into_iter()
        .fold(0u32, |crc, payload| crc32c::crc32c_append(crc, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(payload: &[u8]) -> RecordHeader {
        RecordHeader::new(
            RecordType::Item,
            42,
            Lsn::new(3, 17),
            Lsn::new(2, 900),
            payload,
            Uuid::from_bytes([7; 16]),
            512,
        )
    }

    #[test]
    fn test_header_encoding() {
        let hdr = header(&[1, 2, 3]);
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), RECORD_HEADER_SIZE);
        assert_eq!(RecordHeader::decode(&bytes).unwrap(), hdr);
        assert!(hdr.is_inline());
    }

    #[test]
    fn test_header_crc_catches_flips() {
        let mut bytes = header(&[9; 10]).encode();
        bytes[12] ^= 0x01;
        assert!(matches!(RecordHeader::decode(&bytes), Err(XfsError::Corrupt(_))));
    }

    #[test]
    fn test_record_sizing() {
        // 512 byte blocks: 440 bytes inline, 504 per payload block
        assert_eq!(inline_capacity(512), 440);
        assert_eq!(record_blocks(440, 512), 1);
        assert_eq!(record_blocks(441, 512), 2);
        assert_eq!(record_blocks(1008, 512), 3);
        assert_eq!(record_blocks(1009, 512), 4);
        assert_eq!(header(&[0; 1009]).payload_blocks, 3);
    }

    #[test]
    fn test_prefix() {
        let mut block = vec![0xFFu8; 512];
        BlockPrefix { cycle: 9, kind: BLOCK_KIND_PAYLOAD }.write_into(&mut block);
        let prefix = BlockPrefix::read_from(&block);
        assert_eq!(prefix.cycle, 9);
        assert_eq!(prefix.kind, BLOCK_KIND_PAYLOAD);
        assert_eq!(&block[5..8], &[0, 0, 0]);
    }

    #[test]
    fn test_start_and_commit_payloads() {
        assert_eq!(decode_start(&encode_start(4, 9000)).unwrap(), (4, 9000));
        assert_eq!(decode_commit(&encode_commit(3, 0xABCD)).unwrap(), (3, 0xABCD));
        assert!(decode_commit(&[0; 3]).is_err());
    }
}
