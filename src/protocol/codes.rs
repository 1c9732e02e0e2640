//! Outbound result codes and retrieval packet encoders

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{FILE_TAG_LEN, LIST_ENTRY_LEN};
use crate::error::CommandError;
use crate::retrieval::catalog::CatalogEntry;

/// 1-byte notifications on the storage characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    /// File number or index does not exist
    FileIndexOutOfRange = 3,
    ZeroFileSize = 4,
    /// Requested offset is at or beyond the end of the file
    InvalidFileSize = 5,
    InvalidCommand = 6,
    InvalidLength = 7,
    /// A transfer reached end of file
    TransferComplete = 0x64,
    /// A delete finished on the worker
    DeleteComplete = 0xC8,
    /// The worker could not carry out an accepted command
    StorageFailure = 0xEE,
}

impl ResultCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ResultCode::Ok,
            3 => ResultCode::FileIndexOutOfRange,
            4 => ResultCode::ZeroFileSize,
            5 => ResultCode::InvalidFileSize,
            6 => ResultCode::InvalidCommand,
            7 => ResultCode::InvalidLength,
            0x64 => ResultCode::TransferComplete,
            0xC8 => ResultCode::DeleteComplete,
            0xEE => ResultCode::StorageFailure,
            _ => return None,
        })
    }

    /// Single-byte notification payload
    pub fn to_packet(self) -> [u8; 1] {
        [self.as_u8()]
    }
}

impl From<CommandError> for ResultCode {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::UnknownOpcode(_) => ResultCode::InvalidCommand,
            CommandError::InvalidLength { .. } => ResultCode::InvalidLength,
            CommandError::FileIndexOutOfRange => ResultCode::FileIndexOutOfRange,
            CommandError::ZeroFileSize => ResultCode::ZeroFileSize,
            CommandError::OffsetBeyondEnd { .. } => ResultCode::InvalidFileSize,
        }
    }
}

/// Number of list entries that fit in one notification of `max_len` bytes
pub fn list_capacity(max_len: usize) -> usize {
    (max_len.saturating_sub(1) / LIST_ENTRY_LEN).min(u8::MAX as usize)
}

/// `[count:1]` then `count x [file_tag:4][size:4]`, big-endian.
///
/// Entries beyond what fits in `max_len` are left out; the catalog indices
/// of the listed entries are unaffected.
pub fn encode_file_list(entries: &[CatalogEntry], max_len: usize) -> Bytes {
    let count = entries.len().min(list_capacity(max_len));
    let mut buf = BytesMut::with_capacity(1 + count * LIST_ENTRY_LEN);
    buf.put_u8(count as u8);
    for entry in &entries[..count] {
        buf.put_u32(entry.file_tag());
        buf.put_u32(entry.size);
    }
    buf.freeze()
}

/// Decode a file-list notification into `(file_tag, size)` pairs
pub fn decode_file_list(packet: &[u8]) -> Option<Vec<(u32, u32)>> {
    let (&count, rest) = packet.split_first()?;
    let count = count as usize;
    if rest.len() < count * LIST_ENTRY_LEN {
        return None;
    }
    Some(
        rest.chunks_exact(LIST_ENTRY_LEN)
            .take(count)
            .map(|e| {
                (
                    u32::from_be_bytes([e[0], e[1], e[2], e[3]]),
                    u32::from_be_bytes([e[4], e[5], e[6], e[7]]),
                )
            })
            .collect(),
    )
}

/// Stored-data packet: bare payload in the legacy protocol,
/// `[file_tag:4 BE][payload]` in the multi-file protocol
pub fn encode_data_packet(file_tag: Option<u32>, payload: &[u8]) -> Bytes {
    match file_tag {
        Some(tag) => {
            let mut buf = BytesMut::with_capacity(FILE_TAG_LEN + payload.len());
            buf.put_u32(tag);
            buf.put_slice(payload);
            buf.freeze()
        }
        None => Bytes::copy_from_slice(payload),
    }
}

/// Split a multi-file data packet into `(file_tag, payload)`
pub fn parse_tagged_packet(packet: &[u8]) -> Option<(u32, &[u8])> {
    if packet.len() < FILE_TAG_LEN {
        return None;
    }
    let tag = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
    Some((tag, &packet[FILE_TAG_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::naming::ChunkName;
    use chrono::NaiveTime;

    fn entry(hms: (u32, u32, u32), counter: u32, size: u32) -> CatalogEntry {
        let time = NaiveTime::from_hms_opt(hms.0, hms.1, hms.2).unwrap();
        CatalogEntry {
            name: ChunkName::new(time, counter),
            size,
        }
    }

    #[test]
    fn test_error_codes_are_distinct() {
        let codes = [
            ResultCode::from(CommandError::UnknownOpcode(9)),
            ResultCode::from(CommandError::InvalidLength { opcode: 0, len: 3 }),
            ResultCode::from(CommandError::FileIndexOutOfRange),
            ResultCode::from(CommandError::ZeroFileSize),
            ResultCode::from(CommandError::OffsetBeyondEnd { offset: 9, size: 1 }),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, ResultCode::Ok);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(ResultCode::from_u8(0xEE), Some(ResultCode::StorageFailure));
        assert_eq!(ResultCode::from_u8(1), None);
    }

    #[test]
    fn test_file_list_layout() {
        let entries = [entry((0, 0, 1), 1, 0x0102), entry((1, 0, 0), 2, 7)];
        let packet = encode_file_list(&entries, 244);
        assert_eq!(
            &packet[..],
            &[2, 0, 0, 0, 1, 0, 0, 1, 2, 0, 0, 0x0E, 0x10, 0, 0, 0, 7]
        );
        assert_eq!(decode_file_list(&packet), Some(vec![(1, 0x0102), (3600, 7)]));
    }

    #[test]
    fn test_file_list_truncated_to_mtu() {
        let entries: Vec<_> = (0..10).map(|i| entry((0, 0, i), i, 1)).collect();
        let packet = encode_file_list(&entries, 30);
        assert_eq!(packet[0], 3);
        assert_eq!(packet.len(), 25);
    }

    #[test]
    fn test_data_packets() {
        assert_eq!(&encode_data_packet(None, b"abc")[..], b"abc");
        let tagged = encode_data_packet(Some(3723), b"abc");
        assert_eq!(parse_tagged_packet(&tagged), Some((3723, &b"abc"[..])));
    }
}
