//! WAL record framing with CRC32C checksumming.
//!
//! Frame format (little-endian throughout):
//! - len: u32 (byte length of the body that follows the crc word)
//! - crc32c: u32 (over the body)
//! - body:
//!   - lsn: u64
//!   - op: u8 (0=INSERT, 1=DELETE, 2=FLUSH_MARK)
//!   - table_len: u32, table: bytes
//!   - tag_len: u32, tag: bytes
//!   - payload (op-specific):
//!     - INSERT:     n: u32, dim: u32, ids: n*i64, vectors: n*dim*f32
//!     - DELETE:     n: u32, ids: n*i64
//!     - FLUSH_MARK: segment_id: u64

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("CRC mismatch: stored {stored:#x}, actual {actual:#x}")]
    CrcMismatch { stored: u32, actual: u32 },
    #[error("invalid op tag {0}")]
    InvalidOp(u8),
    #[error("record body does not match its payload")]
    Malformed,
    #[error("incomplete record")]
    Incomplete,
}

/// Operation-specific payload of a WAL record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalPayload {
    Insert {
        dim: u32,
        ids: Vec<i64>,
        vectors: Vec<f32>,
    },
    Delete {
        ids: Vec<i64>,
    },
    FlushMark {
        segment_id: u64,
    },
}

impl WalPayload {
    fn op_tag(&self) -> u8 {
        match self {
            WalPayload::Insert { .. } => 0,
            WalPayload::Delete { .. } => 1,
            WalPayload::FlushMark { .. } => 2,
        }
    }
}

/// One durable log entry. `lsn` is assigned by the writer and strictly
/// increases across the log.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub lsn: u64,
    pub table: String,
    pub partition_tag: String,
    pub payload: WalPayload,
}

impl WalRecord {
    /// Encodes the full frame (length prefix, CRC, body).
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u64_le(self.lsn);
        body.put_u8(self.payload.op_tag());
        body.put_u32_le(self.table.len() as u32);
        body.put_slice(self.table.as_bytes());
        body.put_u32_le(self.partition_tag.len() as u32);
        body.put_slice(self.partition_tag.as_bytes());

        match &self.payload {
            WalPayload::Insert { dim, ids, vectors } => {
                body.put_u32_le(ids.len() as u32);
                body.put_u32_le(*dim);
                for id in ids {
                    body.put_i64_le(*id);
                }
                for v in vectors {
                    body.put_f32_le(*v);
                }
            }
            WalPayload::Delete { ids } => {
                body.put_u32_le(ids.len() as u32);
                for id in ids {
                    body.put_i64_le(*id);
                }
            }
            WalPayload::FlushMark { segment_id } => {
                body.put_u64_le(*segment_id);
            }
        }

        let mut frame = BytesMut::with_capacity(8 + body.len());
        frame.put_u32_le(body.len() as u32);
        frame.put_u32_le(crc32c::crc32c(&body));
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Decodes one frame from the front of `data`, returning the record and
    /// the bytes consumed. `Incomplete` marks a torn tail; `CrcMismatch`
    /// marks corruption within a fully-framed record.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), RecordError> {
        if data.len() < 8 {
            return Err(RecordError::Incomplete);
        }
        let mut header = data;
        let body_len = header.get_u32_le() as usize;
        let stored_crc = header.get_u32_le();
        if header.len() < body_len {
            return Err(RecordError::Incomplete);
        }
        let body = &data[8..8 + body_len];
        let actual_crc = crc32c::crc32c(body);
        if stored_crc != actual_crc {
            return Err(RecordError::CrcMismatch {
                stored: stored_crc,
                actual: actual_crc,
            });
        }

        let mut cursor = body;
        if cursor.remaining() < 9 {
            return Err(RecordError::Malformed);
        }
        let lsn = cursor.get_u64_le();
        let op = cursor.get_u8();
        let table = take_string(&mut cursor)?;
        let partition_tag = take_string(&mut cursor)?;

        let payload = match op {
            0 => {
                if cursor.remaining() < 8 {
                    return Err(RecordError::Malformed);
                }
                let n = cursor.get_u32_le() as usize;
                let dim = cursor.get_u32_le();
                if cursor.remaining() != n * 8 + n * dim as usize * 4 {
                    return Err(RecordError::Malformed);
                }
                let ids = (0..n).map(|_| cursor.get_i64_le()).collect();
                let vectors = (0..n * dim as usize).map(|_| cursor.get_f32_le()).collect();
                WalPayload::Insert { dim, ids, vectors }
            }
            1 => {
                if cursor.remaining() < 4 {
                    return Err(RecordError::Malformed);
                }
                let n = cursor.get_u32_le() as usize;
                if cursor.remaining() != n * 8 {
                    return Err(RecordError::Malformed);
                }
                let ids = (0..n).map(|_| cursor.get_i64_le()).collect();
                WalPayload::Delete { ids }
            }
            2 => {
                if cursor.remaining() != 8 {
                    return Err(RecordError::Malformed);
                }
                WalPayload::FlushMark {
                    segment_id: cursor.get_u64_le(),
                }
            }
            other => return Err(RecordError::InvalidOp(other)),
        };

        Ok((
            WalRecord {
                lsn,
                table,
                partition_tag,
                payload,
            },
            8 + body_len,
        ))
    }
}

fn take_string(cursor: &mut &[u8]) -> Result<String, RecordError> {
    if cursor.remaining() < 4 {
        return Err(RecordError::Malformed);
    }
    let len = cursor.get_u32_le() as usize;
    if cursor.remaining() < len {
        return Err(RecordError::Malformed);
    }
    let s = std::str::from_utf8(&cursor[..len])
        .map_err(|_| RecordError::Malformed)?
        .to_string();
    cursor.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_record() -> WalRecord {
        WalRecord {
            lsn: 42,
            table: "t1".into(),
            partition_tag: "a".into(),
            payload: WalPayload::Insert {
                dim: 2,
                ids: vec![10, 11],
                vectors: vec![0.5, 1.5, 2.5, 3.5],
            },
        }
    }

    #[test]
    fn test_insert_roundtrip() {
        let record = insert_record();
        let frame = record.encode();
        let (decoded, consumed) = WalRecord::decode(&frame).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_delete_roundtrip() {
        let record = WalRecord {
            lsn: 7,
            table: "t".into(),
            partition_tag: String::new(),
            payload: WalPayload::Delete { ids: vec![1, 2, 3] },
        };
        let frame = record.encode();
        let (decoded, _) = WalRecord::decode(&frame).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_flush_mark_roundtrip() {
        let record = WalRecord {
            lsn: 9,
            table: "t".into(),
            partition_tag: String::new(),
            payload: WalPayload::FlushMark { segment_id: 1234 },
        };
        let frame = record.encode();
        let (decoded, _) = WalRecord::decode(&frame).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_truncated_frame_is_incomplete() {
        let frame = insert_record().encode();
        for cut in [0, 4, 7, frame.len() - 1] {
            assert!(matches!(
                WalRecord::decode(&frame[..cut]),
                Err(RecordError::Incomplete)
            ));
        }
    }

    #[test]
    fn test_flipped_bit_is_crc_mismatch() {
        let frame = insert_record().encode();
        let mut torn = frame.to_vec();
        torn[12] ^= 0x01;
        assert!(matches!(
            WalRecord::decode(&torn),
            Err(RecordError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_back_to_back_frames() {
        let a = insert_record().encode();
        let b = WalRecord {
            lsn: 43,
            table: "t1".into(),
            partition_tag: String::new(),
            payload: WalPayload::FlushMark { segment_id: 5 },
        }
        .encode();
        let mut stream = a.to_vec();
        stream.extend_from_slice(&b);

        let (first, consumed) = WalRecord::decode(&stream).unwrap();
        assert_eq!(first.lsn, 42);
        let (second, _) = WalRecord::decode(&stream[consumed..]).unwrap();
        assert_eq!(second.lsn, 43);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_insert_roundtrip(
            lsn in any::<u64>(),
            table in "[a-z_]{1,16}",
            tag in "[a-z0-9]{0,8}",
            rows in prop::collection::vec((any::<i64>(), prop::collection::vec(-1e6f32..1e6, 4)), 0..16),
        ) {
            let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
            let vectors: Vec<f32> = rows.iter().flat_map(|(_, v)| v.clone()).collect();
            let record = WalRecord {
                lsn,
                table,
                partition_tag: tag,
                payload: WalPayload::Insert { dim: 4, ids, vectors },
            };
            let frame = record.encode();
            let (decoded, consumed) = WalRecord::decode(&frame).unwrap();
            prop_assert_eq!(decoded, record);
            prop_assert_eq!(consumed, frame.len());
        }

        #[test]
        fn prop_corruption_never_decodes_silently(
            flip in 8usize..64,
        ) {
            let record = WalRecord {
                lsn: 1,
                table: "table".into(),
                partition_tag: "tag".into(),
                payload: WalPayload::Insert {
                    dim: 4,
                    ids: vec![1, 2, 3],
                    vectors: vec![0.0; 12],
                },
            };
            let frame = record.encode();
            if flip < frame.len() {
                let mut torn = frame.to_vec();
                torn[flip] ^= 0xFF;
                prop_assert!(WalRecord::decode(&torn).is_err());
            }
        }
    }
}
