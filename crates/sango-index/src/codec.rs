//! Little-endian helpers for the index blob format.
//!
//! Blob layout, shared by every family:
//! - magic: u32 ("SGIX")
//! - kind: u8
//! - metric: u8
//! - dim: u32
//! - count: u64
//! - family payload
//! - crc32c: u32 (over everything before it)

use crate::types::{IndexKind, Metric};
use crate::{IndexError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub(crate) const BLOB_MAGIC: u32 = 0x5347_4958; // "SGIX"

pub(crate) struct BlobHeader {
    pub kind: IndexKind,
    pub metric: Metric,
    pub dim: usize,
    pub count: usize,
}

pub(crate) fn start_blob(header: &BlobHeader) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(BLOB_MAGIC);
    buf.put_u8(header.kind.to_tag());
    buf.put_u8(header.metric.to_tag());
    buf.put_u32_le(header.dim as u32);
    buf.put_u64_le(header.count as u64);
    buf
}

pub(crate) fn finish_blob(mut buf: BytesMut) -> Bytes {
    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);
    buf.freeze()
}

/// Validates magic and trailing CRC, returning the header and a cursor over
/// the family payload.
pub(crate) fn open_blob(blob: &[u8]) -> Result<(BlobHeader, &[u8])> {
    if blob.len() < 18 + 4 {
        return Err(IndexError::CorruptBlob("blob too short".into()));
    }
    let (body, crc_bytes) = blob.split_at(blob.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    let actual = crc32c::crc32c(body);
    if stored != actual {
        return Err(IndexError::CorruptBlob(format!(
            "crc mismatch: stored {stored:#x}, actual {actual:#x}"
        )));
    }

    let mut cursor = body;
    if cursor.get_u32_le() != BLOB_MAGIC {
        return Err(IndexError::CorruptBlob("bad magic".into()));
    }
    let kind = IndexKind::from_tag(cursor.get_u8())?;
    let metric = Metric::from_tag(cursor.get_u8())?;
    let dim = cursor.get_u32_le() as usize;
    let count = cursor.get_u64_le() as usize;
    Ok((
        BlobHeader {
            kind,
            metric,
            dim,
            count,
        },
        cursor,
    ))
}

pub(crate) fn put_f32s(buf: &mut BytesMut, values: &[f32]) {
    buf.reserve(values.len() * 4);
    for v in values {
        buf.put_f32_le(*v);
    }
}

pub(crate) fn put_i64s(buf: &mut BytesMut, values: &[i64]) {
    buf.reserve(values.len() * 8);
    for v in values {
        buf.put_i64_le(*v);
    }
}

pub(crate) fn take_f32s(cursor: &mut &[u8], n: usize) -> Result<Vec<f32>> {
    if cursor.remaining() < n * 4 {
        return Err(IndexError::CorruptBlob("truncated f32 run".into()));
    }
    Ok((0..n).map(|_| cursor.get_f32_le()).collect())
}

pub(crate) fn take_i64s(cursor: &mut &[u8], n: usize) -> Result<Vec<i64>> {
    if cursor.remaining() < n * 8 {
        return Err(IndexError::CorruptBlob("truncated i64 run".into()));
    }
    Ok((0..n).map(|_| cursor.get_i64_le()).collect())
}

pub(crate) fn take_bytes(cursor: &mut &[u8], n: usize) -> Result<Vec<u8>> {
    if cursor.remaining() < n {
        return Err(IndexError::CorruptBlob("truncated byte run".into()));
    }
    let out = cursor[..n].to_vec();
    cursor.advance(n);
    Ok(out)
}
