//! Binlog Format
//!
//! Insert logs and delta logs share one framing:
//!
//! ```text
//! Header (24 bytes, little endian):
//! ├─ magic: [u8; 4]      = b"SLTB"
//! ├─ version: u16        = 1
//! ├─ kind: u8            (1 = insert, 2 = delta)
//! ├─ reserved: u8
//! ├─ entry_count: u64
//! └─ payload_len: u64
//!
//! Payload:
//! └─ JSON array of rows or delete records
//!
//! Footer (32 bytes):
//! └─ SHA-256 over header + payload
//! ```
//!
//! Any mismatch on decode (magic, version, kind, lengths, checksum, entry
//! count) surfaces as [`CoreError::Corruption`] naming the object key.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use silt_core::{CollectionId, CoreError, CoreResult, DeltaRecord, PartitionId, Row, SegmentId};

const MAGIC: &[u8; 4] = b"SLTB";

const VERSION: u16 = 1;

const HEADER_SIZE: usize = 24;

const CHECKSUM_SIZE: usize = 32;

/// Which log a binlog holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinlogKind {
    Insert = 1,
    Delta = 2,
}

impl BinlogKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Insert),
            2 => Some(Self::Delta),
            _ => None,
        }
    }

    const fn file_name(&self) -> &'static str {
        match self {
            Self::Insert => "insert_log",
            Self::Delta => "delta_log",
        }
    }
}

/// Object key of a segment's log: `{collection}/{partition}/{segment}/{insert_log|delta_log}`.
#[must_use]
pub fn log_key(
    collection: CollectionId,
    partition: PartitionId,
    segment: SegmentId,
    kind: BinlogKind,
) -> String {
    format!("{collection}/{partition}/{segment}/{}", kind.file_name())
}

fn encode<T: Serialize>(kind: BinlogKind, entries: &[T]) -> CoreResult<Bytes> {
    let payload = serde_json::to_vec(entries)
        .map_err(|e| CoreError::SerializationError(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    buf.put_slice(MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u8(kind as u8);
    buf.put_u8(0);
    buf.put_u64_le(entries.len() as u64);
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(&payload);

    let checksum = Sha256::digest(&buf);
    buf.put_slice(&checksum);

    debug!(
        kind = ?kind,
        entries = entries.len(),
        bytes = buf.len(),
        "Encoded binlog"
    );
    Ok(buf.freeze())
}

fn decode<T: DeserializeOwned>(key: &str, expected: BinlogKind, data: &[u8]) -> CoreResult<Vec<T>> {
    if data.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(CoreError::corruption(
            key,
            format!("truncated binlog ({} bytes)", data.len()),
        ));
    }

    let (body, footer) = data.split_at(data.len() - CHECKSUM_SIZE);
    if Sha256::digest(body).as_slice() != footer {
        return Err(CoreError::corruption(key, "checksum mismatch"));
    }

    let mut header = &body[..HEADER_SIZE];
    let mut magic = [0u8; 4];
    header.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(CoreError::corruption(key, "bad magic"));
    }
    let version = header.get_u16_le();
    if version != VERSION {
        return Err(CoreError::corruption(
            key,
            format!("unsupported binlog version {version}"),
        ));
    }
    let kind = header.get_u8();
    if BinlogKind::from_u8(kind) != Some(expected) {
        return Err(CoreError::corruption(
            key,
            format!("expected {expected:?} binlog, found kind {kind}"),
        ));
    }
    let _reserved = header.get_u8();
    let entry_count = header.get_u64_le();
    let payload_len = header.get_u64_le();

    let payload = &body[HEADER_SIZE..];
    if payload.len() as u64 != payload_len {
        return Err(CoreError::corruption(
            key,
            format!("payload length {} != header {payload_len}", payload.len()),
        ));
    }

    let entries: Vec<T> = serde_json::from_slice(payload)
        .map_err(|e| CoreError::corruption(key, format!("payload: {e}")))?;
    if entries.len() as u64 != entry_count {
        return Err(CoreError::corruption(
            key,
            format!("entry count {} != header {entry_count}", entries.len()),
        ));
    }
    Ok(entries)
}

/// Encodes an insert log.
pub fn encode_insert_log(rows: &[Row]) -> CoreResult<Bytes> {
    encode(BinlogKind::Insert, rows)
}

/// Decodes and verifies an insert log read from `key`.
pub fn decode_insert_log(key: &str, data: &[u8]) -> CoreResult<Vec<Row>> {
    decode(key, BinlogKind::Insert, data)
}

/// Encodes a delta log.
pub fn encode_delta_log(deltas: &[DeltaRecord]) -> CoreResult<Bytes> {
    encode(BinlogKind::Delta, deltas)
}

/// Decodes and verifies a delta log read from `key`.
pub fn decode_delta_log(key: &str, data: &[u8]) -> CoreResult<Vec<DeltaRecord>> {
    decode(key, BinlogKind::Delta, data)
}
