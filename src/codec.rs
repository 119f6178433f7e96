//! Binary per-entry record codec and embedding (de)serialization.
//!
//! Layout (big-endian lengths, UTF-8 payloads):
//!
//! ```text
//! ┌────┬───────┬────┬─────────┬────┬────────┬────┬────┬────┐
//! │ 4B │ text  │ 4B │ emb_b64 │ 4B │ meta   │ 8B │ 4B │ 8B │
//! │ tL │       │ eL │         │ mL │ _json  │ ts │ ac │ la │
//! └────┴───────┴────┴─────────┴────┴────────┴────┴────┴────┘
//! ```
//!
//! `emb_b64` is base64 of the embedding's IEEE-754 `f32` little-endian byte
//! sequence. `meta_json` is the canonical (key-sorted) JSON object form of
//! the metadata map. `ts` is the creation timestamp in milliseconds, split
//! into two big-endian `u32` halves (high, low). `ac`/`la` are the access
//! stats, `0`/`0` when the volume has never been accessed.

use crate::volume::{AccessStats, Volume};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A decode failure. The caller (engine load path) is expected to log a
/// warning, skip the record, and mark the store dirty — not propagate this
/// as a fatal error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("record truncated: need {need} more bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 { field: &'static str },
    #[error("invalid base64 embedding: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("embedding byte length {0} is not a multiple of 4")]
    MisalignedEmbedding(usize),
    #[error("invalid metadata json: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Encode a volume plus its access stats into the binary record format.
pub fn encode_record(volume: &Volume, access: AccessStats) -> Vec<u8> {
    let text_bytes = volume.text.as_bytes();

    let mut emb_bytes = Vec::with_capacity(volume.embedding.len() * 4);
    for component in &volume.embedding {
        emb_bytes.extend_from_slice(&component.to_le_bytes());
    }
    let emb_b64 = BASE64.encode(&emb_bytes);
    let emb_b64_bytes = emb_b64.as_bytes();

    let canonical: BTreeMap<&String, &String> = volume.metadata.iter().collect();
    // Canonical JSON object form: serde_json serializes BTreeMap keys in sorted order.
    let meta_json = serde_json::to_vec(&canonical).expect("metadata serialization is infallible");

    let ts_hi = (volume.timestamp >> 32) as u32;
    let ts_lo = (volume.timestamp & 0xFFFF_FFFF) as u32;

    let mut buf = Vec::with_capacity(
        4 + text_bytes.len() + 4 + emb_b64_bytes.len() + 4 + meta_json.len() + 8 + 4 + 8,
    );
    buf.extend_from_slice(&(text_bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(text_bytes);
    buf.extend_from_slice(&(emb_b64_bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(emb_b64_bytes);
    buf.extend_from_slice(&(meta_json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&meta_json);
    buf.extend_from_slice(&ts_hi.to_be_bytes());
    buf.extend_from_slice(&ts_lo.to_be_bytes());
    buf.extend_from_slice(&access.access_count.to_be_bytes());
    buf.extend_from_slice(&access.last_accessed.to_be_bytes());
    buf
}

/// Decode a binary record back into a `(Volume, AccessStats)` pair.
///
/// `id` comes from the storage backend's key, not from the record body —
/// the codec never stores the id itself (the key→bytes mapping already
/// carries it).
pub fn decode_record(id: Uuid, bytes: &[u8]) -> Result<(Volume, AccessStats), CodecError> {
    let mut cursor = Cursor::new(bytes);

    let text = cursor.take_len_prefixed_utf8("text")?;
    let emb_b64 = cursor.take_len_prefixed_utf8("embedding")?;
    let meta_json = cursor.take_len_prefixed_bytes()?;
    let ts_hi = cursor.take_u32()?;
    let ts_lo = cursor.take_u32()?;
    let access_count = cursor.take_u32()?;
    let last_accessed = cursor.take_u64()?;

    let emb_bytes = BASE64.decode(emb_b64.as_bytes())?;
    if emb_bytes.len() % 4 != 0 {
        return Err(CodecError::MisalignedEmbedding(emb_bytes.len()));
    }
    let embedding: Vec<f32> = emb_bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let metadata: BTreeMap<String, String> = serde_json::from_slice(meta_json)?;
    let metadata = metadata.into_iter().collect();

    let timestamp = ((ts_hi as u64) << 32) | ts_lo as u64;
    let volume = Volume::from_parts(id, text, embedding, metadata, timestamp);
    let access = AccessStats {
        access_count,
        last_accessed,
    };
    Ok((volume, access))
}

/// Tiny forward-only byte cursor used only by [`decode_record`]. Kept
/// private — the record format is an implementation detail of this module.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.pos + n > self.bytes.len() {
            Err(CodecError::Truncated {
                need: self.pos + n - self.bytes.len(),
                have: self.bytes.len() - self.pos,
            })
        } else {
            Ok(())
        }
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        let v = u32::from_be_bytes(self.bytes[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn take_u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        let v = u64::from_be_bytes(self.bytes[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn take_len_prefixed_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.take_u32()? as usize;
        self.need(len)?;
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_len_prefixed_utf8(&mut self, field: &'static str) -> Result<String, CodecError> {
        let bytes = self.take_len_prefixed_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
    }
}
