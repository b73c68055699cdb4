//! On-disk encoding of one checkpoint entry.
//!
//! An entry is a single JSON header line followed by the JSON-encoded
//! `TrainingState`. The header carries a SHA-256 digest of the payload bytes so
//! truncated or altered files are detected on load.

use crate::error::{TrainingError, TrainingResult};
use crate::state::TrainingState;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub version: u32,
    pub index: u64,
    pub created_at: DateTime<Utc>,
    pub sha256: String,
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn encode<S: Serialize>(index: u64, state: &TrainingState<S>) -> TrainingResult<Vec<u8>> {
    let payload = serde_json::to_vec(state)?;
    let header = CheckpointHeader {
        version: FORMAT_VERSION,
        index,
        created_at: Utc::now(),
        sha256: sha256_hex(&payload),
    };

    let mut out = serde_json::to_vec(&header)?;
    out.push(b'\n');
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes and verifies an entry read from `path`. Every failure is a corruption error.
pub fn decode<S: DeserializeOwned>(path: &Path, bytes: &[u8]) -> TrainingResult<(CheckpointHeader, TrainingState<S>)> {
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| TrainingError::corruption(path, "missing header line"))?;
    let (header_bytes, payload) = (&bytes[..split], &bytes[split + 1..]);

    let header: CheckpointHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| TrainingError::corruption(path, format!("unreadable header: {e}")))?;
    if header.version != FORMAT_VERSION {
        return Err(TrainingError::corruption(
            path,
            format!("unsupported format version {}", header.version),
        ));
    }

    let digest = sha256_hex(payload);
    if digest != header.sha256 {
        return Err(TrainingError::corruption(
            path,
            format!("payload digest {digest} does not match header {}", header.sha256),
        ));
    }

    let state = serde_json::from_slice(payload)
        .map_err(|e| TrainingError::corruption(path, format!("undecodable payload: {e}")))?;
    Ok((header, state))
}
