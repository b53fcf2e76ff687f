//! Byte adapters for moving snapshots over the relay.
//!
//! The relay stores and publishes raw bytes; adapters decide how a
//! [`Snapshot`] becomes bytes. Compression is a property of the adapter.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::snapshot::Snapshot;

/// Result type for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors that can occur while encoding or decoding snapshots.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),
}

/// Converts snapshots to and from bytes.
pub trait DataAdapter: Send + Sync {
    fn to_bytes(&self, snapshot: &Snapshot) -> Result<Vec<u8>>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<Snapshot>;
}

/// Plain JSON encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonAdapter;

impl DataAdapter for JsonAdapter {
    fn to_bytes(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(snapshot)?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Snapshot> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Deflate-compressed JSON encoding.
#[derive(Debug, Clone, Copy)]
pub struct CompressedJsonAdapter {
    level: Compression,
}

impl CompressedJsonAdapter {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for CompressedJsonAdapter {
    fn default() -> Self {
        Self {
            level: Compression::fast(),
        }
    }
}

impl DataAdapter for CompressedJsonAdapter {
    fn to_bytes(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(snapshot)?;
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(json.len() / 2), self.level);
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Snapshot> {
        let mut json = Vec::new();
        DeflateDecoder::new(bytes).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Select the adapter for the configured compression setting.
pub fn adapter_for(compress: bool) -> std::sync::Arc<dyn DataAdapter> {
    if compress {
        std::sync::Arc::new(CompressedJsonAdapter::default())
    } else {
        std::sync::Arc::new(JsonAdapter)
    }
}
