//! Byte encoding of cached per-segment results

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode one segment's rows as cache bytes
pub fn encode_rows<T: Serialize>(rows: &[T]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(rows)?)
}

/// Decode cache bytes back into rows
pub fn decode_rows<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    Ok(serde_json::from_slice(bytes)?)
}
