//! Sled value (de)serialization via `bincode::serde::{encode_to_vec,
//! decode_from_slice}`.

use bincode::config;
use serde::{de::DeserializeOwned, Serialize};

use crate::fatal;
use siot_data::StoreError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::serde::decode_from_slice(bytes, config::standard())
        .map(|(v, _)| v)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

pub fn tree_get<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> Result<Option<T>, StoreError> {
    match tree.get(key).map_err(fatal)? {
        Some(ivec) => Ok(Some(decode(&ivec)?)),
        None => Ok(None),
    }
}

pub fn tree_put<T: Serialize>(tree: &sled::Tree, key: &[u8], value: &T) -> Result<(), StoreError> {
    let bytes = encode(value)?;
    tree.insert(key, bytes).map_err(fatal)?;
    Ok(())
}

/// Composite key for the `nodes_by_type` index: `type\0id`, so every id for
/// a given type sorts contiguously and `scan_prefix(type\0)` finds them all.
pub fn type_key(typ: &str, id: siot_data::NodeID) -> Vec<u8> {
    let mut key = Vec::with_capacity(typ.len() + 1 + 36);
    key.extend_from_slice(typ.as_bytes());
    key.push(0);
    key.extend_from_slice(id.to_string().as_bytes());
    key
}

/// The type-index prefix shared by every id registered under `typ`.
pub fn type_prefix(typ: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(typ.len() + 1);
    key.extend_from_slice(typ.as_bytes());
    key.push(0);
    key
}
