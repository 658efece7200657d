//! Bridge to the key-value store holding project and song records.
//!
//! Records live under slash-separated paths, e.g.
//! `projects/{project}/Songs/{key}/song/song_id`.

use crate::error::StoreLinkError;
use crate::StoreKey;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Allocates a key under the project's songs and starts writing `record`
    /// there. Returns immediately; the write may still be in flight.
    fn create_key(&self, project: &str, record: Value) -> StoreKey;

    async fn set_field(&self, path: &str, value: Value) -> Result<(), StoreLinkError>;

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreLinkError>;
}

pub fn new_key() -> StoreKey {
    StoreKey(Uuid::new_v4().simple().to_string())
}

pub fn song_record_path(project: &str, key: &StoreKey) -> String {
    format!("projects/{}/Songs/{}", project, key)
}

/// Where a song record keeps the id of its queued job.
pub fn song_id_path(project: &str, key: &StoreKey) -> String {
    format!("{}/song/song_id", song_record_path(project, key))
}

pub fn access_token_path(identity: &str) -> String {
    format!("users/{}/access_token", identity)
}

/// Flat in-process store; every path is written atomically.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self, path: String, value: Value) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, value);
    }

    /// Paths currently present, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    fn create_key(&self, project: &str, record: Value) -> StoreKey {
        let key = new_key();
        self.write(song_record_path(project, &key), record);
        key
    }

    async fn set_field(&self, path: &str, value: Value) -> Result<(), StoreLinkError> {
        self.write(path.to_string(), value);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreLinkError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned())
    }
}
