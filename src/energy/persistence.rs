//! # Energy Counter Persistence
//!
//! Durable key/value storage for the energy totals. The backing store is a
//! collaborator concern, so it sits behind a trait; the provided
//! implementation keeps one JSON record on disk and replaces it atomically
//! (write to a scratch file, then rename).

use crate::error::Error;
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Storage key for the lifetime charged total.
pub const KEY_CHARGED_WH: &str = "energy/charged_wh";
/// Storage key for the lifetime discharged total.
pub const KEY_DISCHARGED_WH: &str = "energy/discharged_wh";

/// Durable key/value store for 64-bit float records.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads one record; `Ok(None)` when the key has never been written.
    async fn read_f64(&self, key: &str) -> Result<Option<f64>, Error>;

    /// Writes a batch of records atomically: either all land or none do.
    async fn write_f64_batch(&self, entries: &[(&str, f64)]) -> Result<(), Error>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: BTreeMap<String, f64>,
}

/// JSON-file-backed store. The whole record set is small (two floats), so
/// a full rewrite per persist is cheaper than any journalling scheme.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    /// Loads the record map; a missing or corrupt file yields an empty map.
    async fn load(&self) -> StoreFile {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(file) => file,
                Err(e) => {
                    warn!(
                        "energy store {} is corrupt ({e}), starting from zero",
                        self.path.display()
                    );
                    StoreFile::default()
                }
            },
            Err(_) => StoreFile::default(),
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn read_f64(&self, key: &str) -> Result<Option<f64>, Error> {
        Ok(self.load().await.records.get(key).copied())
    }

    async fn write_f64_batch(&self, entries: &[(&str, f64)]) -> Result<(), Error> {
        let mut file = self.load().await;
        for (key, value) in entries {
            file.records.insert((*key).to_string(), *value);
        }

        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let scratch = self.path.with_extension("tmp");
        tokio::fs::write(&scratch, &bytes)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        tokio::fs::rename(&scratch, &self.path)
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }
}
