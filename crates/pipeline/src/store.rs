use std::fs;
use std::path::PathBuf;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Maps a public token to a published bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub token: String,
    pub asset_key: String,
    pub job_id: String,
    pub display_name: String,
    pub bundle_root: PathBuf,
    pub master_playlist: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Persistence for content records. The store is the source of truth for what is servable.
pub trait MetadataStore: Send + Sync {
    /// Persist a record and return its token
    fn put(&self, record: ContentRecord) -> Result<String, StoreError>;

    /// Whether any record carries `asset_key`. Used by intake for dedup.
    fn exists(&self, asset_key: &str) -> Result<bool, StoreError>;
}

/// One JSON file per record, named after its token
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileMetadataStore { dir: dir.into() }
    }

    fn record_path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{}.json", token))
    }

    pub fn get(&self, token: &str) -> Result<Option<ContentRecord>, StoreError> {
        let path = self.record_path(token);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

impl MetadataStore for FileMetadataStore {
    fn put(&self, record: ContentRecord) -> Result<String, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let json = serde_json::to_string_pretty(&record)?;
        let path = self.record_path(&record.token);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path: path.clone(), source })?;

        debug!("Stored content record {}", path.display());
        Ok(record.token)
    }

    fn exists(&self, asset_key: &str) -> Result<bool, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(StoreError::Io { path: self.dir.clone(), source }),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: ContentRecord = match fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str(&c).ok())
            {
                Some(r) => r,
                None => {
                    warn!("Skipping unreadable content record: {}", path.display());
                    continue;
                }
            };
            if record.asset_key == asset_key {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
