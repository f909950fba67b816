//! Filesystem layout of the backup directory
//!
//! Each backup is a pair: `<name>.sql` holds the dump and `<name>.json`
//! holds its metadata. The sidecar is written last, so a pair with a missing
//! half is an incomplete or damaged backup and is never listed.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use pgwarden_core::{BackupName, WardenError, WardenResult};

const DATA_EXTENSION: &str = "sql";
const METADATA_EXTENSION: &str = "json";

/// Contents of the `<name>.json` sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub name: BackupName,
    pub timestamp: DateTime<Utc>,
    pub database: String,
    /// Size of the data file in bytes
    pub size: u64,
    #[serde(default)]
    pub automatic: bool,
}

/// A complete backup as reported by listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub name: BackupName,
    pub timestamp: DateTime<Utc>,
    pub database: String,
    pub size_bytes: u64,
    pub path: PathBuf,
    pub automatic: bool,
}

impl BackupRecord {
    fn from_metadata(metadata: BackupMetadata, path: PathBuf) -> Self {
        Self {
            name: metadata.name,
            timestamp: metadata.timestamp,
            database: metadata.database,
            size_bytes: metadata.size,
            path,
            automatic: metadata.automatic,
        }
    }
}

/// Backup directory accessor
#[derive(Debug, Clone)]
pub struct BackupStore {
    directory: PathBuf,
}

impl BackupStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn data_path(&self, name: &BackupName) -> PathBuf {
        self.directory
            .join(format!("{}.{DATA_EXTENSION}", name.as_str()))
    }

    pub fn metadata_path(&self, name: &BackupName) -> PathBuf {
        self.directory
            .join(format!("{}.{METADATA_EXTENSION}", name.as_str()))
    }

    pub async fn ensure_directory(&self) -> WardenResult<()> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| WardenError::backup_io(&self.directory, e))
    }

    /// Whether either half of `name` is present
    pub async fn exists(&self, name: &BackupName) -> WardenResult<bool> {
        for path in [self.data_path(name), self.metadata_path(name)] {
            if fs::try_exists(&path)
                .await
                .map_err(|e| WardenError::backup_io(&path, e))?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn data_exists(&self, name: &BackupName) -> WardenResult<bool> {
        let path = self.data_path(name);
        fs::try_exists(&path)
            .await
            .map_err(|e| WardenError::backup_io(&path, e))
    }

    pub async fn data_size(&self, name: &BackupName) -> WardenResult<u64> {
        let path = self.data_path(name);
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| WardenError::backup_io(&path, e))?;
        Ok(metadata.len())
    }

    /// Write the sidecar through a temporary file and rename it into place
    pub async fn write_metadata(&self, metadata: &BackupMetadata) -> WardenResult<()> {
        let path = self.metadata_path(&metadata.name);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(metadata)?;

        fs::write(&tmp_path, json)
            .await
            .map_err(|e| WardenError::backup_io(&tmp_path, e))?;
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(WardenError::backup_io(&path, e));
        }
        Ok(())
    }

    pub async fn read_metadata(&self, name: &BackupName) -> WardenResult<BackupMetadata> {
        let path = self.metadata_path(name);
        let raw = fs::read(&path)
            .await
            .map_err(|e| WardenError::backup_io(&path, e))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Every complete backup, in no particular order. A missing directory
    /// lists as empty.
    pub async fn list(&self) -> WardenResult<Vec<BackupRecord>> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WardenError::backup_io(&self.directory, e)),
        };

        // stem -> (has data, has metadata)
        let mut halves: BTreeMap<String, (bool, bool)> = BTreeMap::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WardenError::backup_io(&self.directory, e))?
        {
            let path = entry.path();
            let (Some(stem), Some(extension)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            let slot = halves.entry(stem.to_string()).or_default();
            match extension {
                DATA_EXTENSION => slot.0 = true,
                METADATA_EXTENSION => slot.1 = true,
                _ => {}
            }
        }

        let mut records = Vec::new();
        for (stem, (has_data, has_metadata)) in halves {
            if !has_data && !has_metadata {
                continue;
            }
            let Ok(name) = BackupName::new(stem.as_str()) else {
                debug!(file = %stem, "Ignoring file with a non-backup name");
                continue;
            };
            if !(has_data && has_metadata) {
                warn!(
                    backup = %name,
                    has_data,
                    has_metadata,
                    "Skipping incomplete backup"
                );
                continue;
            }

            match self.read_metadata(&name).await {
                Ok(metadata) if metadata.name == name => {
                    records.push(BackupRecord::from_metadata(metadata, self.data_path(&name)));
                }
                Ok(metadata) => warn!(
                    backup = %name,
                    recorded = %metadata.name,
                    "Skipping backup whose metadata names a different backup"
                ),
                Err(e) => warn!(backup = %name, error = %e, "Skipping backup with unreadable metadata"),
            }
        }
        Ok(records)
    }

    /// Remove both halves. Missing files are not an error.
    pub async fn remove(&self, name: &BackupName) -> WardenResult<()> {
        for path in [self.metadata_path(name), self.data_path(name)] {
            remove_if_present(&path).await?;
        }
        Ok(())
    }

    pub async fn remove_data(&self, name: &BackupName) -> WardenResult<()> {
        remove_if_present(&self.data_path(name)).await
    }
}

async fn remove_if_present(path: &Path) -> WardenResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WardenError::backup_io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(name: &str, automatic: bool) -> BackupMetadata {
        BackupMetadata {
            name: BackupName::new(name).unwrap(),
            timestamp: Utc::now(),
            database: "app".into(),
            size: 4,
            automatic,
        }
    }

    #[tokio::test]
    async fn lists_only_complete_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());

        let complete = metadata("complete", false);
        fs::write(store.data_path(&complete.name), "--\n").await.unwrap();
        store.write_metadata(&complete).await.unwrap();

        let data_only = BackupName::new("data-only").unwrap();
        fs::write(store.data_path(&data_only), "--\n").await.unwrap();
        store.write_metadata(&metadata("sidecar-only", true)).await.unwrap();

        let corrupt = BackupName::new("corrupt").unwrap();
        fs::write(store.data_path(&corrupt), "--\n").await.unwrap();
        fs::write(store.metadata_path(&corrupt), "{not json").await.unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_str(), "complete");
        assert_eq!(records[0].path, dir.path().join("complete.sql"));
    }

    #[tokio::test]
    async fn missing_directory_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sidecar_round_trips_as_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let written = metadata("nightly", true);
        store.write_metadata(&written).await.unwrap();

        let raw = std::fs::read_to_string(store.metadata_path(&written.name)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(json["automatic"], true);

        assert_eq!(store.read_metadata(&written.name).await.unwrap(), written);
        assert!(!dir.path().join("nightly.json.tmp").exists());
    }

    #[tokio::test]
    async fn remove_tolerates_missing_halves() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let name = BackupName::new("half").unwrap();
        fs::write(store.data_path(&name), "--\n").await.unwrap();

        store.remove(&name).await.unwrap();
        assert!(!store.exists(&name).await.unwrap());
        store.remove(&name).await.unwrap();
    }
}
