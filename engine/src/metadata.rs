//! Run metadata documents.
//!
//! - `last_backup.json` at a local target root, written after every local run
//! - `backup_metadata.json` inside each backup directory (and archive)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::model::{BackupRunRecord, RunConfig};

pub const LAST_BACKUP_FILE: &str = "last_backup.json";
pub const RUN_METADATA_FILE: &str = "backup_metadata.json";

fn artifact_error(path: &Path) -> impl FnOnce(io::Error) -> EngineError + '_ {
    move |source| EngineError::ArtifactSetup {
        path: path.to_path_buf(),
        source,
    }
}

/// Persists the last run record of one local target root.
#[derive(Debug, Clone)]
pub struct BackupMetadataStore {
    root: PathBuf,
}

impl BackupMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BackupMetadataStore { root: root.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(LAST_BACKUP_FILE)
    }

    pub fn save(&self, record: &BackupRunRecord) -> Result<()> {
        let path = self.path();
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| artifact_error(&path)(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(&path, json).map_err(artifact_error(&path))?;
        debug!(path = %path.display(), "saved last backup record");
        Ok(())
    }

    /// The last saved record, or `None` when absent or unreadable.
    pub fn load_last(&self) -> Option<BackupRunRecord> {
        let path = self.path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read last backup record");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt last backup record");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSettings {
    pub incremental: bool,
    pub compress: bool,
    pub preserve_structure: bool,
    pub skip_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSources {
    pub directories: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

/// Describes one backup directory: when, from where, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub backup_name: String,
    pub timestamp: DateTime<Local>,
    pub settings: MetadataSettings,
    pub sources: MetadataSources,
    pub archive_name: Option<String>,
}

impl RunMetadata {
    pub fn new(backup_name: impl Into<String>, config: &RunConfig, archive_name: Option<String>) -> Self {
        RunMetadata {
            backup_name: backup_name.into(),
            timestamp: Local::now(),
            settings: MetadataSettings {
                incremental: config.flags.incremental,
                compress: config.flags.compress,
                preserve_structure: config.flags.preserve_structure,
                skip_hidden: config.flags.skip_hidden,
            },
            sources: MetadataSources {
                directories: config.source_dirs.clone(),
                files: config.source_files.clone(),
            },
            archive_name,
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(RUN_METADATA_FILE);
        fs::write(&path, self.to_json()).map_err(artifact_error(&path))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunFlags, RunState, RunStats};

    #[test]
    fn test_save_then_load_last() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = BackupMetadataStore::new(temp_dir.path());
        assert!(store.load_last().is_none());

        let mut record = BackupRunRecord::begin("backup_20240101_120000", RunFlags::default());
        record.destination_path = temp_dir.path().join("backup_20240101_120000").display().to_string();
        let mut stats = RunStats::new(3, 60);
        stats.files_copied = 3;
        record.finish(RunState::Completed, stats);
        store.save(&record).expect("save");

        let loaded = store.load_last().expect("record");
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.stats, stats);
        assert_eq!(loaded.destination_path, record.destination_path);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(raw["last_backup"].is_string());
        assert_eq!(raw["stats"]["files_copied"], 3);
    }

    #[test]
    fn test_corrupt_record_reads_as_absent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = BackupMetadataStore::new(temp_dir.path());
        fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load_last().is_none());
    }

    #[test]
    fn test_save_into_missing_root_is_artifact_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = BackupMetadataStore::new(temp_dir.path().join("missing"));
        let record = BackupRunRecord::begin("x", RunFlags::default());
        assert!(matches!(store.save(&record), Err(EngineError::ArtifactSetup { .. })));
    }

    #[test]
    fn test_run_metadata_document() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = RunConfig::local(vec![PathBuf::from("/data")], vec![PathBuf::from("/etc/hosts")], "/mnt");
        let metadata = RunMetadata::new("backup_1", &config, Some("backup.zip".to_string()));

        let path = metadata.write_to(temp_dir.path()).expect("write");
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();

        assert_eq!(raw["backup_name"], "backup_1");
        assert_eq!(raw["archive_name"], "backup.zip");
        assert_eq!(raw["settings"]["incremental"], true);
        assert_eq!(raw["sources"]["directories"][0], "/data");
        assert!(raw["timestamp"].is_string());
    }
}
