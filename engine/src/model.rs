//! Core data model for backup runs.
//!
//! - SourceItem: one file found by the collector
//! - RunConfig: the immutable description of a run (sources, destination, flags)
//! - RunStats: per-run counters
//! - RunState: the run state machine
//! - BackupRunRecord: the summary persisted after a run

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::ChecksumAlgorithm;
use crate::error::{EngineError, Result};

/// Where a collected file came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Found while walking a configured source directory
    Directory { root: PathBuf },
    /// Listed directly as a loose source file
    File,
}

/// A single file in the backup manifest. Immutable once collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    /// Full path of the file on the local machine
    pub absolute_path: PathBuf,

    /// Path relative to its source root (the basename for loose files)
    pub relative_path: PathBuf,

    /// Size in bytes at collection time
    pub size_bytes: u64,

    pub origin: Origin,
}

impl SourceItem {
    /// The source directory this item was found under, if any.
    pub fn origin_root(&self) -> Option<&Path> {
        match &self.origin {
            Origin::Directory { root } => Some(root),
            Origin::File => None,
        }
    }

    /// File name of the item, falling back to the relative path.
    pub fn basename(&self) -> &std::ffi::OsStr {
        self.absolute_path
            .file_name()
            .unwrap_or_else(|| self.relative_path.as_os_str())
    }
}

/// Unit of work for the remote upload queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQueueItem {
    pub local_path: PathBuf,
    /// Posix-style path below the remote root
    pub remote_relative: String,
}

/// A credential that is never serialized and never printed.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// How the remote session authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RemoteAuth {
    Password {
        #[serde(skip)]
        password: Secret,
    },
    KeyFile {
        path: PathBuf,
        #[serde(skip)]
        passphrase: Option<Secret>,
    },
}

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_drain_grace_secs() -> u64 {
    5
}

/// Remote host and directory receiving an upload run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub auth: RemoteAuth,

    /// Target directory on the remote host
    pub remote_path: String,

    /// Connect and per-operation timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// How long to wait for workers once all queued work is accounted for
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,
}

impl RemoteTarget {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        auth: RemoteAuth,
        remote_path: impl Into<String>,
    ) -> Self {
        RemoteTarget {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth,
            remote_path: remote_path.into(),
            timeout_secs: default_timeout_secs(),
            drain_grace_secs: default_drain_grace_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    /// `user@host:port`, for logs
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    Local { path: PathBuf },
    Remote(RemoteTarget),
}

/// Behaviour switches for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFlags {
    /// Skip items the destination already holds an up-to-date copy of
    pub incremental: bool,
    /// Never visit files or directories whose name starts with `.`
    pub skip_hidden: bool,
    /// Write a single zip archive instead of a file tree (local only)
    pub compress: bool,
    /// Keep source roots as namespaces in the destination
    pub preserve_structure: bool,
    /// Write and compare `<file>.hash` sidecars (remote only)
    pub use_hash_check: bool,
    /// Parallel upload workers (remote only)
    pub max_workers: usize,
    /// Digest used for sidecar files
    pub hash_algorithm: ChecksumAlgorithm,
}

impl Default for RunFlags {
    fn default() -> Self {
        RunFlags {
            incremental: true,
            skip_hidden: true,
            compress: false,
            preserve_structure: true,
            use_hash_check: true,
            max_workers: 4,
            hash_algorithm: ChecksumAlgorithm::Md5,
        }
    }
}

/// Everything a run needs, supplied once and never mutated during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub source_dirs: Vec<PathBuf>,

    #[serde(default)]
    pub source_files: Vec<PathBuf>,

    pub destination: Destination,

    #[serde(default)]
    pub flags: RunFlags,
}

impl RunConfig {
    /// A run to a local target directory with default flags.
    pub fn local(
        source_dirs: Vec<PathBuf>,
        source_files: Vec<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Self {
        RunConfig {
            source_dirs,
            source_files,
            destination: Destination::Local {
                path: target.into(),
            },
            flags: RunFlags::default(),
        }
    }

    /// A run to a remote target with default flags.
    pub fn remote(source_dirs: Vec<PathBuf>, source_files: Vec<PathBuf>, target: RemoteTarget) -> Self {
        RunConfig {
            source_dirs,
            source_files,
            destination: Destination::Remote(target),
            flags: RunFlags::default(),
        }
    }

    /// Load a run profile from a JSON document.
    ///
    /// Credentials are never part of a profile and must be filled in afterwards.
    pub fn from_profile(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("cannot read profile {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            EngineError::InvalidConfig(format!("cannot parse profile {}: {}", path.display(), e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_dirs.is_empty() && self.source_files.is_empty() {
            return Err(EngineError::InvalidConfig("no sources configured".to_string()));
        }
        if self.flags.max_workers == 0 {
            return Err(EngineError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        match &self.destination {
            Destination::Local { path } if path.as_os_str().is_empty() => Err(
                EngineError::InvalidConfig("local destination path is empty".to_string()),
            ),
            Destination::Remote(target) if target.host.trim().is_empty() => Err(
                EngineError::InvalidConfig("remote host is empty".to_string()),
            ),
            Destination::Remote(target) if target.username.trim().is_empty() => Err(
                EngineError::InvalidConfig("remote username is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Counters for one run. Created fresh per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_files: usize,
    pub files_copied: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub total_size_bytes: u64,
}

impl RunStats {
    pub fn new(total_files: usize, total_size_bytes: u64) -> Self {
        RunStats {
            total_files,
            total_size_bytes,
            ..Default::default()
        }
    }

    pub fn processed(&self) -> usize {
        self.files_copied + self.files_skipped + self.files_failed
    }

    /// Every item was copied, skipped or failed.
    pub fn is_balanced(&self) -> bool {
        self.processed() == self.total_files
    }
}

/// Run state machine:
/// `Idle -> Collecting -> {Copying | Archiving | Uploading} -> Finalizing -> {Completed | Stopped | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Collecting,
    Copying,
    Archiving,
    Uploading,
    Finalizing,
    Completed,
    Stopped,
    Failed,
}

impl RunState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Stopped | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "Idle",
            RunState::Collecting => "Collecting",
            RunState::Copying => "Copying",
            RunState::Archiving => "Archiving",
            RunState::Uploading => "Uploading",
            RunState::Finalizing => "Finalizing",
            RunState::Completed => "Completed",
            RunState::Stopped => "Stopped",
            RunState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// What an executor hands back to the job once it stops consuming the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub stats: RunStats,
    pub stopped: bool,
    /// Backup directory (local) or `user@host:port:/path` (remote) actually used
    pub destination: String,
}

/// Summary of one run, persisted as `last_backup.json` for local targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRunRecord {
    pub id: Uuid,
    pub name: String,
    pub started_at: DateTime<Local>,
    #[serde(rename = "last_backup")]
    pub finished_at: Option<DateTime<Local>>,
    #[serde(rename = "backup_path")]
    pub destination_path: String,
    pub settings: RunFlags,
    pub state: RunState,
    pub stats: RunStats,
}

impl BackupRunRecord {
    pub fn begin(name: impl Into<String>, settings: RunFlags) -> Self {
        BackupRunRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            started_at: Local::now(),
            finished_at: None,
            destination_path: String::new(),
            settings,
            state: RunState::Idle,
            stats: RunStats::default(),
        }
    }

    pub fn finish(&mut self, state: RunState, stats: RunStats) {
        self.state = state;
        self.stats = stats;
        self.finished_at = Some(Local::now());
    }
}
