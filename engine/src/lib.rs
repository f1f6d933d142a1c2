//! # BackUP Engine - Incremental Backup Library
//!
//! A headless backup engine in Rust, shared by the command line and any
//! other front end.
//!
//! ## Overview
//!
//! The engine collects files from source directories and loose source files,
//! then either copies them to a local target (as a tree or a single zip
//! archive) or uploads them to a remote host over SFTP with a pool of
//! workers. It features:
//! - Hidden-entry pruning during collection
//! - Incremental runs (mtime for local targets, stat plus hash sidecar for remote ones)
//! - Per-file error isolation; only setup faults abort a run
//! - Cooperative cancellation through a shared stop flag
//! - Progress and log reporting through an injected sink
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use backup_engine::{run_backup, NullSink, RunConfig, StopFlag};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::local(
//!     vec!["/home/me/documents".into()],
//!     vec![],
//!     "/mnt/usb/backups",
//! );
//!
//! let record = run_backup(config, Arc::new(NullSink), StopFlag::new())?;
//! println!(
//!     "{}: {} copied, {} skipped, {} failed",
//!     record.state,
//!     record.stats.files_copied,
//!     record.stats.files_skipped,
//!     record.stats.files_failed,
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (RunConfig, SourceItem, RunStats, RunState)
//! - **error**: Error types and setup/transfer classification
//! - **collector**: Source enumeration into a manifest
//! - **policy**: Incremental skip decisions
//! - **fs_ops**: Local layout rules and file copy
//! - **local**: Local tree/archive executor
//! - **remote**: Remote transport, SFTP and the upload scheduler
//! - **metadata**: Last-backup record and run metadata documents
//! - **disk**: Target filesystem capacity
//! - **job**: Job orchestration (create, plan, run)
//! - **progress**: Progress sink trait, reporter and stop flag
//! - **checksums**: Content digests for hash sidecars

pub mod checksums;
pub mod collector;
pub mod disk;
pub mod error;
pub mod fs_ops;
pub mod job;
pub mod local;
pub mod metadata;
pub mod model;
pub mod policy;
pub mod progress;
pub mod remote;

// Re-export main types and functions
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use collector::{FileCollector, Manifest};
pub use error::{EngineError, Result};
pub use job::{create_job, plan_job, run_backup, run_job, run_job_with_transport, BackupJob};
pub use local::LocalBackupExecutor;
pub use metadata::{BackupMetadataStore, RunMetadata};
pub use model::{
    BackupRunRecord, Destination, ExecutionSummary, Origin, RemoteAuth, RemoteQueueItem,
    RemoteTarget, RunConfig, RunFlags, RunState, RunStats, Secret, SourceItem,
};
pub use policy::IncrementalPolicy;
pub use progress::{LogEvent, NullSink, ProgressEvent, ProgressSink, Reporter, Severity, StopFlag};
pub use remote::{RemoteChannel, RemoteTransport, RemoteUploadScheduler, SftpTransport};
