//! Job orchestration module.
//!
//! This module provides the backup job lifecycle:
//! - Creating a job from a validated run configuration
//! - Planning a job (collecting the source manifest)
//! - Running a job (local copy/archive or remote upload) and recording it
//!
//! `run_backup` drives all three steps for callers that do not need to
//! inspect the manifest in between.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::collector::{FileCollector, Manifest};
use crate::disk::{disk_stats_for, format_bytes};
use crate::error::{EngineError, Result};
use crate::local::LocalBackupExecutor;
use crate::metadata::BackupMetadataStore;
use crate::model::{BackupRunRecord, Destination, ExecutionSummary, RunConfig, RunState, RunStats};
use crate::progress::{ProgressSink, Reporter, StopFlag};
use crate::remote::{RemoteTransport, RemoteUploadScheduler, SftpTransport};

/// A backup run and everything known about it so far.
pub struct BackupJob {
    pub config: RunConfig,
    pub state: RunState,
    pub manifest: Manifest,
    /// Filled in as the run progresses; final once the state is terminal
    pub record: BackupRunRecord,
    reporter: Reporter,
    stop: StopFlag,
}

impl BackupJob {
    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    fn transition(&mut self, state: RunState) {
        debug!(from = %self.state, to = %state, "job state change");
        self.state = state;
        self.record.state = state;
    }

    fn require(&self, expected: RunState) -> Result<()> {
        if self.state != expected {
            return Err(EngineError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Record a setup fault and hand it back to the caller.
    fn fail(&mut self, error: EngineError) -> EngineError {
        self.reporter.error(format!("Backup failed: {}", error));
        let stats = RunStats::new(self.manifest.items.len(), self.manifest.total_bytes);
        self.transition(RunState::Failed);
        self.record.finish(RunState::Failed, stats);
        error
    }

    fn finish(&mut self, summary: ExecutionSummary) {
        self.transition(RunState::Finalizing);
        let stats = summary.stats;
        let state = if summary.stopped {
            RunState::Stopped
        } else {
            RunState::Completed
        };

        self.record.destination_path = summary.destination;
        self.transition(state);
        self.record.finish(state, stats);

        let message = format!(
            "{} files copied, {} skipped, {} failed",
            stats.files_copied, stats.files_skipped, stats.files_failed
        );
        match state {
            RunState::Completed if stats.files_failed == 0 => {
                self.reporter.success(format!("Backup completed: {}", message))
            }
            RunState::Completed => self
                .reporter
                .warning(format!("Backup completed with errors: {}", message)),
            _ => self
                .reporter
                .warning(format!("Backup stopped: {}", message)),
        }
    }
}

/// Create a new backup job.
///
/// Validates the configuration; no filesystem or network access happens yet.
///
/// # Errors
/// Returns `InvalidConfig` when the configuration cannot describe a run
pub fn create_job(config: RunConfig, sink: Arc<dyn ProgressSink>, stop: StopFlag) -> Result<BackupJob> {
    let reporter = Reporter::new(sink);
    if let Err(e) = config.validate() {
        reporter.error(format!("Backup failed: {}", e));
        return Err(e);
    }

    let mut record = BackupRunRecord::begin(String::new(), config.flags);
    record.name = format!("backup_{}", record.started_at.format("%Y%m%d_%H%M%S"));

    Ok(BackupJob {
        config,
        state: RunState::Idle,
        manifest: Manifest::default(),
        record,
        reporter,
        stop,
    })
}

/// Plan a job by collecting its sources.
///
/// Leaves the job in `Collecting`, or `Stopped` if the stop flag was raised
/// during collection.
pub fn plan_job(job: &mut BackupJob) -> Result<()> {
    job.require(RunState::Idle)?;
    job.transition(RunState::Collecting);

    let manifest = FileCollector::new(job.config.flags.skip_hidden, &job.reporter, &job.stop)
        .collect(&job.config.source_dirs, &job.config.source_files);
    job.reporter.info(format!(
        "Found {} files ({})",
        manifest.items.len(),
        format_bytes(manifest.total_bytes)
    ));
    job.manifest = manifest;

    if job.manifest.stopped {
        let stats = RunStats::new(job.manifest.items.len(), job.manifest.total_bytes);
        job.transition(RunState::Stopped);
        job.record.finish(RunState::Stopped, stats);
        job.reporter.warning("Backup stopped during collection");
    }
    Ok(())
}

/// Run a planned job against its configured destination.
///
/// Remote destinations open an SFTP session for the duration of the run.
///
/// # Errors
/// Returns the setup fault that moved the job to `Failed`. Per-file
/// failures are counted in the record instead.
pub fn run_job(job: &mut BackupJob) -> Result<()> {
    job.require(RunState::Collecting)?;
    if finish_if_empty(job) {
        return Ok(());
    }

    let target = match job.config.destination.clone() {
        Destination::Local { path } => path,
        Destination::Remote(target) => {
            let transport = match SftpTransport::connect(&target) {
                Ok(transport) => transport,
                Err(e) => return Err(job.fail(e)),
            };
            return run_job_with_transport(job, &transport);
        }
    };

    report_capacity(&job.reporter, &target, job.manifest.total_bytes);

    let store = BackupMetadataStore::new(&target);
    let previous = store.load_last();
    job.transition(if job.config.flags.compress {
        RunState::Archiving
    } else {
        RunState::Copying
    });

    let result = LocalBackupExecutor::new(&job.config, &target, &job.reporter, &job.stop).run(
        &job.manifest.items,
        job.manifest.total_bytes,
        previous.as_ref(),
    );
    let summary = match result {
        Ok(summary) => summary,
        Err(e) => return Err(job.fail(e)),
    };

    if let Some(name) = Path::new(&summary.destination).file_name() {
        job.record.name = name.to_string_lossy().into_owned();
    }
    job.finish(summary);

    if let Err(e) = store.save(&job.record) {
        return Err(job.fail(e));
    }
    Ok(())
}

/// Run a planned remote job over an already established transport.
pub fn run_job_with_transport(job: &mut BackupJob, transport: &dyn RemoteTransport) -> Result<()> {
    job.require(RunState::Collecting)?;
    if finish_if_empty(job) {
        return Ok(());
    }

    let target = match &job.config.destination {
        Destination::Remote(target) => target.clone(),
        Destination::Local { .. } => {
            let e = EngineError::InvalidConfig("job has a local destination".to_string());
            return Err(job.fail(e));
        }
    };

    job.transition(RunState::Uploading);
    let scheduler =
        RemoteUploadScheduler::new(&target, job.config.flags, job.reporter.clone(), job.stop.clone());
    match scheduler.run(&job.manifest.items, job.manifest.total_bytes, transport) {
        Ok(summary) => {
            job.finish(summary);
            Ok(())
        }
        Err(e) => Err(job.fail(e)),
    }
}

/// Create, plan and run a job in one call, returning its final record.
pub fn run_backup(config: RunConfig, sink: Arc<dyn ProgressSink>, stop: StopFlag) -> Result<BackupRunRecord> {
    let mut job = create_job(config, sink, stop)?;
    plan_job(&mut job)?;
    if !job.state.is_terminal() {
        run_job(&mut job)?;
    }
    Ok(job.record)
}

/// An empty manifest completes at once with zero stats.
fn finish_if_empty(job: &mut BackupJob) -> bool {
    if !job.manifest.items.is_empty() {
        return false;
    }
    job.reporter.warning("No files found to back up");
    job.transition(RunState::Completed);
    job.record.finish(RunState::Completed, RunStats::default());
    true
}

fn report_capacity(reporter: &Reporter, target: &Path, needed: u64) {
    let disk = match disk_stats_for(target) {
        Some(disk) => disk,
        None => {
            debug!(path = %target.display(), "no disk information for target");
            return;
        }
    };

    reporter.info(format!(
        "Destination {}: {} free of {} ({:.1}% used)",
        disk.mount_point.display(),
        format_bytes(disk.free),
        format_bytes(disk.total),
        disk.percentage_used()
    ));
    if needed > disk.free {
        reporter.warning(format!(
            "Backup needs {} but only {} is free on {}",
            format_bytes(needed),
            format_bytes(disk.free),
            disk.mount_point.display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RemoteAuth, RemoteTarget, Secret};
    use crate::progress::testing::{RecordingSink, StopAfter};
    use crate::progress::{NullSink, Severity};
    use crate::remote::memory::MemoryTransport;
    use std::fs;
    use std::path::PathBuf;

    fn write_sized(path: &Path, len: usize) {
        fs::create_dir_all(path.parent().unwrap()).expect("Failed to create parent");
        fs::write(path, vec![b'x'; len]).expect("Failed to write file");
    }

    fn null_sink() -> Arc<dyn ProgressSink> {
        Arc::new(NullSink)
    }

    #[test]
    fn test_plan_excludes_hidden_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_sized(&src.join(".secret"), 10);
        write_sized(&src.join("b.txt"), 20);
        write_sized(&src.join("c.txt"), 30);

        let config = RunConfig::local(vec![src], vec![], temp_dir.path().join("dst"));
        let mut job = create_job(config, null_sink(), StopFlag::new()).expect("Failed to create job");
        plan_job(&mut job).expect("Failed to plan job");

        assert_eq!(job.state, RunState::Collecting);
        assert_eq!(job.manifest.items.len(), 2);
        assert_eq!(job.manifest.total_bytes, 50);
    }

    #[test]
    fn test_create_job_rejects_invalid_config() {
        let sink = Arc::new(RecordingSink::default());
        let config = RunConfig::local(vec![], vec![], "/tmp/never-used");

        let result = create_job(config, sink.clone(), StopFlag::new());
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
        assert_eq!(sink.messages(Severity::Error).len(), 1);
    }

    #[test]
    fn test_run_requires_planned_job() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = RunConfig::local(vec![temp_dir.path().to_path_buf()], vec![], temp_dir.path().join("dst"));
        let mut job = create_job(config, null_sink(), StopFlag::new()).expect("Failed to create job");

        let result = run_job(&mut job);
        assert!(matches!(
            result,
            Err(EngineError::InvalidState {
                expected: RunState::Collecting,
                actual: RunState::Idle
            })
        ));

        plan_job(&mut job).expect("Failed to plan job");
        assert!(matches!(plan_job(&mut job), Err(EngineError::InvalidState { .. })));
    }

    #[test]
    fn test_completed_run_balances_and_persists_record() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_sized(&src.join("a.txt"), 5);
        write_sized(&src.join("deep/b.txt"), 7);
        let loose = temp_dir.path().join("notes.txt");
        write_sized(&loose, 3);
        let dst = temp_dir.path().join("dst");

        let config = RunConfig::local(vec![src], vec![loose], &dst);
        let record = run_backup(config, null_sink(), StopFlag::new()).expect("run");

        assert_eq!(record.state, RunState::Completed);
        assert_eq!(record.stats.total_files, 3);
        assert_eq!(record.stats.total_size_bytes, 15);
        assert!(record.stats.is_balanced());
        assert!(record.finished_at.is_some());

        let saved = BackupMetadataStore::new(&dst).load_last().expect("persisted");
        assert_eq!(saved.id, record.id);
        assert!(PathBuf::from(&saved.destination_path).join("notes.txt").is_file());
        assert!(saved.name.starts_with("backup_"));
    }

    #[test]
    fn test_unchanged_tree_second_run_copies_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        for i in 0..4 {
            write_sized(&src.join(format!("dir{}/file{}.dat", i % 2, i)), 16 + i);
        }
        let config = RunConfig::local(vec![src], vec![], temp_dir.path().join("dst"));

        let first = run_backup(config.clone(), null_sink(), StopFlag::new()).expect("first run");
        let second = run_backup(config, null_sink(), StopFlag::new()).expect("second run");

        assert_eq!(first.stats.files_copied, 4);
        assert_eq!(second.stats.files_copied, 0);
        assert_eq!(second.stats.files_skipped, second.stats.total_files);
        assert_eq!(second.destination_path, first.destination_path);
    }

    #[test]
    fn test_cancelled_run_is_stopped_not_failed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        for i in 0..10 {
            write_sized(&src.join(format!("f{:02}.txt", i)), 4);
        }
        let dst = temp_dir.path().join("dst");
        let config = RunConfig::local(vec![src], vec![], &dst);

        let stop = StopFlag::new();
        let sink = Arc::new(StopAfter {
            after: 2,
            stop: stop.clone(),
        });
        let record = run_backup(config, sink, stop).expect("stopped runs are not errors");

        assert_eq!(record.state, RunState::Stopped);
        assert!(record.stats.files_copied + record.stats.files_skipped <= 2);

        let backup_dir = PathBuf::from(&record.destination_path);
        let copied = fs::read_dir(backup_dir.join(crate::fs_ops::sanitize_root(&temp_dir.path().join("src"))))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert!(copied <= 2);

        let saved = BackupMetadataStore::new(&dst).load_last().expect("persisted");
        assert_eq!(saved.state, RunState::Stopped);
    }

    #[test]
    fn test_stop_before_collection() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write_sized(&temp_dir.path().join("src/a.txt"), 1);
        let config = RunConfig::local(vec![temp_dir.path().join("src")], vec![], temp_dir.path().join("dst"));
        let stop = StopFlag::new();
        stop.stop();

        let record = run_backup(config, null_sink(), stop).expect("run");
        assert_eq!(record.state, RunState::Stopped);
        assert!(!temp_dir.path().join("dst").exists());
    }

    #[test]
    fn test_empty_manifest_completes_with_warning() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("empty");
        fs::create_dir_all(&src).unwrap();
        let sink = Arc::new(RecordingSink::default());

        let config = RunConfig::local(vec![src], vec![], temp_dir.path().join("dst"));
        let record = run_backup(config, sink.clone(), StopFlag::new()).expect("run");

        assert_eq!(record.state, RunState::Completed);
        assert_eq!(record.stats, RunStats::default());
        assert!(sink
            .messages(Severity::Warning)
            .iter()
            .any(|m| m.contains("No files")));
    }

    #[test]
    fn test_setup_fault_fails_job() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write_sized(&temp_dir.path().join("src/a.txt"), 1);
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"file").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let config = RunConfig::local(vec![temp_dir.path().join("src")], vec![], blocker.join("dst"));
        let mut job = create_job(config, sink.clone(), StopFlag::new()).expect("Failed to create job");
        plan_job(&mut job).expect("Failed to plan job");

        let err = run_job(&mut job).expect_err("must fail");
        assert!(err.is_setup_fault());
        assert_eq!(job.state, RunState::Failed);
        assert_eq!(job.record.state, RunState::Failed);
        assert_eq!(sink.messages(Severity::Error).len(), 1);
    }

    #[test]
    fn test_remote_job_over_transport() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("photos");
        for i in 0..5 {
            write_sized(&src.join(format!("img{}.jpg", i)), 8);
        }
        let target = RemoteTarget::new(
            "nas.local",
            "backup",
            RemoteAuth::Password {
                password: Secret::new("pw"),
            },
            "/srv/backups",
        );
        let config = RunConfig::remote(vec![src], vec![], target);
        let transport = MemoryTransport::new();
        transport.fail_uploads_named("img3.jpg");

        let mut job = create_job(config, null_sink(), StopFlag::new()).expect("Failed to create job");
        plan_job(&mut job).expect("Failed to plan job");
        run_job_with_transport(&mut job, &transport).expect("run");

        assert_eq!(job.state, RunState::Completed);
        assert_eq!(job.record.stats.files_copied, 4);
        assert_eq!(job.record.stats.files_failed, 1);
        assert_eq!(job.record.stats.files_skipped, 0);
        assert_eq!(job.record.destination_path, "memory:/srv/backups");
        assert!(transport.file("/srv/backups/photos/img0.jpg").is_some());
    }

    #[test]
    fn test_transport_run_rejects_local_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write_sized(&temp_dir.path().join("src/a.txt"), 1);
        let config = RunConfig::local(vec![temp_dir.path().join("src")], vec![], temp_dir.path().join("dst"));
        let mut job = create_job(config, null_sink(), StopFlag::new()).expect("Failed to create job");
        plan_job(&mut job).expect("Failed to plan job");

        let result = run_job_with_transport(&mut job, &MemoryTransport::new());
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
        assert_eq!(job.state, RunState::Failed);
    }
}
