//! Serial backup to a local target directory.
//!
//! Each run writes into `<target>/backup_<YYYYMMDD_HHMMSS>/` (or reuses the
//! previous tree backup for incremental runs) and leaves behind:
//! - `backup_metadata.json` describing the run
//! - `backup_log.txt`, appended to by every run using the directory
//! - the copied tree, or a single `backup.zip`

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{EngineError, Result};
use crate::fs_ops::{archive_entry_name, copy_file_with_metadata, local_target_path};
use crate::metadata::{RunMetadata, RUN_METADATA_FILE};
use crate::model::{BackupRunRecord, ExecutionSummary, RunConfig, RunFlags, RunStats, SourceItem};
use crate::policy::IncrementalPolicy;
use crate::progress::{Reporter, StopFlag};

pub const ARCHIVE_NAME: &str = "backup.zip";
pub const RUN_LOG_FILE: &str = "backup_log.txt";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Pick the directory a run writes into.
///
/// Incremental tree runs reuse the previous backup directory when it still
/// exists under `target`, so the mtime check has something to compare with.
/// Otherwise a fresh timestamped name is chosen, suffixed `_N` on collision.
pub fn resolve_backup_dir(
    target: &Path,
    flags: &RunFlags,
    previous: Option<&BackupRunRecord>,
    now: DateTime<Local>,
) -> PathBuf {
    if flags.incremental && !flags.compress {
        if let Some(previous) = previous {
            let dir = PathBuf::from(&previous.destination_path);
            if !previous.settings.compress && dir.parent() == Some(target) && dir.is_dir() {
                return dir;
            }
        }
    }

    let base = format!("backup_{}", now.format("%Y%m%d_%H%M%S"));
    let mut candidate = target.join(&base);
    let mut suffix = 1;
    while candidate.exists() {
        candidate = target.join(format!("{}_{}", base, suffix));
        suffix += 1;
    }
    candidate
}

/// Append-only text log of one backup directory.
struct RunLog {
    path: PathBuf,
    out: BufWriter<File>,
}

impl RunLog {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| EngineError::ArtifactSetup {
                path: path.clone(),
                source,
            })?;
        Ok(RunLog {
            path,
            out: BufWriter::new(file),
        })
    }

    fn header(&mut self, total_files: usize) -> Result<()> {
        self.write_header(total_files)
            .map_err(|source| EngineError::ArtifactSetup {
                path: self.path.clone(),
                source,
            })
    }

    fn write_header(&mut self, total_files: usize) -> io::Result<()> {
        writeln!(self.out, "Backup started: {}", Local::now().to_rfc3339())?;
        writeln!(self.out, "Total files: {}", total_files)?;
        writeln!(self.out, "{}", "-".repeat(60))?;
        self.out.flush()
    }

    fn line(&mut self, line: std::fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.out, "{}", line) {
            warn!(path = %self.path.display(), error = %e, "run log write failed");
        }
    }

    fn footer(&mut self, stats: &RunStats, stopped: bool) -> io::Result<()> {
        writeln!(self.out, "{}", "-".repeat(60))?;
        writeln!(self.out, "Backup finished: {}", Local::now().to_rfc3339())?;
        writeln!(self.out, "Copied: {}", stats.files_copied)?;
        writeln!(self.out, "Skipped: {}", stats.files_skipped)?;
        writeln!(self.out, "Failed: {}", stats.files_failed)?;
        writeln!(
            self.out,
            "Status: {}",
            if stopped { "Stopped" } else { "Completed" }
        )?;
        writeln!(self.out)?;
        self.out.flush()
    }
}

pub struct LocalBackupExecutor<'a> {
    config: &'a RunConfig,
    target: &'a Path,
    reporter: &'a Reporter,
    stop: &'a StopFlag,
}

impl<'a> LocalBackupExecutor<'a> {
    pub fn new(config: &'a RunConfig, target: &'a Path, reporter: &'a Reporter, stop: &'a StopFlag) -> Self {
        LocalBackupExecutor {
            config,
            target,
            reporter,
            stop,
        }
    }

    /// Copy or archive `items` into a backup directory below the target.
    ///
    /// Returns `Err` only for setup faults; per-item failures are counted.
    pub fn run(
        &self,
        items: &[SourceItem],
        total_bytes: u64,
        previous: Option<&BackupRunRecord>,
    ) -> Result<ExecutionSummary> {
        let flags = &self.config.flags;
        fs::create_dir_all(self.target).map_err(|source| EngineError::DestinationSetup {
            path: self.target.to_path_buf(),
            source,
        })?;

        let backup_dir = resolve_backup_dir(self.target, flags, previous, Local::now());
        let reused = backup_dir.is_dir();
        fs::create_dir_all(&backup_dir).map_err(|source| EngineError::DestinationSetup {
            path: backup_dir.clone(),
            source,
        })?;
        if reused {
            self.reporter
                .info(format!("Updating existing backup {}", backup_dir.display()));
        } else {
            self.reporter
                .info(format!("Creating backup {}", backup_dir.display()));
        }

        let backup_name = backup_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archive_name = flags.compress.then(|| ARCHIVE_NAME.to_string());
        let metadata = RunMetadata::new(backup_name, self.config, archive_name);
        metadata.write_to(&backup_dir)?;

        let mut log = RunLog::open(backup_dir.join(RUN_LOG_FILE))?;
        log.header(items.len())?;

        let mut stats = RunStats::new(items.len(), total_bytes);
        let stopped = if flags.compress {
            self.archive(items, &backup_dir, &metadata, &mut log, &mut stats)?
        } else {
            self.copy_tree(items, &backup_dir, &mut log, &mut stats)
        };

        if let Err(e) = log.footer(&stats, stopped) {
            self.reporter
                .warning(format!("Could not finish run log {}: {}", log.path.display(), e));
        }

        Ok(ExecutionSummary {
            stats,
            stopped,
            destination: backup_dir.display().to_string(),
        })
    }

    /// Returns true when the stop flag cut the run short.
    fn copy_tree(&self, items: &[SourceItem], backup_dir: &Path, log: &mut RunLog, stats: &mut RunStats) -> bool {
        let policy = IncrementalPolicy::from_flags(&self.config.flags);
        let total = items.len();

        for item in items {
            if self.stop.is_stopped() {
                return true;
            }

            let src = &item.absolute_path;
            let dst = local_target_path(backup_dir, item, self.config.flags.preserve_structure);

            if policy.skip_local(src, &dst) {
                stats.files_skipped += 1;
                log.line(format_args!("SKIPPED: {}", src.display()));
                self.reporter.progress(stats.processed(), total, src, 0);
                continue;
            }

            match copy_file_with_metadata(src, &dst) {
                Ok(bytes) => {
                    stats.files_copied += 1;
                    log.line(format_args!("COPIED: {} -> {}", src.display(), dst.display()));
                    self.reporter.progress(stats.processed(), total, src, bytes);
                }
                Err(e) => {
                    stats.files_failed += 1;
                    self.reporter
                        .warning(format!("Failed to copy {}: {}", src.display(), e));
                    log.line(format_args!("FAILED: {}: {}", src.display(), e));
                    self.reporter.progress(stats.processed(), total, src, 0);
                }
            }
        }
        false
    }

    fn archive(
        &self,
        items: &[SourceItem],
        backup_dir: &Path,
        metadata: &RunMetadata,
        log: &mut RunLog,
        stats: &mut RunStats,
    ) -> Result<bool> {
        let path = backup_dir.join(ARCHIVE_NAME);
        let archive_error = |source: zip::result::ZipError| EngineError::Archive {
            path: path.clone(),
            source,
        };

        let file = File::create(&path).map_err(|source| EngineError::ArtifactSetup {
            path: path.clone(),
            source,
        })?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file(RUN_METADATA_FILE, options)
            .map_err(archive_error)?;
        zip.write_all(&metadata.to_json())
            .map_err(|e| archive_error(e.into()))?;

        let total = items.len();
        let mut stopped = false;
        for item in items {
            if self.stop.is_stopped() {
                stopped = true;
                break;
            }

            let src = &item.absolute_path;
            let entry = archive_entry_name(item, self.config.flags.preserve_structure);
            match add_entry(&mut zip, &path, src, &entry, options) {
                Ok(bytes) => {
                    stats.files_copied += 1;
                    log.line(format_args!("ARCHIVED: {} -> {}", src.display(), entry));
                    self.reporter.progress(stats.processed(), total, src, bytes);
                }
                Err(e) => {
                    stats.files_failed += 1;
                    self.reporter
                        .warning(format!("Failed to archive {}: {}", src.display(), e));
                    log.line(format_args!("FAILED: {}: {}", src.display(), e));
                    self.reporter.progress(stats.processed(), total, src, 0);
                }
            }
        }

        let mut writer = zip.finish().map_err(archive_error)?;
        writer.flush().map_err(|e| archive_error(e.into()))?;
        debug!(path = %path.display(), entries = stats.files_copied, "archive finished");
        Ok(stopped)
    }
}

fn zip_time(modified: std::time::SystemTime) -> zip::DateTime {
    let local: DateTime<Local> = modified.into();
    zip::DateTime::from_date_and_time(
        local.year().clamp(1980, 2107) as u16,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .unwrap_or_default()
}

/// Stream one source file into the archive. The source is opened before the
/// entry is started so a vanished file leaves no empty entry behind; a read or
/// write fault after that point leaves a truncated entry in the archive.
fn add_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    archive: &Path,
    src: &Path,
    entry: &str,
    options: FileOptions,
) -> Result<u64> {
    let read_error = |source| EngineError::Read {
        path: src.to_path_buf(),
        source,
    };
    let write_error = |source| EngineError::Write {
        path: archive.join(entry),
        source,
    };

    let mut file = File::open(src).map_err(read_error)?;
    let meta = file.metadata().map_err(read_error)?;

    let mut options = options.large_file(meta.len() > u32::MAX as u64);
    if let Ok(modified) = meta.modified() {
        options = options.last_modified_time(zip_time(modified));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(meta.permissions().mode() & 0o7777);
    }

    zip.start_file(entry, options)
        .map_err(|e| write_error(io::Error::new(io::ErrorKind::Other, e)))?;

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        };
        zip.write_all(&buffer[..n]).map_err(write_error)?;
        written += n as u64;
    }
    Ok(written)
}
