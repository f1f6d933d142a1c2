//! BackUP - Command-line interface for the backup engine.
//!
//! Builds a run configuration from flags and/or a JSON profile, runs it with
//! terminal progress reporting, and stops cleanly on Ctrl-C.
//!
//! Exit codes: 0 completed without failures, 1 completed with failed files
//! or stopped, 2 invalid arguments or a setup failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use backup_engine::disk::format_bytes;
use backup_engine::{
    run_backup, ChecksumAlgorithm, Destination, LogEvent, ProgressEvent, ProgressSink, RemoteAuth,
    RemoteTarget, RunConfig, RunFlags, RunState, Secret, Severity, StopFlag,
};
use clap::Parser;
use parking_lot::Mutex;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// BackUP - Incremental backup to a local folder or an SFTP server
#[derive(Parser, Debug)]
#[command(name = "backup")]
#[command(version = "0.1.0")]
#[command(about = "Incremental backup of files and directories with progress tracking")]
struct Args {
    /// JSON run profile; flags below override its values
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// Source directory (repeatable)
    #[arg(long = "dir", value_name = "PATH")]
    dirs: Vec<PathBuf>,

    /// Loose source file (repeatable)
    #[arg(long = "file", value_name = "PATH")]
    files: Vec<PathBuf>,

    /// Local target directory
    #[arg(long, value_name = "PATH", conflicts_with = "host")]
    dest: Option<PathBuf>,

    /// Remote SFTP host
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Remote user name
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// Remote SSH port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Target directory on the remote host
    #[arg(long, value_name = "PATH")]
    remote_path: Option<String>,

    /// Private key file for remote authentication
    #[arg(long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// Environment variable holding the remote password
    #[arg(long, value_name = "VAR", default_value = "BACKUP_SSH_PASSWORD")]
    password_env: String,

    /// Copy every file even if the target copy is current
    #[arg(long)]
    no_incremental: bool,

    /// Include files and directories whose name starts with '.'
    #[arg(long)]
    include_hidden: bool,

    /// Write a single zip archive (local targets only)
    #[arg(long)]
    compress: bool,

    /// Put every file directly in the target, dropping source structure
    #[arg(long)]
    flat: bool,

    /// Do not write or compare remote hash sidecars
    #[arg(long)]
    no_hash_check: bool,

    /// Parallel upload workers
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Sidecar digest algorithm: md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<String>,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Clean,
    Incomplete,
}

struct ProgressState {
    last_update: Instant,
    bytes_done: u64,
}

/// Terminal sink for progress and log events.
struct CliSink {
    verbose: bool,
    start_time: Instant,
    state: Mutex<ProgressState>,
}

impl CliSink {
    fn new(verbose: bool) -> Self {
        let now = Instant::now();
        CliSink {
            verbose,
            start_time: now,
            state: Mutex::new(ProgressState {
                last_update: now,
                bytes_done: 0,
            }),
        }
    }

    fn bytes_done(&self) -> u64 {
        self.state.lock().bytes_done
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent.min(100))
    }
}

impl ProgressSink for CliSink {
    fn on_progress(&self, event: &ProgressEvent) {
        let mut state = self.state.lock();
        state.bytes_done += event.bytes_delta;

        if self.verbose {
            eprintln!(
                "[{:>4}/{}] {}",
                event.processed,
                event.total,
                event.current.display()
            );
            return;
        }

        // Throttle progress updates to avoid spam (max once per 200ms)
        let finished = event.processed >= event.total;
        if !finished && state.last_update.elapsed().as_millis() < 200 {
            return;
        }
        state.last_update = Instant::now();

        let percent = (event.processed as f64 / event.total.max(1) as f64 * 100.0) as u32;
        eprint!(
            "\rProgress: {} | {}/{} files | {}",
            Self::progress_bar(percent),
            event.processed,
            event.total,
            format_bytes(state.bytes_done)
        );
        if finished {
            eprintln!();
        }
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_log(&self, event: &LogEvent) {
        let prefix = match event.severity {
            Severity::Info if !self.verbose => return,
            Severity::Info => "",
            Severity::Success => "OK: ",
            Severity::Warning => "Warning: ",
            Severity::Error => "Error: ",
        };
        eprintln!("{}{}", prefix, event.message);
    }
}

/// Assemble the run configuration: profile first, then flag overrides.
fn build_config(args: &Args) -> anyhow::Result<RunConfig> {
    let profile = match &args.profile {
        Some(path) => Some(
            RunConfig::from_profile(path)
                .with_context(|| format!("Cannot load profile {}", path.display()))?,
        ),
        None => None,
    };

    let destination = if let Some(dest) = &args.dest {
        Destination::Local { path: dest.clone() }
    } else if let Some(host) = &args.host {
        match profile.as_ref().map(|p| &p.destination) {
            // Keep the profile's port, path, timeouts and auth; only the host changes.
            Some(Destination::Remote(target)) => {
                let mut target = target.clone();
                target.host = host.clone();
                Destination::Remote(target)
            }
            _ => {
                let user = match &args.user {
                    Some(user) => user.clone(),
                    None => bail!("--user is required with --host"),
                };
                let remote_path = args.remote_path.clone().unwrap_or_else(|| "/".to_string());
                let placeholder = RemoteAuth::Password {
                    password: Secret::default(),
                };
                Destination::Remote(RemoteTarget::new(host.clone(), user, placeholder, remote_path))
            }
        }
    } else if let Some(profile) = &profile {
        profile.destination.clone()
    } else {
        bail!("No destination given: use --dest, --host or --profile");
    };

    let mut config = match profile {
        Some(mut profile) => {
            profile.destination = destination;
            profile
        }
        None => RunConfig {
            source_dirs: Vec::new(),
            source_files: Vec::new(),
            destination,
            flags: RunFlags::default(),
        },
    };
    config.source_dirs.extend(args.dirs.iter().cloned());
    config.source_files.extend(args.files.iter().cloned());

    if let Destination::Remote(target) = &mut config.destination {
        if let Some(user) = &args.user {
            target.username = user.clone();
        }
        if let Some(port) = args.port {
            target.port = port;
        }
        if let Some(remote_path) = &args.remote_path {
            target.remote_path = remote_path.clone();
        }
        target.auth = match (&args.key, &target.auth) {
            (Some(path), _) => RemoteAuth::KeyFile {
                path: path.clone(),
                passphrase: None,
            },
            (None, RemoteAuth::KeyFile { path, .. }) => RemoteAuth::KeyFile {
                path: path.clone(),
                passphrase: None,
            },
            (None, RemoteAuth::Password { .. }) => {
                let password = std::env::var(&args.password_env).with_context(|| {
                    format!(
                        "Set {} to the SSH password or pass --key",
                        args.password_env
                    )
                })?;
                RemoteAuth::Password {
                    password: Secret::new(password),
                }
            }
        };
    }

    let flags = &mut config.flags;
    if args.no_incremental {
        flags.incremental = false;
    }
    if args.include_hidden {
        flags.skip_hidden = false;
    }
    if args.compress {
        flags.compress = true;
    }
    if args.flat {
        flags.preserve_structure = false;
    }
    if args.no_hash_check {
        flags.use_hash_check = false;
    }
    if let Some(workers) = args.workers {
        flags.max_workers = workers;
    }
    if let Some(hash) = &args.hash {
        flags.hash_algorithm = hash.parse::<ChecksumAlgorithm>().map_err(anyhow::Error::msg)?;
    }

    Ok(config)
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args, stop: StopFlag) -> anyhow::Result<Outcome> {
    let config = build_config(args)?;
    if let Destination::Remote(_) = config.destination {
        if config.flags.compress {
            eprintln!("Note: --compress applies to local targets only and is ignored");
        }
    }

    let sink = Arc::new(CliSink::new(args.verbose));
    let record = run_backup(config, sink.clone(), stop).context("Backup failed")?;

    let stats = record.stats;
    eprintln!();
    eprintln!("Backup {}", record.state.to_string().to_lowercase());
    eprintln!("  Destination: {}", record.destination_path);
    eprintln!(
        "  Summary: {} copied, {} skipped, {} failed (of {})",
        stats.files_copied, stats.files_skipped, stats.files_failed, stats.total_files
    );
    eprintln!("  Bytes copied: {}", format_bytes(sink.bytes_done()));
    eprintln!("  Elapsed: {}", CliSink::format_duration(sink.start_time.elapsed()));

    if record.state == RunState::Completed && stats.files_failed == 0 {
        Ok(Outcome::Clean)
    } else {
        Ok(Outcome::Incomplete)
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug,backup_events=off"
    } else {
        "warn,backup_events=off"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse arguments, install the Ctrl-C handler, and run the backup
fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let stop = StopFlag::new();
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nStopping after the files in progress...");
        handler_stop.stop();
    }) {
        warn!(error = %e, "cannot install Ctrl-C handler");
    }

    let exit_code = match run_cli(&args, stop) {
        Ok(Outcome::Clean) => 0,
        Ok(Outcome::Incomplete) => 1,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}
