//! Parallel upload of a manifest to a remote target.
//!
//! One FIFO queue, N workers, one channel per worker. Counters live behind a
//! single mutex shared by every worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    ensure_remote_dir, join_remote, normalize_remote, parent_remote, queue_items, sidecar_path,
    EnsuredDirs, RemoteChannel, RemoteTransport,
};
use crate::checksums::{compute_file_checksum, ChecksumAlgorithm};
use crate::error::{EngineError, Result};
use crate::model::{ExecutionSummary, RemoteQueueItem, RemoteTarget, RunFlags, RunStats, SourceItem};
use crate::policy::IncrementalPolicy;
use crate::progress::{Reporter, StopFlag};

/// How often the coordinator re-checks the drain condition.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RemoteUploadScheduler {
    root: String,
    drain_grace: Duration,
    flags: RunFlags,
    reporter: Reporter,
    stop: StopFlag,
}

/// State shared by every worker of one run.
struct WorkerContext {
    root: String,
    policy: IncrementalPolicy,
    use_hash_check: bool,
    algorithm: ChecksumAlgorithm,
    total: usize,
    queue: Receiver<RemoteQueueItem>,
    stats: Mutex<RunStats>,
    dirs: EnsuredDirs,
    reporter: Reporter,
    stop: StopFlag,
}

/// Tells the coordinator a worker is gone, even if it panicked.
struct ExitSignal {
    id: usize,
    done: Sender<usize>,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.done.send(self.id);
    }
}

impl RemoteUploadScheduler {
    pub fn new(target: &RemoteTarget, flags: RunFlags, reporter: Reporter, stop: StopFlag) -> Self {
        RemoteUploadScheduler {
            root: normalize_remote(&target.remote_path),
            drain_grace: target.drain_grace(),
            flags,
            reporter,
            stop,
        }
    }

    /// Upload `items` through `transport` and wait (bounded) for the workers.
    ///
    /// Fails only when no channel or no worker thread can be started.
    pub fn run(
        &self,
        items: &[SourceItem],
        total_bytes: u64,
        transport: &dyn RemoteTransport,
    ) -> Result<ExecutionSummary> {
        let destination = format!("{}:{}", transport.describe(), self.root);
        let stats = RunStats::new(items.len(), total_bytes);
        if items.is_empty() {
            return Ok(ExecutionSummary {
                stats,
                stopped: self.stop.is_stopped(),
                destination,
            });
        }

        let channels = self.open_channels(transport, items.len())?;

        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        for item in queue_items(items, self.flags.preserve_structure) {
            let _ = queue_tx.send(item);
        }
        drop(queue_tx);

        let ctx = Arc::new(WorkerContext {
            root: self.root.clone(),
            policy: IncrementalPolicy::from_flags(&self.flags),
            use_hash_check: self.flags.use_hash_check,
            algorithm: self.flags.hash_algorithm,
            total: items.len(),
            queue: queue_rx,
            stats: Mutex::new(stats),
            dirs: EnsuredDirs::default(),
            reporter: self.reporter.clone(),
            stop: self.stop.clone(),
        });

        if let Some(first) = channels.first() {
            ensure_remote_dir(first.as_ref(), &ctx.root, &ctx.dirs);
        }

        self.reporter.info(format!(
            "Uploading {} files to {} with {} workers",
            items.len(),
            destination,
            channels.len()
        ));

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let mut running: HashMap<usize, JoinHandle<()>> = HashMap::new();
        for (id, channel) in channels.into_iter().enumerate() {
            let worker_ctx = Arc::clone(&ctx);
            let signal = ExitSignal {
                id,
                done: done_tx.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("upload-{}", id))
                .spawn(move || {
                    let _signal = signal;
                    worker_loop(&worker_ctx, channel);
                });
            match spawned {
                Ok(handle) => {
                    running.insert(id, handle);
                }
                Err(e) if running.is_empty() => return Err(EngineError::WorkerSpawn(e)),
                Err(e) => {
                    self.reporter
                        .warning(format!("Could not start upload worker {}: {}", id, e));
                    break;
                }
            }
        }
        drop(done_tx);

        self.wait_for_workers(&ctx, running, &done_rx);

        let stats = *ctx.stats.lock();
        let stopped = self.stop.is_stopped() && !stats.is_balanced();
        let summary = format!(
            "Upload finished: {} uploaded, {} skipped, {} failed",
            stats.files_copied, stats.files_skipped, stats.files_failed
        );
        if stats.files_failed == 0 && !stopped {
            self.reporter.success(summary);
        } else {
            self.reporter.warning(summary);
        }

        Ok(ExecutionSummary {
            stats,
            stopped,
            destination,
        })
    }

    /// Open up to `max_workers` channels. The first one must succeed.
    fn open_channels(
        &self,
        transport: &dyn RemoteTransport,
        item_count: usize,
    ) -> Result<Vec<Box<dyn RemoteChannel>>> {
        let wanted = self.flags.max_workers.max(1).min(item_count);
        let mut channels = Vec::with_capacity(wanted);

        for id in 0..wanted {
            match transport.open_channel() {
                Ok(channel) => channels.push(channel),
                Err(source) if channels.is_empty() => {
                    return Err(EngineError::RemoteConnect {
                        target: transport.describe(),
                        source,
                    })
                }
                Err(e) => {
                    self.reporter.warning(format!(
                        "Only {} of {} upload channels opened ({})",
                        id, wanted, e
                    ));
                    break;
                }
            }
        }
        Ok(channels)
    }

    /// Wait for exit signals. Once every item is accounted for, or stop is
    /// requested, remaining workers get `drain_grace` before being detached.
    fn wait_for_workers(
        &self,
        ctx: &WorkerContext,
        mut running: HashMap<usize, JoinHandle<()>>,
        done: &Receiver<usize>,
    ) {
        let mut deadline: Option<Instant> = None;

        while !running.is_empty() {
            if deadline.is_none() && (self.stop.is_stopped() || ctx.stats.lock().is_balanced()) {
                deadline = Some(Instant::now() + self.drain_grace);
            }
            let wait = match deadline {
                Some(at) => at.saturating_duration_since(Instant::now()).min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };

            match done.recv_timeout(wait) {
                Ok(id) => {
                    if let Some(handle) = running.remove(&id) {
                        if handle.join().is_err() {
                            self.reporter
                                .error(format!("Upload worker {} terminated abnormally", id));
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.map_or(false, |at| Instant::now() >= at) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !running.is_empty() {
            warn!(workers = running.len(), "detaching upload workers");
            self.reporter.warning(format!(
                "{} upload workers did not finish within {}s and were detached",
                running.len(),
                self.drain_grace.as_secs()
            ));
        }
    }
}

fn worker_loop(ctx: &WorkerContext, channel: Box<dyn RemoteChannel>) {
    loop {
        if ctx.stop.is_stopped() {
            debug!("worker observed stop request");
            break;
        }
        let item = match ctx.queue.try_recv() {
            Ok(item) => item,
            Err(_) => break,
        };
        ctx.process(channel.as_ref(), &item);
    }
}

impl WorkerContext {
    fn process(&self, channel: &dyn RemoteChannel, item: &RemoteQueueItem) {
        let remote = join_remote(&self.root, &item.remote_relative);
        ensure_remote_dir(channel, parent_remote(&remote), &self.dirs);

        if self.policy.skip_remote(channel, &item.local_path, &remote) {
            debug!(path = %item.local_path.display(), remote = %remote, "remote copy is current");
            let processed = self.record(|stats| stats.files_skipped += 1);
            self.reporter.progress(processed, self.total, &item.local_path, 0);
            return;
        }

        match self.upload(channel, item, &remote) {
            Ok(bytes) => {
                let processed = self.record(|stats| stats.files_copied += 1);
                self.reporter
                    .progress(processed, self.total, &item.local_path, bytes);
            }
            Err(e) => {
                self.reporter.error(format!(
                    "Upload failed for {}: {}",
                    item.local_path.display(),
                    e
                ));
                let processed = self.record(|stats| stats.files_failed += 1);
                self.reporter.progress(processed, self.total, &item.local_path, 0);
            }
        }
    }

    fn upload(&self, channel: &dyn RemoteChannel, item: &RemoteQueueItem, remote: &str) -> Result<u64> {
        let bytes = channel
            .upload(&item.local_path, remote)
            .map_err(|source| EngineError::Remote {
                path: remote.to_string(),
                source,
            })?;

        if self.use_hash_check {
            let written = compute_file_checksum(&item.local_path, self.algorithm).and_then(|digest| {
                let sidecar = sidecar_path(remote);
                channel
                    .write(&sidecar, digest.hex().as_bytes())
                    .map_err(|source| EngineError::Remote {
                        path: sidecar.clone(),
                        source,
                    })?;
                debug!(sidecar = %sidecar, algorithm = %digest.algorithm(), "hash sidecar written");
                Ok(())
            });
            if let Err(e) = written {
                self.reporter
                    .warning(format!("Could not write hash sidecar for {}: {}", remote, e));
            }
        }

        Ok(bytes)
    }

    /// Apply `update` and return the new processed count.
    fn record(&self, update: impl FnOnce(&mut RunStats)) -> usize {
        let mut stats = self.stats.lock();
        update(&mut stats);
        stats.processed()
    }
}
