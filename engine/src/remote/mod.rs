//! Remote destinations.
//!
//! A `RemoteTransport` is one authenticated connection. Workers never share
//! a channel: each opens its own `RemoteChannel`, multiplexed over the
//! transport, so concurrent uploads do not interleave on one file handle.

mod scheduler;
mod sftp;

#[cfg(test)]
pub(crate) mod memory;

use std::collections::HashSet;
use std::io;
use std::path::Path;

use parking_lot::Mutex;
use tracing::debug;

use crate::model::{RemoteQueueItem, SourceItem};

pub use scheduler::RemoteUploadScheduler;
pub use sftp::SftpTransport;

/// Size and modification time (unix seconds) of a remote file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: Option<u64>,
    pub mtime: Option<u64>,
}

/// One authenticated session able to open independent channels.
pub trait RemoteTransport {
    fn open_channel(&self) -> io::Result<Box<dyn RemoteChannel>>;

    /// Human-readable name of the peer, for logs
    fn describe(&self) -> String;
}

/// File operations over a single channel. Owned by exactly one worker.
pub trait RemoteChannel: Send {
    fn stat(&self, path: &str) -> io::Result<RemoteStat>;

    fn mkdir(&self, path: &str) -> io::Result<()>;

    /// Stream a local file to `remote`, replacing it. Returns bytes sent.
    fn upload(&self, local: &Path, remote: &str) -> io::Result<u64>;

    fn read_to_string(&self, path: &str) -> io::Result<String>;

    fn write(&self, path: &str, contents: &[u8]) -> io::Result<()>;
}

/// Normalize to an absolute posix path.
///
/// Backslashes become `/`, `.` and empty segments vanish, `..` pops a segment
/// (never above `/`).
pub fn normalize_remote(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Join a normalized root and a relative posix path.
pub fn join_remote(root: &str, relative: &str) -> String {
    normalize_remote(&format!("{}/{}", root, relative))
}

/// Parent directory of a normalized remote path (`/` for top-level entries).
pub fn parent_remote(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Sidecar holding the content digest of `remote_path`.
pub fn sidecar_path(remote_path: &str) -> String {
    format!("{}.hash", remote_path)
}

/// Remote relative path of `item` below the target root.
///
/// Directory items are namespaced by the basename of their source root when
/// `preserve_structure` is set; everything else lands flat.
pub fn remote_relative_path(item: &SourceItem, preserve_structure: bool) -> String {
    let name = item.basename().to_string_lossy().into_owned();
    match item.origin_root() {
        Some(root) if preserve_structure => {
            let namespace = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "folder".to_string());
            let relative = item
                .relative_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            format!("{}/{}", namespace, relative)
        }
        _ => name,
    }
}

/// Build the upload queue in manifest order.
pub fn queue_items(items: &[SourceItem], preserve_structure: bool) -> Vec<RemoteQueueItem> {
    items
        .iter()
        .map(|item| RemoteQueueItem {
            local_path: item.absolute_path.clone(),
            remote_relative: remote_relative_path(item, preserve_structure),
        })
        .collect()
}

/// Directories known to exist on the remote side, shared by all workers.
#[derive(Debug, Default)]
pub struct EnsuredDirs(Mutex<HashSet<String>>);

impl EnsuredDirs {
    fn contains(&self, dir: &str) -> bool {
        self.0.lock().contains(dir)
    }

    fn insert(&self, dir: String) {
        self.0.lock().insert(dir);
    }
}

/// Create every missing directory of `dir`, top-down.
///
/// Stat first; if that fails, try mkdir and ignore its error (another worker
/// may have won the race, or the directory already exists).
pub fn ensure_remote_dir(channel: &dyn RemoteChannel, dir: &str, known: &EnsuredDirs) {
    let dir = normalize_remote(dir);
    if dir == "/" || known.contains(&dir) {
        return;
    }

    let mut current = String::new();
    for part in dir.trim_start_matches('/').split('/') {
        current.push('/');
        current.push_str(part);
        if known.contains(&current) {
            continue;
        }
        if channel.stat(&current).is_err() {
            if let Err(e) = channel.mkdir(&current) {
                debug!(dir = %current, error = %e, "remote mkdir failed");
            }
        }
        known.insert(current.clone());
    }
}
