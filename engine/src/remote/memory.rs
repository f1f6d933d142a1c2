//! In-memory remote used by the scheduler and policy tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::{parent_remote, RemoteChannel, RemoteStat, RemoteTransport};

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    mtime: u64,
}

#[derive(Debug)]
struct State {
    files: HashMap<String, MemoryFile>,
    dirs: HashSet<String>,
    failing_names: HashSet<String>,
    max_channels: Option<usize>,
    upload_delay: Duration,
    channels_opened: usize,
    mkdir_calls: usize,
    uploads: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", path))
}

impl MemoryTransport {
    pub(crate) fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert("/".to_string());
        MemoryTransport {
            state: Arc::new(Mutex::new(State {
                files: HashMap::new(),
                dirs,
                failing_names: HashSet::new(),
                max_channels: None,
                upload_delay: Duration::ZERO,
                channels_opened: 0,
                mkdir_calls: 0,
                uploads: 0,
            })),
        }
    }

    /// Uploads of files with this basename fail.
    pub(crate) fn fail_uploads_named(&self, name: &str) {
        self.state.lock().failing_names.insert(name.to_string());
    }

    pub(crate) fn limit_channels(&self, max: usize) {
        self.state.lock().max_channels = Some(max);
    }

    pub(crate) fn slow_uploads(&self, delay: Duration) {
        self.state.lock().upload_delay = delay;
    }

    pub(crate) fn add_dir(&self, path: &str) {
        self.state.lock().dirs.insert(path.to_string());
    }

    pub(crate) fn has_dir(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(path)
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).map(|f| f.data.clone())
    }

    pub(crate) fn put_file(&self, path: &str, data: &[u8], mtime: u64) {
        self.state.lock().files.insert(
            path.to_string(),
            MemoryFile {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    pub(crate) fn set_mtime(&self, path: &str, mtime: u64) {
        if let Some(file) = self.state.lock().files.get_mut(path) {
            file.mtime = mtime;
        }
    }

    pub(crate) fn mkdir_calls(&self) -> usize {
        self.state.lock().mkdir_calls
    }

    pub(crate) fn uploads(&self) -> usize {
        self.state.lock().uploads
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.state.lock().channels_opened
    }
}

impl RemoteTransport for MemoryTransport {
    fn open_channel(&self) -> io::Result<Box<dyn RemoteChannel>> {
        let mut state = self.state.lock();
        if let Some(max) = state.max_channels {
            if state.channels_opened >= max {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "channel limit reached",
                ));
            }
        }
        state.channels_opened += 1;
        Ok(Box::new(MemoryChannel {
            state: Arc::clone(&self.state),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryChannel {
    state: Arc<Mutex<State>>,
}

impl MemoryChannel {
    fn store(&self, path: &str, data: Vec<u8>) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.dirs.contains(parent_remote(path)) {
            return Err(not_found(parent_remote(path)));
        }
        state.files.insert(
            path.to_string(),
            MemoryFile {
                data,
                mtime: now_secs(),
            },
        );
        Ok(())
    }
}

impl RemoteChannel for MemoryChannel {
    fn stat(&self, path: &str) -> io::Result<RemoteStat> {
        let state = self.state.lock();
        if let Some(file) = state.files.get(path) {
            return Ok(RemoteStat {
                size: Some(file.data.len() as u64),
                mtime: Some(file.mtime),
            });
        }
        if state.dirs.contains(path) {
            return Ok(RemoteStat::default());
        }
        Err(not_found(path))
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        state.mkdir_calls += 1;
        if state.dirs.contains(path) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        if !state.dirs.contains(parent_remote(path)) {
            return Err(not_found(parent_remote(path)));
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }

    fn upload(&self, local: &Path, remote: &str) -> io::Result<u64> {
        let (delay, failing) = {
            let state = self.state.lock();
            let name = remote.rsplit('/').next().unwrap_or(remote);
            (state.upload_delay, state.failing_names.contains(name))
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if failing {
            return Err(io::Error::new(io::ErrorKind::Other, "injected upload failure"));
        }

        let data = std::fs::read(local)?;
        let len = data.len() as u64;
        self.store(remote, data)?;
        self.state.lock().uploads += 1;
        Ok(len)
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        let state = self.state.lock();
        let file = state.files.get(path).ok_or_else(|| not_found(path))?;
        String::from_utf8(file.data.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn write(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        self.store(path, contents.to_vec())
    }
}
