//! Incremental skip decisions.
//!
//! Local targets compare modification times only. A content change that does
//! not advance the source mtime is not detected.
//!
//! Remote targets use two tiers: size plus mtime from a remote stat, then the
//! `<file>.hash` sidecar when hash checking is on. Whenever freshness cannot
//! be confirmed the item is uploaded again.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use filetime::FileTime;
use tracing::debug;

use crate::checksums::{compute_file_checksum, ChecksumAlgorithm};
use crate::model::RunFlags;
use crate::remote::{sidecar_path, RemoteChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalPolicy {
    incremental: bool,
    use_hash_check: bool,
    algorithm: ChecksumAlgorithm,
}

impl IncrementalPolicy {
    pub fn from_flags(flags: &RunFlags) -> Self {
        IncrementalPolicy {
            incremental: flags.incremental,
            use_hash_check: flags.use_hash_check,
            algorithm: flags.hash_algorithm,
        }
    }

    /// Skip iff `destination` exists and is at least as new as `source`.
    pub fn skip_local(&self, source: &Path, destination: &Path) -> bool {
        if !self.incremental {
            return false;
        }

        let (src_meta, dst_meta) = match (fs::metadata(source), fs::metadata(destination)) {
            (Ok(src), Ok(dst)) => (src, dst),
            _ => return false,
        };

        FileTime::from_last_modification_time(&dst_meta)
            >= FileTime::from_last_modification_time(&src_meta)
    }

    /// Skip iff the remote copy is confirmed fresh by stat or by sidecar digest.
    pub fn skip_remote(&self, channel: &dyn RemoteChannel, local: &Path, remote: &str) -> bool {
        if !self.incremental {
            return false;
        }

        let local_meta = match fs::metadata(local) {
            Ok(meta) => meta,
            Err(_) => return false,
        };

        if let Ok(stat) = channel.stat(remote) {
            let local_mtime = local_meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs());
            let same_size = stat.size == Some(local_meta.len());
            let newer = matches!((stat.mtime, local_mtime), (Some(r), Some(l)) if r >= l);
            if same_size && newer {
                return true;
            }
        }

        if !self.use_hash_check {
            return false;
        }

        let sidecar = match channel.read_to_string(&sidecar_path(remote)) {
            Ok(text) => text,
            Err(e) => {
                debug!(remote, error = %e, "no usable sidecar");
                return false;
            }
        };
        match compute_file_checksum(local, self.algorithm) {
            Ok(digest) => digest.matches_sidecar(&sidecar),
            Err(e) => {
                debug!(path = %local.display(), error = %e, "cannot hash local file");
                false
            }
        }
    }
}
