//! Capacity of the filesystem holding a backup target.

use std::path::{Path, PathBuf};

use sysinfo::Disks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStats {
    pub mount_point: PathBuf,
    pub total: u64,
    pub free: u64,
}

impl DiskStats {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    pub fn percentage_used(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.used() as f32 / self.total as f32) * 100.0
    }
}

/// Nearest ancestor of `path` that exists (the target may not be created yet).
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    absolute
        .ancestors()
        .find(|p| p.exists())
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
}

/// Pick the mount with the longest mount-point prefix of `path`.
fn best_mount<'a>(path: &Path, mounts: impl Iterator<Item = (&'a Path, u64, u64)>) -> Option<DiskStats> {
    mounts
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(mount, total, free)| DiskStats {
            mount_point: mount.to_path_buf(),
            total,
            free,
        })
}

/// Look up the filesystem that `path` (or its nearest existing ancestor) lives on.
pub fn disk_stats_for(path: &Path) -> Option<DiskStats> {
    let anchor = existing_ancestor(path)?;
    let disks = Disks::new_with_refreshed_list();
    best_mount(
        &anchor,
        disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.total_space(), d.available_space())),
    )
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
