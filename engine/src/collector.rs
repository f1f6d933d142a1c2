//! Source enumeration.
//!
//! Walks every configured source directory, then the loose source files, and
//! produces the ordered manifest the executors consume. Bad entries are
//! reported as warnings and skipped; collection itself never fails.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::fs_ops::absolute_root;
use crate::model::{Origin, SourceItem};
use crate::progress::{Reporter, StopFlag};

/// Result of a collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub items: Vec<SourceItem>,
    pub total_bytes: u64,
    /// Collection was cut short by the stop flag
    pub stopped: bool,
}

impl Manifest {
    fn push(&mut self, item: SourceItem) {
        self.total_bytes += item.size_bytes;
        self.items.push(item);
    }
}

/// True for names starting with `.` (other than `.` and `..`).
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

fn is_hidden_entry(entry: &DirEntry) -> bool {
    entry.depth() > 0 && is_hidden_name(&entry.file_name().to_string_lossy())
}

pub struct FileCollector<'a> {
    skip_hidden: bool,
    reporter: &'a Reporter,
    stop: &'a StopFlag,
}

impl<'a> FileCollector<'a> {
    pub fn new(skip_hidden: bool, reporter: &'a Reporter, stop: &'a StopFlag) -> Self {
        FileCollector {
            skip_hidden,
            reporter,
            stop,
        }
    }

    /// Collect directories first (in the order given), then loose files.
    pub fn collect(&self, directories: &[PathBuf], files: &[PathBuf]) -> Manifest {
        let mut manifest = Manifest::default();

        for root in directories {
            if self.stop.is_stopped() {
                manifest.stopped = true;
                return manifest;
            }
            self.collect_directory(root, &mut manifest);
            if manifest.stopped {
                return manifest;
            }
        }

        for path in files {
            if self.stop.is_stopped() {
                manifest.stopped = true;
                return manifest;
            }
            self.collect_file(path, &mut manifest);
        }

        debug!(
            items = manifest.items.len(),
            bytes = manifest.total_bytes,
            "collection finished"
        );
        manifest
    }

    fn collect_directory(&self, root: &Path, manifest: &mut Manifest) {
        let root = match absolute_root(root) {
            Ok(root) => root,
            Err(e) => {
                self.reporter
                    .warning(format!("Cannot resolve source {}: {}", root.display(), e));
                return;
            }
        };
        let root = root.as_path();

        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                self.reporter
                    .warning(format!("Source is not a directory: {}", root.display()));
                return;
            }
            Err(e) => {
                self.reporter
                    .warning(format!("Directory not found: {} ({})", root.display(), e));
                return;
            }
        }

        let skip_hidden = self.skip_hidden;
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !(skip_hidden && is_hidden_entry(entry)));

        for entry in walker {
            if self.stop.is_stopped() {
                manifest.stopped = true;
                return;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| root.display().to_string());
                    self.reporter
                        .warning(format!("Cannot read {}: {}", path, e));
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }

            // Symlinks count only when they resolve to a regular file.
            let metadata = if file_type.is_symlink() {
                fs::metadata(entry.path())
            } else {
                entry.metadata().map_err(std::io::Error::from)
            };
            let metadata = match metadata {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    self.reporter.warning(format!(
                        "Cannot stat {}: {}",
                        entry.path().display(),
                        e
                    ));
                    continue;
                }
            };

            let relative_path = match entry.path().strip_prefix(root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };

            manifest.push(SourceItem {
                absolute_path: entry.path().to_path_buf(),
                relative_path,
                size_bytes: metadata.len(),
                origin: Origin::Directory {
                    root: root.to_path_buf(),
                },
            });
        }
    }

    fn collect_file(&self, path: &Path, manifest: &mut Manifest) {
        let name = match path.file_name() {
            Some(name) => name.to_os_string(),
            None => {
                self.reporter
                    .warning(format!("Not a file path: {}", path.display()));
                return;
            }
        };

        if self.skip_hidden && is_hidden_name(&name.to_string_lossy()) {
            debug!(path = %path.display(), "skipping hidden source file");
            return;
        }

        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => manifest.push(SourceItem {
                absolute_path: path.to_path_buf(),
                relative_path: PathBuf::from(name),
                size_bytes: meta.len(),
                origin: Origin::File,
            }),
            Ok(_) => self
                .reporter
                .warning(format!("Source is not a regular file: {}", path.display())),
            Err(e) => self
                .reporter
                .warning(format!("File not found: {} ({})", path.display(), e)),
        }
    }
}
