//! Filesystem operations for local backups.
//!
//! - Destination layout (sanitized source roots, flat basenames)
//! - Idempotent parent directory creation
//! - File copy preserving modification time and permissions

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::EngineError;
use crate::model::SourceItem;

/// Turn a source root into a relative path usable under the backup directory.
///
/// Drive/volume separators (`:`) become `_`. Root, `.` and `..` components are
/// dropped, so `/home/me/docs` maps to `home/me/docs`, `C:\data` to `C_\data`
/// and nothing in the result can climb out of the backup directory.
pub fn sanitize_root(root: &Path) -> PathBuf {
    root.components()
        .filter_map(|component| match component {
            Component::Prefix(prefix) => {
                let text = prefix.as_os_str().to_string_lossy().replace(':', "_");
                let text = text.trim_start_matches(['\\', '/', '?']).to_string();
                (!text.is_empty()).then_some(text)
            }
            Component::Normal(name) => Some(name.to_string_lossy().replace(':', "_")),
            Component::RootDir | Component::CurDir | Component::ParentDir => None,
        })
        .collect()
}

/// Absolute form of a source root with `.` and `..` resolved lexically.
///
/// Symlinks are left alone so the root keeps the name it was given.
pub fn absolute_root(root: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(root)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Path of `item` below `backup_dir` for a tree copy.
///
/// Two loose files (or flat items) sharing a basename map to the same path;
/// the later one overwrites the earlier.
pub fn local_target_path(backup_dir: &Path, item: &SourceItem, preserve_structure: bool) -> PathBuf {
    match item.origin_root() {
        Some(root) if preserve_structure => backup_dir
            .join(sanitize_root(root))
            .join(&item.relative_path),
        _ => backup_dir.join(item.basename()),
    }
}

/// Entry name of `item` inside a backup archive, always `/`-separated.
pub fn archive_entry_name(item: &SourceItem, preserve_structure: bool) -> String {
    let path = match item.origin_root() {
        Some(root) if preserve_structure => sanitize_root(root).join(&item.relative_path),
        _ => PathBuf::from(item.basename()),
    };
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Make sure the parent directory of `path` exists.
///
/// Succeeds when the directory is already there.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    if parent.is_dir() {
        return Ok(());
    }

    fs::create_dir_all(parent).map_err(|source| EngineError::DirectoryCreation {
        path: parent.to_path_buf(),
        source,
    })
}

/// Copy a file, keeping its modification time and permission bits.
///
/// An existing destination is removed first, so a read-only copy left by an
/// earlier run does not block the update. Returns the number of bytes copied.
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<u64, EngineError> {
    ensure_parent_dir_exists(dst)?;

    let read_error = |source| EngineError::Read {
        path: src.to_path_buf(),
        source,
    };
    let write_error = |source| EngineError::Write {
        path: dst.to_path_buf(),
        source,
    };

    let mut src_file = fs::File::open(src).map_err(read_error)?;
    let src_metadata = src_file.metadata().map_err(read_error)?;
    match fs::remove_file(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(write_error(e)),
    }
    let mut dst_file = fs::File::create(dst).map_err(write_error)?;

    let bytes_copied = io::copy(&mut src_file, &mut dst_file).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            write_error(e)
        } else {
            read_error(e)
        }
    })?;
    drop(dst_file);

    fs::set_permissions(dst, src_metadata.permissions()).map_err(write_error)?;
    if let Ok(mtime) = src_metadata.modified() {
        filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime))
            .map_err(write_error)?;
    }

    Ok(bytes_copied)
}
