//! Error types for the backup engine.
//!
//! `EngineError` covers two families. Setup faults (destination root, run
//! artifacts, remote session, configuration) abort a run and reach the caller.
//! Transfer faults (one file could not be read, written or uploaded) are
//! caught at the item boundary, logged, and counted in `RunStats`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::RunState;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The run configuration cannot describe a valid run
    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),

    /// The job was driven out of order (e.g. run before plan)
    #[error("job is {actual}, expected {expected}")]
    InvalidState { expected: RunState, actual: RunState },

    /// Destination root or backup directory could not be created
    #[error("cannot create destination `{}`", .path.display())]
    DestinationSetup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Run metadata, run log or last-backup pointer could not be written
    #[error("cannot write backup artifact `{}`", .path.display())]
    ArtifactSetup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The archive container could not be created or finished
    #[error("archive `{}` is unusable", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// The authenticated remote session could not be established
    #[error("cannot open remote session to {target}")]
    RemoteConnect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// No upload worker thread could be started
    #[error("cannot start upload workers")]
    WorkerSpawn(#[source] io::Error),

    /// Failed to read a source file
    #[error("failed to read `{}`: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write a destination file
    #[error("failed to write `{}`: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a destination directory
    #[error("failed to create directory `{}`: {source}", .path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A remote file operation failed
    #[error("remote operation on `{path}` failed: {source}")]
    Remote {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl EngineError {
    /// True for faults that abort the whole run.
    pub fn is_setup_fault(&self) -> bool {
        !matches!(
            self,
            Self::Read { .. }
                | Self::Write { .. }
                | Self::DirectoryCreation { .. }
                | Self::Remote { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_and_transfer_faults_are_classified() {
        let setup = EngineError::DestinationSetup {
            path: PathBuf::from("/backups"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        let transfer = EngineError::Read {
            path: PathBuf::from("/src/a.txt"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };

        assert!(setup.is_setup_fault());
        assert!(!transfer.is_setup_fault());
        assert!(EngineError::InvalidConfig("no sources".into()).is_setup_fault());
    }

    #[test]
    fn test_transfer_fault_message_names_path() {
        let err = EngineError::Remote {
            path: "/srv/backup/a.txt".to_string(),
            source: io::Error::new(io::ErrorKind::Other, "channel closed"),
        };
        let message = err.to_string();
        assert!(message.contains("/srv/backup/a.txt"));
        assert!(message.contains("channel closed"));
    }
}
