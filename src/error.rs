use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::models::ScanRecord;

pub type Result<T, E = AnonymizerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AnonymizerError {
    #[error("Failed to read {path:?}: {reason}")]
    UnreadableRecord { path: PathBuf, reason: String },

    #[error("{path:?} has no {field}")]
    MissingRequiredField { path: PathBuf, field: &'static str },

    #[error("Scan {scan_id} is already registered")]
    DuplicateScan {
        scan_id: String,
        existing: Box<ScanRecord>,
    },

    #[error("No free identifier found after {attempts} attempts")]
    ExhaustedIdentifierSpace { attempts: usize },

    #[error("Failed to persist {path:?}")]
    PersistenceWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Association table {path:?} is corrupt: {reason}")]
    CorruptTable { path: PathBuf, reason: String },

    #[error("Association tables hold conflicting rows: {0}")]
    ConflictingAssociations(String),

    #[error("{path:?} exists! skipping...")]
    OutputExists { path: PathBuf },

    #[error("Failed to save anonymized file to {path:?}: {reason}")]
    OutputWriteFailure { path: PathBuf, reason: String },
}

impl AnonymizerError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: impl Into<io::Error>) -> Self {
        Self::PersistenceWriteFailure {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Errors after which the association tables can no longer be trusted to
    /// accept new identities. Everything else only affects a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ExhaustedIdentifierSpace { .. }
                | Self::PersistenceWriteFailure { .. }
                | Self::CorruptTable { .. }
                | Self::ConflictingAssociations(_)
        )
    }
}
