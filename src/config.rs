//
// config.rs
// Dicom-Anonymizer-rs
//
// Run configuration: where the association tables live and how new identities are minted.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use crate::allocator::{IdFormat, IdentifierAllocator, DEFAULT_MAX_ATTEMPTS};
use crate::error::Result;
use crate::faker::FakerNames;
use crate::persistence::{JournalBackend, JsonTableBackend};
use crate::store::AssociationStore;

/// How the association tables are kept on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Whole-table JSON documents, rewritten on each change.
    #[default]
    Table,
    /// Append-only JSON-lines journals.
    Journal,
}

#[derive(Debug, Clone)]
pub struct AnonymizerConfig {
    pub subjects_file: PathBuf,
    pub scans_file: PathBuf,
    pub backend: BackendKind,
    pub id_format: IdFormat,
    pub max_attempts: usize,
    pub extension: String,
    pub error_log: Option<PathBuf>,
    pub jobs: Option<usize>,
    /// Fixed seed for identifiers and names; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            subjects_file: PathBuf::from("subjects.json"),
            scans_file: PathBuf::from("scans.json"),
            backend: BackendKind::Table,
            id_format: IdFormat::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            extension: "dcm".to_string(),
            error_log: Some(PathBuf::from("errors.log")),
            jobs: None,
            seed: None,
        }
    }
}

impl AnonymizerConfig {
    /// Loads the association tables with the configured backend.
    pub fn open_store(&self) -> Result<AssociationStore> {
        let (allocator, names) = match self.seed {
            Some(seed) => (
                IdentifierAllocator::seeded(self.id_format, seed),
                FakerNames::seeded(seed.wrapping_add(1)),
            ),
            None => (
                IdentifierAllocator::from_entropy(self.id_format),
                FakerNames::from_entropy(),
            ),
        };
        let allocator = allocator.with_max_attempts(self.max_attempts);

        match self.backend {
            BackendKind::Table => AssociationStore::open(
                JsonTableBackend::new(&self.subjects_file, &self.scans_file),
                allocator,
                names,
            ),
            BackendKind::Journal => AssociationStore::open(
                JournalBackend::new(&self.subjects_file, &self.scans_file),
                allocator,
                names,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawSubject, Sex};
    use tempfile::tempdir;

    #[test]
    fn both_backends_persist_across_reopen() {
        for backend in [BackendKind::Table, BackendKind::Journal] {
            let dir = tempdir().expect("tmpdir");
            let config = AnonymizerConfig {
                subjects_file: dir.path().join("subjects"),
                scans_file: dir.path().join("scans"),
                backend,
                seed: Some(3),
                ..Default::default()
            };

            let created = config
                .open_store()
                .expect("open")
                .create_subject(RawSubject::new("A1"), Sex::Male)
                .expect("create");
            let reopened = config.open_store().expect("reopen");
            assert_eq!(reopened.find_subject("A1"), Some(created));
        }
    }
}
