use std::sync::Arc;

use tracing::debug;

use crate::error::{AnonymizerError, Result};
use crate::models::{RawSubject, ScanFields, ScanRecord, Sex, SubjectRecord};
use crate::store::AssociationStore;

/// Get-or-create front end over the association store.
///
/// This is the only place where a subject's pseudo-identity is decided.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<AssociationStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<AssociationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &AssociationStore {
        &self.store
    }

    /// Returns the subject's record, creating it on first sight.
    ///
    /// Known subjects keep their fake identity; raw fields they were missing
    /// are filled in from `raw`.
    pub fn resolve_subject(&self, raw: RawSubject, sex: Sex) -> Result<SubjectRecord> {
        let Some(existing) = self.store.find_subject(&raw.patient_id) else {
            return self.store.create_subject(raw, sex);
        };

        let mut probe = existing.raw.clone();
        if !probe.fill_missing(&raw) {
            return Ok(existing);
        }
        Ok(self.store.enrich_subject(&raw)?.unwrap_or(existing))
    }

    /// Returns the scan's record, registering it on first sight.
    pub fn resolve_scan(
        &self,
        scan_id: &str,
        subject_raw_id: &str,
        fields: ScanFields,
    ) -> Result<ScanRecord> {
        if let Some(existing) = self.store.find_scan(scan_id) {
            return Ok(existing);
        }
        match self.store.create_scan(scan_id, subject_raw_id, fields) {
            Err(AnonymizerError::DuplicateScan { existing, .. }) => {
                // Another worker registered it between the lookup and the insert.
                debug!(scan_id, "Scan registered concurrently, keeping stored row");
                Ok(*existing)
            }
            other => other,
        }
    }
}
