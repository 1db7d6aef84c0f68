//
// store.rs
// Dicom-Anonymizer-rs
//
// Shared, durably persisted mapping from raw subject/scan identifiers to their records.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::allocator::IdentifierAllocator;
use crate::error::{AnonymizerError, Result};
use crate::faker::NameGenerator;
use crate::models::{AnonymizedIdentity, RawSubject, ScanFields, ScanRecord, Sex, SubjectRecord};
use crate::persistence::{AssociationBackend, ScanTable, SubjectTable};

struct SubjectState {
    table: SubjectTable,
    fake_ids: HashSet<String>,
    allocator: IdentifierAllocator,
    names: Box<dyn NameGenerator>,
}

/// Subject and scan associations, loaded once and persisted on every mutation.
///
/// Each table sits behind its own `RwLock`. A mutation holds the write lock
/// from the existence check until the backend confirms the write, so two
/// workers can never both create the same subject or scan.
pub struct AssociationStore {
    backend: Box<dyn AssociationBackend>,
    subjects: RwLock<SubjectState>,
    scans: RwLock<ScanTable>,
}

impl AssociationStore {
    pub fn open(
        backend: impl AssociationBackend + 'static,
        allocator: IdentifierAllocator,
        names: impl NameGenerator + 'static,
    ) -> Result<Self> {
        let loaded = backend.load()?;

        let mut table = SubjectTable::new();
        let mut fake_ids = HashSet::new();
        for record in loaded.subjects {
            if !fake_ids.insert(record.anonymized.patient_id.clone()) {
                return Err(AnonymizerError::ConflictingAssociations(format!(
                    "pseudo-identifier {} is assigned more than once",
                    record.anonymized.patient_id
                )));
            }
            let raw_id = record.raw.patient_id.clone();
            if table.insert(raw_id.clone(), record).is_some() {
                return Err(AnonymizerError::ConflictingAssociations(format!(
                    "subject {} appears more than once",
                    raw_id
                )));
            }
        }

        let mut scans = ScanTable::new();
        for record in loaded.scans {
            scans.entry(record.scan_id.clone()).or_insert(record);
        }

        Ok(Self {
            backend: Box::new(backend),
            subjects: RwLock::new(SubjectState {
                table,
                fake_ids,
                allocator,
                names: Box::new(names),
            }),
            scans: RwLock::new(scans),
        })
    }

    pub fn find_subject(&self, raw_id: &str) -> Option<SubjectRecord> {
        self.read_subjects().table.get(raw_id).cloned()
    }

    /// Creates the subject unless it already exists, in which case the stored
    /// record is returned untouched.
    pub fn create_subject(&self, raw: RawSubject, sex: Sex) -> Result<SubjectRecord> {
        let mut guard = self.write_subjects();
        let state = &mut *guard;

        if let Some(existing) = state.table.get(&raw.patient_id) {
            return Ok(existing.clone());
        }

        let fake_id = state.allocator.allocate(&state.fake_ids)?;
        let name = state.names.name_for(sex);
        let record = SubjectRecord {
            raw,
            anonymized: AnonymizedIdentity::new(fake_id, name),
        };

        let raw_id = record.raw.patient_id.clone();
        state.table.insert(raw_id.clone(), record.clone());
        if let Err(err) = self.backend.persist_subject(&record, &state.table) {
            state.table.remove(&raw_id);
            return Err(err);
        }
        state.fake_ids.insert(record.anonymized.patient_id.clone());

        info!(fake_id = %record.anonymized.patient_id, "Registered new subject");
        Ok(record)
    }

    /// Fills raw fields that are still empty on a stored subject.
    ///
    /// Returns `None` for unknown subjects. The anonymized identity is never
    /// touched and nothing is written when no field changes.
    pub fn enrich_subject(&self, raw: &RawSubject) -> Result<Option<SubjectRecord>> {
        let mut guard = self.write_subjects();
        let state = &mut *guard;

        let Some(current) = state.table.get(&raw.patient_id).cloned() else {
            return Ok(None);
        };
        let mut updated = current.clone();
        if !updated.raw.fill_missing(raw) {
            return Ok(Some(current));
        }

        state.table.insert(raw.patient_id.clone(), updated.clone());
        if let Err(err) = self.backend.persist_subject(&updated, &state.table) {
            state.table.insert(raw.patient_id.clone(), current);
            return Err(err);
        }
        debug!(fake_id = %updated.anonymized.patient_id, "Filled missing subject fields");
        Ok(Some(updated))
    }

    pub fn find_scan(&self, scan_id: &str) -> Option<ScanRecord> {
        self.read_scans().get(scan_id).cloned()
    }

    /// Appends a scan. Existing scans are never replaced; asking for one again
    /// yields `DuplicateScan` carrying the stored record.
    pub fn create_scan(
        &self,
        scan_id: &str,
        subject_raw_id: &str,
        fields: ScanFields,
    ) -> Result<ScanRecord> {
        let mut scans = self.write_scans();

        if let Some(existing) = scans.get(scan_id) {
            return Err(AnonymizerError::DuplicateScan {
                scan_id: scan_id.to_string(),
                existing: Box::new(existing.clone()),
            });
        }

        let record = ScanRecord {
            scan_id: scan_id.to_string(),
            subject_raw_id: subject_raw_id.to_string(),
            fields,
        };
        scans.insert(record.scan_id.clone(), record.clone());
        if let Err(err) = self.backend.persist_scan(&record, &scans) {
            scans.remove(scan_id);
            return Err(err);
        }

        debug!(scan_id, "Registered new scan");
        Ok(record)
    }

    pub fn subject_count(&self) -> usize {
        self.read_subjects().table.len()
    }

    pub fn scan_count(&self) -> usize {
        self.read_scans().len()
    }

    /// All subjects ordered by raw id.
    pub fn subjects(&self) -> Vec<SubjectRecord> {
        self.read_subjects().table.values().cloned().collect()
    }

    /// All scans in table order: subject, series date, series number.
    pub fn scans(&self) -> Vec<ScanRecord> {
        let mut scans: Vec<_> = self.read_scans().values().cloned().collect();
        scans.sort_by(|a, b| a.table_order().cmp(&b.table_order()));
        scans
    }

    fn read_subjects(&self) -> RwLockReadGuard<'_, SubjectState> {
        self.subjects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subjects(&self) -> RwLockWriteGuard<'_, SubjectState> {
        self.subjects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_scans(&self) -> RwLockReadGuard<'_, ScanTable> {
        self.scans.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_scans(&self) -> RwLockWriteGuard<'_, ScanTable> {
        self.scans.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::allocator::IdFormat;
    use crate::faker::FakerNames;
    use crate::models::FakeName;
    use crate::persistence::{Associations, MemoryBackend};

    fn store_with(backend: impl AssociationBackend + 'static) -> AssociationStore {
        AssociationStore::open(
            backend,
            IdentifierAllocator::seeded(IdFormat::default(), 5),
            FakerNames::seeded(5),
        )
        .expect("open store")
    }

    /// Backend whose writes can be switched off.
    #[derive(Clone, Default)]
    struct FlakyBackend {
        inner: Arc<MemoryBackend>,
        broken: Arc<AtomicBool>,
    }

    impl FlakyBackend {
        fn check(&self) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(AnonymizerError::persistence(
                    "memory",
                    io::Error::new(io::ErrorKind::Other, "disk full"),
                ));
            }
            Ok(())
        }
    }

    impl AssociationBackend for FlakyBackend {
        fn load(&self) -> Result<Associations> {
            self.inner.load()
        }

        fn persist_subject(&self, record: &SubjectRecord, table: &SubjectTable) -> Result<()> {
            self.check()?;
            self.inner.persist_subject(record, table)
        }

        fn persist_scan(&self, record: &ScanRecord, table: &ScanTable) -> Result<()> {
            self.check()?;
            self.inner.persist_scan(record, table)
        }
    }

    #[test]
    fn create_subject_is_check_then_create() {
        let store = store_with(MemoryBackend::new());
        let first = store
            .create_subject(RawSubject::new("A1"), Sex::Male)
            .expect("create");
        let again = store
            .create_subject(RawSubject::new("A1"), Sex::Female)
            .expect("create twice");

        assert_eq!(first, again);
        assert_eq!(store.subject_count(), 1);
        assert_eq!(store.find_subject("A1"), Some(first));
        assert_eq!(store.find_subject("B2"), None);
    }

    #[test]
    fn distinct_subjects_get_distinct_ids() {
        let store = store_with(MemoryBackend::new());
        let ids: HashSet<_> = (0..500)
            .map(|i| {
                store
                    .create_subject(RawSubject::new(format!("RAW{}", i)), Sex::Unspecified)
                    .expect("create")
                    .anonymized
                    .patient_id
            })
            .collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn failed_write_leaves_no_trace() {
        let backend = FlakyBackend::default();
        let store = store_with(backend.clone());
        backend.broken.store(true, Ordering::SeqCst);

        let err = store
            .create_subject(RawSubject::new("A1"), Sex::Male)
            .unwrap_err();
        assert!(matches!(err, AnonymizerError::PersistenceWriteFailure { .. }));
        assert!(err.is_fatal());
        assert_eq!(store.find_subject("A1"), None);

        let err = store
            .create_scan("1.2.3", "A1", ScanFields::default())
            .unwrap_err();
        assert!(matches!(err, AnonymizerError::PersistenceWriteFailure { .. }));
        assert_eq!(store.find_scan("1.2.3"), None);

        backend.broken.store(false, Ordering::SeqCst);
        store
            .create_subject(RawSubject::new("A1"), Sex::Male)
            .expect("retry after recovery");
        assert_eq!(backend.inner.snapshot().subjects.len(), 1);
    }

    #[test]
    fn scans_are_append_only() {
        let store = store_with(MemoryBackend::new());
        let original = ScanFields {
            series_description: Some("T1".into()),
            ..Default::default()
        };
        let created = store
            .create_scan("1.2.840.9999", "A1", original)
            .expect("create scan");

        let replacement = ScanFields {
            series_description: Some("T2".into()),
            ..Default::default()
        };
        match store.create_scan("1.2.840.9999", "B2", replacement) {
            Err(AnonymizerError::DuplicateScan { existing, .. }) => assert_eq!(*existing, created),
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(store.find_scan("1.2.840.9999"), Some(created));
        assert_eq!(store.scan_count(), 1);
    }

    #[test]
    fn enrichment_only_fills_gaps() {
        let backend = MemoryBackend::new();
        let store = store_with(backend);
        let created = store
            .create_subject(
                RawSubject {
                    sex: Some("M".into()),
                    ..RawSubject::new("A1")
                },
                Sex::Male,
            )
            .expect("create");

        let enriched = store
            .enrich_subject(&RawSubject {
                sex: Some("F".into()),
                height: Some(1.8),
                ..RawSubject::new("A1")
            })
            .expect("enrich")
            .expect("known subject");

        assert_eq!(enriched.anonymized, created.anonymized);
        assert_eq!(enriched.raw.sex.as_deref(), Some("M"));
        assert_eq!(enriched.raw.height, Some(1.8));
        assert!(store
            .enrich_subject(&RawSubject::new("unknown"))
            .expect("enrich unknown")
            .is_none());
    }

    #[test]
    fn conflicting_tables_are_rejected() {
        let record = |raw: &str| SubjectRecord {
            raw: RawSubject::new(raw),
            anonymized: AnonymizedIdentity::new(
                "SAMEID01".into(),
                FakeName {
                    last_name: "Smith".into(),
                    first_name: "John".into(),
                },
            ),
        };
        let backend = MemoryBackend::with_data(Associations {
            subjects: vec![record("A1"), record("B2")],
            scans: Vec::new(),
        });
        let result = AssociationStore::open(
            backend,
            IdentifierAllocator::seeded(IdFormat::default(), 1),
            FakerNames::seeded(1),
        );
        assert!(matches!(
            result,
            Err(AnonymizerError::ConflictingAssociations(_))
        ));
    }

    #[test]
    fn exhausted_space_propagates() {
        let store = AssociationStore::open(
            MemoryBackend::new(),
            IdentifierAllocator::seeded(IdFormat::Numeric { len: 1 }, 2).with_max_attempts(200),
            FakerNames::seeded(2),
        )
        .expect("open");
        for i in 0..9 {
            store
                .create_subject(RawSubject::new(format!("S{}", i)), Sex::Unspecified)
                .expect("space not yet full");
        }
        let err = store
            .create_subject(RawSubject::new("S9"), Sex::Unspecified)
            .unwrap_err();
        assert!(matches!(err, AnonymizerError::ExhaustedIdentifierSpace { .. }));
        assert_eq!(store.subject_count(), 9);
    }
}
