//
// persistence.rs
// Dicom-Anonymizer-rs
//
// Durable backends for the subject and scan association tables.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AnonymizerError, Result};
use crate::models::{ScanRecord, SubjectRecord};

/// Subject rows keyed by raw subject id.
pub type SubjectTable = BTreeMap<String, SubjectRecord>;
/// Scan rows keyed by scan id.
pub type ScanTable = BTreeMap<String, ScanRecord>;

/// Everything a backend holds, as loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct Associations {
    pub subjects: Vec<SubjectRecord>,
    pub scans: Vec<ScanRecord>,
}

/// Durable storage for the association tables.
///
/// Each `persist_*` call receives the mutated record together with the full
/// table that contains it. A call only returns `Ok` once the change is on disk.
pub trait AssociationBackend: Send + Sync {
    fn load(&self) -> Result<Associations>;
    fn persist_subject(&self, record: &SubjectRecord, table: &SubjectTable) -> Result<()>;
    fn persist_scan(&self, record: &ScanRecord, table: &ScanTable) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct SubjectSheet {
    #[serde(rename = "Subjects")]
    rows: Vec<SubjectRecord>,
}

#[derive(Serialize, Deserialize)]
struct ScanSheet {
    #[serde(rename = "Scans")]
    rows: Vec<ScanRecord>,
}

/// Two JSON documents, rewritten in full on every mutation.
#[derive(Debug, Clone)]
pub struct JsonTableBackend {
    subjects_path: PathBuf,
    scans_path: PathBuf,
}

impl JsonTableBackend {
    pub fn new(subjects_path: impl Into<PathBuf>, scans_path: impl Into<PathBuf>) -> Self {
        Self {
            subjects_path: subjects_path.into(),
            scans_path: scans_path.into(),
        }
    }
}

impl AssociationBackend for JsonTableBackend {
    fn load(&self) -> Result<Associations> {
        let subjects = read_sheet::<SubjectSheet>(&self.subjects_path)?
            .map(|sheet| sheet.rows)
            .unwrap_or_default();
        let scans = read_sheet::<ScanSheet>(&self.scans_path)?
            .map(|sheet| sheet.rows)
            .unwrap_or_default();
        debug!(
            subjects = subjects.len(),
            scans = scans.len(),
            "Loaded association tables"
        );
        Ok(Associations { subjects, scans })
    }

    fn persist_subject(&self, _record: &SubjectRecord, table: &SubjectTable) -> Result<()> {
        let sheet = SubjectSheet {
            rows: table.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&sheet)
            .map_err(|e| AnonymizerError::persistence(&self.subjects_path, e))?;
        write_atomically(&self.subjects_path, &bytes)
    }

    fn persist_scan(&self, _record: &ScanRecord, table: &ScanTable) -> Result<()> {
        let mut rows: Vec<ScanRecord> = table.values().cloned().collect();
        rows.sort_by(|a, b| a.table_order().cmp(&b.table_order()));
        let bytes = serde_json::to_vec_pretty(&ScanSheet { rows })
            .map_err(|e| AnonymizerError::persistence(&self.scans_path, e))?;
        write_atomically(&self.scans_path, &bytes)
    }
}

fn read_sheet<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|e| corrupt(path, e))?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| corrupt(path, e))
}

/// Writes `bytes` to a sibling temp file, syncs it, renames it over `path`,
/// then syncs the directory so the rename itself is durable.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("table"));
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    let renamed = written.and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = renamed {
        let _ = fs::remove_file(&tmp);
        return Err(AnonymizerError::persistence(path, e));
    }
    sync_parent(path).map_err(|e| AnonymizerError::persistence(path, e))
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => File::open(".")?.sync_all(),
    }
}

// Directories cannot be opened as files here; the rename is the best we get.
#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| AnonymizerError::persistence(path, e))
        }
        _ => Ok(()),
    }
}

fn corrupt(path: &Path, reason: impl ToString) -> AnonymizerError {
    AnonymizerError::CorruptTable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Two JSON-lines journals; every mutation appends a single line.
///
/// Replaying a journal keeps the last line written for each subject, so
/// enriched subjects supersede their earlier rows.
#[derive(Debug, Clone)]
pub struct JournalBackend {
    subjects_path: PathBuf,
    scans_path: PathBuf,
}

impl JournalBackend {
    pub fn new(subjects_path: impl Into<PathBuf>, scans_path: impl Into<PathBuf>) -> Self {
        Self {
            subjects_path: subjects_path.into(),
            scans_path: scans_path.into(),
        }
    }
}

impl AssociationBackend for JournalBackend {
    fn load(&self) -> Result<Associations> {
        let mut subjects = BTreeMap::new();
        for record in replay::<SubjectRecord>(&self.subjects_path)? {
            subjects.insert(record.raw.patient_id.clone(), record);
        }

        let mut scans = BTreeMap::new();
        for record in replay::<ScanRecord>(&self.scans_path)? {
            scans.entry(record.scan_id.clone()).or_insert(record);
        }

        Ok(Associations {
            subjects: subjects.into_values().collect(),
            scans: scans.into_values().collect(),
        })
    }

    fn persist_subject(&self, record: &SubjectRecord, _table: &SubjectTable) -> Result<()> {
        append_line(&self.subjects_path, record)
    }

    fn persist_scan(&self, record: &ScanRecord, _table: &ScanTable) -> Result<()> {
        append_line(&self.scans_path, record)
    }
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    ensure_parent(path)?;
    let mut line = serde_json::to_vec(record).map_err(|e| AnonymizerError::persistence(path, e))?;
    line.push(b'\n');
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            drop_torn_tail(path, &mut file)?;
            file.write_all(&line)?;
            file.sync_data()
        })
        .map_err(|e| AnonymizerError::persistence(path, e))
}

/// Cuts a journal back to its last complete line before anything is appended.
fn drop_torn_tail(path: &Path, file: &mut File) -> io::Result<()> {
    if file.metadata()?.len() == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |idx| idx + 1);
    warn!(path = ?path, "Dropping truncated trailing journal entry");
    file.set_len(keep as u64)
}

fn replay<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).map_err(|e| corrupt(path, e))?;

    // Anything after the last newline was never acknowledged to a caller.
    // Loading leaves the file alone; the next append cuts the tail off.
    let complete_len = text.rfind('\n').map_or(0, |idx| idx + 1);
    if complete_len < text.len() {
        warn!(path = ?path, "Ignoring truncated trailing journal entry");
    }

    text[..complete_len]
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| corrupt(path, format!("line {}: {}", idx + 1, e)))
        })
        .collect()
}

/// Keeps everything in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<Associations>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Associations) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn snapshot(&self) -> Associations {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AssociationBackend for MemoryBackend {
    fn load(&self) -> Result<Associations> {
        Ok(self.snapshot())
    }

    fn persist_subject(&self, _record: &SubjectRecord, table: &SubjectTable) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.subjects = table.values().cloned().collect();
        Ok(())
    }

    fn persist_scan(&self, _record: &ScanRecord, table: &ScanTable) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.scans = table.values().cloned().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnonymizedIdentity, FakeName, RawSubject, ScanFields};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn subject(raw: &str, fake: &str) -> SubjectRecord {
        SubjectRecord {
            raw: RawSubject::new(raw),
            anonymized: AnonymizedIdentity::new(
                fake.to_string(),
                FakeName {
                    last_name: "Doe".into(),
                    first_name: "Jane".into(),
                },
            ),
        }
    }

    fn scan(scan_id: &str, subject: &str, date: u32, number: i64) -> ScanRecord {
        ScanRecord {
            scan_id: scan_id.into(),
            subject_raw_id: subject.into(),
            fields: ScanFields {
                series_date: NaiveDate::from_ymd_opt(2024, 1, date),
                series_number: Some(number),
                ..Default::default()
            },
        }
    }

    #[test]
    fn missing_tables_load_empty() {
        let dir = tempdir().expect("tmpdir");
        let backend = JsonTableBackend::new(dir.path().join("s.json"), dir.path().join("c.json"));
        let loaded = backend.load().expect("load");
        assert!(loaded.subjects.is_empty());
        assert!(loaded.scans.is_empty());

        let journal = JournalBackend::new(dir.path().join("s.jsonl"), dir.path().join("c.jsonl"));
        assert!(journal.load().expect("load journal").subjects.is_empty());
    }

    #[test]
    fn table_backend_sorts_scans_for_readability() {
        let dir = tempdir().expect("tmpdir");
        let scans_path = dir.path().join("nested").join("scans.json");
        let backend = JsonTableBackend::new(dir.path().join("subjects.json"), &scans_path);

        let mut table = ScanTable::new();
        for record in [scan("9", "B", 1, 1), scan("1", "A", 3, 2), scan("5", "A", 2, 7)] {
            table.insert(record.scan_id.clone(), record);
        }
        backend.persist_scan(&table["9"], &table).expect("persist");

        let loaded = backend.load().expect("load");
        let order: Vec<_> = loaded.scans.iter().map(|s| s.scan_id.as_str()).collect();
        assert_eq!(order, ["5", "1", "9"]);
        assert!(!scans_path.with_file_name("scans.json.tmp").exists());
    }

    #[test]
    fn corrupt_table_is_reported() {
        let dir = tempdir().expect("tmpdir");
        let subjects = dir.path().join("subjects.json");
        fs::write(&subjects, b"{ not json").expect("write");
        let backend = JsonTableBackend::new(&subjects, dir.path().join("scans.json"));
        assert!(matches!(
            backend.load(),
            Err(AnonymizerError::CorruptTable { .. })
        ));
    }

    #[test]
    fn journal_keeps_latest_subject_row_and_drops_torn_tail() {
        let dir = tempdir().expect("tmpdir");
        let subjects_path = dir.path().join("subjects.jsonl");
        let backend = JournalBackend::new(&subjects_path, dir.path().join("scans.jsonl"));
        let table = SubjectTable::new();

        let first = subject("A1", "AAAA1111");
        let mut enriched = first.clone();
        enriched.raw.sex = Some("F".into());
        backend.persist_subject(&first, &table).expect("append");
        backend.persist_subject(&enriched, &table).expect("append");

        let mut file = OpenOptions::new()
            .append(true)
            .open(&subjects_path)
            .expect("open");
        file.write_all(b"{\"Raw\":{\"Pat").expect("torn write");
        drop(file);

        let torn_len = fs::metadata(&subjects_path).expect("stat").len();
        let loaded = backend.load().expect("load");
        assert_eq!(loaded.subjects, vec![enriched]);
        // Loading alone never rewrites the journal.
        assert_eq!(fs::metadata(&subjects_path).expect("stat").len(), torn_len);

        // The next append cuts the torn tail and starts on a clean line.
        backend
            .persist_subject(&subject("B2", "BBBB2222"), &table)
            .expect("append");
        assert_eq!(backend.load().expect("reload").subjects.len(), 2);
        let text = fs::read_to_string(&subjects_path).expect("read journal");
        for line in text.lines() {
            serde_json::from_str::<SubjectRecord>(line).expect("complete journal line");
        }
    }

    #[test]
    fn table_rewrite_replaces_previous_contents() {
        let dir = tempdir().expect("tmpdir");
        let subjects_path = dir.path().join("subjects.json");
        let backend = JsonTableBackend::new(&subjects_path, dir.path().join("scans.json"));

        let mut table = SubjectTable::new();
        let first = subject("A1", "AAAA1111");
        table.insert("A1".into(), first.clone());
        backend.persist_subject(&first, &table).expect("persist");
        let second = subject("B2", "BBBB2222");
        table.insert("B2".into(), second.clone());
        backend.persist_subject(&second, &table).expect("persist again");

        assert_eq!(backend.load().expect("load").subjects, vec![first, second]);
        assert!(!subjects_path.with_file_name("subjects.json.tmp").exists());
    }

    #[test]
    fn journal_rejects_garbage_in_the_middle() {
        let dir = tempdir().expect("tmpdir");
        let scans_path = dir.path().join("scans.jsonl");
        let line = serde_json::to_string(&scan("1", "A", 1, 1)).unwrap();
        fs::write(&scans_path, format!("{}\nnonsense\n{}\n", line, line)).expect("write");
        let backend = JournalBackend::new(dir.path().join("subjects.jsonl"), &scans_path);
        assert!(matches!(
            backend.load(),
            Err(AnonymizerError::CorruptTable { .. })
        ));
    }
}
