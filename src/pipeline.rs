//
// pipeline.rs
// Dicom-Anonymizer-rs
//
// Walks a source tree in parallel: read, resolve identity, rewrite, save, register the scan.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::anonymize;
use crate::config::AnonymizerConfig;
use crate::error::AnonymizerError;
use crate::models::Sex;
use crate::output::OutputTree;
use crate::record::{read_record, ParsedRecord};
use crate::resolver::IdentityResolver;
use crate::walker;

/// What happened to a single source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Written(PathBuf),
    /// The destination already existed and was left alone.
    SkippedExisting(PathBuf),
}

/// Totals for one run over a source tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub discovered: usize,
    pub written: usize,
    pub skipped_existing: usize,
    pub failed: usize,
    /// Files never started because the run was cancelled or hit a fatal error.
    pub not_started: usize,
    pub subjects_created: usize,
    pub scans_created: usize,
}

struct ErrorLog {
    file: Mutex<File>,
}

impl ErrorLog {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open error log {:?}", path))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn record(&self, path: &Path, err: &AnonymizerError) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{}: {}", path.display(), err) {
            warn!(error = %e, "Failed to append to error log");
        }
    }
}

pub struct AnonymizationPipeline {
    resolver: IdentityResolver,
    output: OutputTree,
    extension: String,
    jobs: Option<usize>,
    error_log: Option<ErrorLog>,
    cancel: Arc<AtomicBool>,
}

impl AnonymizationPipeline {
    pub fn new(resolver: IdentityResolver, output: OutputTree) -> Self {
        Self {
            resolver,
            output,
            extension: "dcm".to_string(),
            jobs: None,
            error_log: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds the store, output tree and error log described by `config`.
    pub fn from_config(config: &AnonymizerConfig, destination: &Path) -> Result<Self> {
        let store = config
            .open_store()
            .context("Failed to load association tables")?;
        let output = OutputTree::new(destination, &config.extension)?;
        let mut pipeline = Self::new(IdentityResolver::new(Arc::new(store)), output)
            .with_extension(&config.extension)
            .with_jobs(config.jobs);
        if let Some(path) = &config.error_log {
            pipeline = pipeline.with_error_log(path)?;
        }
        Ok(pipeline)
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    pub fn with_jobs(mut self, jobs: Option<usize>) -> Self {
        self.jobs = jobs.filter(|n| *n > 0);
        self
    }

    pub fn with_error_log(mut self, path: &Path) -> Result<Self> {
        self.error_log = Some(ErrorLog::open(path)?);
        Ok(self)
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Flag that stops new files from being scheduled once set.
    /// Files already in progress run to completion. The flag stays set
    /// until the caller clears it.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Anonymizes one file.
    ///
    /// The subject's identity is durably recorded before the file is written,
    /// and the scan is registered even when the output already existed.
    pub fn process_file(&self, path: &Path) -> Result<FileOutcome, AnonymizerError> {
        let (mut obj, record) = read_record(path)?;
        let ParsedRecord {
            subject,
            scan_id,
            instance,
            scan_fields,
        } = record;
        let sex = Sex::from_code(subject.sex.as_deref());
        let raw_id = subject.patient_id.clone();

        let identity = self.resolver.resolve_subject(subject, sex)?;
        anonymize::apply_identity(&mut obj, &identity.anonymized);

        let destination = self
            .output
            .destination(identity.fake_id(), &scan_id, &instance);
        let outcome = match self
            .output
            .write_new(&destination, |p| obj.write_to_file(p).map_err(|e| e.to_string()))
        {
            Ok(()) => FileOutcome::Written(destination),
            Err(AnonymizerError::OutputExists { path }) => {
                warn!(path = ?path, "Output exists! skipping...");
                FileOutcome::SkippedExisting(path)
            }
            Err(err) => return Err(err),
        };

        self.resolver.resolve_scan(&scan_id, &raw_id, scan_fields)?;
        Ok(outcome)
    }

    /// Anonymizes every matching file under `source`.
    ///
    /// Per-file problems are logged and counted; a fatal error stops new work
    /// and is returned once in-flight files have finished.
    pub fn run(&self, source: &Path) -> Result<RunReport> {
        info!("Processing directory: {:?}", source);

        let files: Vec<PathBuf> = walker::files_with_extension(source, &self.extension).collect();
        info!("Found {} files.", files.len());

        let store = self.resolver.store();
        let subjects_before = store.subject_count();
        let scans_before = store.scan_count();

        let written = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let not_started = AtomicUsize::new(0);
        let fatal: Mutex<Option<AnonymizerError>> = Mutex::new(None);
        // Set by a fatal error; scoped to this run so the next one starts clean.
        let stop = AtomicBool::new(false);

        if self.cancel.load(Ordering::SeqCst) {
            warn!("Cancellation already requested, no files will be started");
        }

        let work = || {
            files.par_iter().for_each(|path| {
                if self.cancel.load(Ordering::SeqCst) || stop.load(Ordering::SeqCst) {
                    not_started.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                match self.process_file(path) {
                    Ok(FileOutcome::Written(dest)) => {
                        written.fetch_add(1, Ordering::Relaxed);
                        debug!(source = ?path, destination = ?dest, "Anonymized");
                    }
                    Ok(FileOutcome::SkippedExisting(_)) => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) if err.is_fatal() => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        error!(path = ?path, error = %err, "Fatal error, stopping");
                        self.log_failure(path, &err);
                        stop.store(true, Ordering::SeqCst);
                        fatal
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(err);
                    }
                    Err(err) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        error!(path = ?path, error = %err, "Skipping file");
                        self.log_failure(path, &err);
                    }
                }
            })
        };

        match self.jobs {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .context("Failed to start worker pool")?
                .install(work),
            None => work(),
        }

        if let Some(err) = fatal.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(err.into());
        }

        let report = RunReport {
            discovered: files.len(),
            written: written.into_inner(),
            skipped_existing: skipped.into_inner(),
            failed: failed.into_inner(),
            not_started: not_started.into_inner(),
            subjects_created: store.subject_count() - subjects_before,
            scans_created: store.scan_count() - scans_before,
        };
        info!(?report, "Run finished");
        Ok(report)
    }

    fn log_failure(&self, path: &Path, err: &AnonymizerError) {
        if let Some(log) = &self.error_log {
            log.record(path, err);
        }
    }
}
