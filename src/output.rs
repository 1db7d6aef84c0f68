//
// output.rs
// Dicom-Anonymizer-rs
//
// Destination tree for anonymized files: <root>/<fake id>/<scan id>/<instance>.<ext>, never overwriting.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{AnonymizerError, Result};

#[derive(Debug, Clone)]
pub struct OutputTree {
    root: PathBuf,
    extension: String,
}

impl OutputTree {
    pub fn new(root: impl AsRef<Path>, extension: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        // Create the destination eagerly so a bad path fails before any identity is assigned.
        fs::create_dir_all(&root).map_err(|e| AnonymizerError::OutputWriteFailure {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            root,
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn destination(&self, fake_id: &str, scan_id: &str, instance: &str) -> PathBuf {
        let file_name = if self.extension.is_empty() {
            sanitize_component(instance)
        } else {
            format!("{}.{}", sanitize_component(instance), self.extension)
        };
        self.root
            .join(sanitize_component(fake_id))
            .join(sanitize_component(scan_id))
            .join(file_name)
    }

    /// Claims `path` and lets `write` fill it.
    ///
    /// The claim uses `create_new`, so two workers racing for the same path
    /// cannot both win and an existing file is never touched.
    pub fn write_new<F>(&self, path: &Path, write: F) -> Result<()>
    where
        F: FnOnce(&Path) -> std::result::Result<(), String>,
    {
        let failure = |reason: String| AnonymizerError::OutputWriteFailure {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| failure(e.to_string()))?;
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(AnonymizerError::OutputExists {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(failure(e.to_string())),
        }

        write(path).map_err(|reason| {
            let _ = fs::remove_file(path);
            failure(reason)
        })
    }
}

fn sanitize_component(input: &str) -> String {
    // Keep only ASCII word characters, dots and dashes; no component may climb out of the tree.
    let cleaned: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}
