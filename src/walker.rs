use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

/// Lazily yields every file under `root` whose extension matches `extension`
/// (case-insensitive). An empty extension matches every file.
pub fn files_with_extension(root: &Path, extension: &str) -> impl Iterator<Item = PathBuf> {
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();

    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "Skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(move |entry| {
            extension.is_empty()
                || entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| ext.eq_ignore_ascii_case(&extension))
        })
        .map(|entry| entry.into_path())
}
