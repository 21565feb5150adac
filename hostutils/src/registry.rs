use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::debug;
use regex::Regex;

use crate::image::{self, ImageVersion};

const IMAGE_FILE_PATTERNS: &[&str] = &["*.bin", "*.swi"];

/// A firmware image file found on host storage. Built on demand; never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub version: ImageVersion,
}

/// Enumerates firmware image files in a fixed set of directories.
#[derive(Debug, Clone)]
pub struct ImageRegistry {
    dirs: Vec<PathBuf>,
}

impl ImageRegistry {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Scans every configured directory for image files and probes each for a
    /// version. Files whose version cannot be extracted are skipped;
    /// non-existent directories are ignored. Returns the records alongside
    /// scan errors that are worth surfacing (unreadable file metadata).
    pub fn find_all(&self) -> (Vec<ImageRecord>, Vec<String>) {
        let mut records = Vec::new();
        let mut errors = Vec::new();

        for dir in &self.dirs {
            if !dir.is_dir() {
                continue;
            }
            for pattern in IMAGE_FILE_PATTERNS {
                let glob_pattern = format!("{}/{}", dir.display(), pattern);
                let paths = match glob::glob(&glob_pattern) {
                    Ok(paths) => paths,
                    Err(e) => {
                        errors.push(format!("Bad glob pattern '{glob_pattern}': {e}"));
                        continue;
                    }
                };
                for entry in paths {
                    let path = match entry {
                        Ok(path) => path,
                        Err(e) => {
                            errors.push(format!("Failed to read directory entry: {e}"));
                            continue;
                        }
                    };
                    if !path.is_file() {
                        continue;
                    }
                    match record_for(&path) {
                        Ok(record) => records.push(record),
                        Err(e) => debug!("Skipping '{}': {e:#}", path.display()),
                    }
                }
            }
        }

        (records, errors)
    }

    /// As `find_all`, retaining only records whose raw or full version equals
    /// `query` exactly.
    pub fn find_by_version(&self, query: &str) -> (Vec<ImageRecord>, Vec<String>) {
        let (records, errors) = self.find_all();
        let records = records
            .into_iter()
            .filter(|r| r.version.raw == query || r.version.full == query)
            .collect();
        (records, errors)
    }
}

/// Retains records whose raw or full version matches the regular expression
/// `pattern`. Fails when the pattern does not compile.
pub fn filter_by_pattern(
    records: Vec<ImageRecord>,
    pattern: &str,
) -> Result<Vec<ImageRecord>, Error> {
    let re = Regex::new(pattern).context(format!("Invalid version pattern '{pattern}'"))?;
    Ok(records
        .into_iter()
        .filter(|r| re.is_match(&r.version.raw) || re.is_match(&r.version.full))
        .collect())
}

fn record_for(path: &Path) -> Result<ImageRecord, Error> {
    let version = image::extract_version(path)?;
    let size_bytes = path
        .metadata()
        .context(format!("Failed to stat '{}'", path.display()))?
        .len();
    Ok(ImageRecord {
        path: path.to_path_buf(),
        size_bytes,
        version,
    })
}
