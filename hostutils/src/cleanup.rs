use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Error};
use log::{debug, info};

/// Outcome of one cleanup sweep. All counters are monotonic during a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_deleted: i32,
    pub deleted_paths: Vec<String>,
    pub errors: Vec<String>,
    pub bytes_freed: u64,
}

/// Removes every file matching one of `patterns` in each of `dirs`,
/// accumulating the space reclaimed. Errors are recorded but never abort the
/// sweep; non-existent directories simply match nothing.
pub fn cleanup(dirs: &[PathBuf], patterns: &[String]) -> CleanupReport {
    let mut report = CleanupReport::default();

    for dir in dirs {
        for pattern in patterns {
            let glob_pattern = format!("{}/{}", dir.display(), pattern);
            debug!("Sweeping '{glob_pattern}'");
            let paths = match glob::glob(&glob_pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    report
                        .errors
                        .push(format!("Bad glob pattern '{glob_pattern}': {e}"));
                    continue;
                }
            };
            for entry in paths {
                match entry {
                    Ok(path) if path.is_file() => match remove_counted(&path) {
                        Ok(size) => {
                            info!("Removed '{}' ({size} bytes)", path.display());
                            report.files_deleted += 1;
                            report.bytes_freed += size;
                            report.deleted_paths.push(path.display().to_string());
                        }
                        Err(e) => report.errors.push(format!("{e:#}")),
                    },
                    Ok(_) => {}
                    Err(e) => report
                        .errors
                        .push(format!("Failed to read matched path: {e}")),
                }
            }
        }
    }

    report
}

fn remove_counted(path: &Path) -> Result<u64, Error> {
    let size = path
        .metadata()
        .context(format!("Failed to stat '{}'", path.display()))?
        .len();
    fs::remove_file(path).context(format!("Failed to remove '{}'", path.display()))?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sweep_removes_only_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.bin", "b.swi", "c.rpm", "keep.txt"] {
            std::fs::write(dir.path().join(name), b"payload").unwrap();
        }

        let report = cleanup(
            &[dir.path().to_path_buf()],
            &patterns(&["*.bin", "*.swi", "*.rpm"]),
        );
        assert_eq!(report.files_deleted, 3);
        assert_eq!(report.bytes_freed, 21);
        assert_eq!(report.deleted_paths.len(), 3);
        assert!(report.errors.is_empty());
        assert!(dir.path().join("keep.txt").exists());
        assert!(!dir.path().join("a.bin").exists());
    }

    #[test]
    fn test_second_sweep_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"payload").unwrap();

        let first = cleanup(&[dir.path().to_path_buf()], &patterns(&["*.bin"]));
        assert_eq!(first.files_deleted, 1);

        let second = cleanup(&[dir.path().to_path_buf()], &patterns(&["*.bin"]));
        assert_eq!(second, CleanupReport::default());
    }

    #[test]
    fn test_missing_directory_matches_nothing() {
        let report = cleanup(&[PathBuf::from("/does-not-exist")], &patterns(&["*.bin"]));
        assert_eq!(report, CleanupReport::default());
    }

    #[test]
    fn test_directories_are_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested.bin")).unwrap();

        let report = cleanup(&[dir.path().to_path_buf()], &patterns(&["*.bin"]));
        assert_eq!(report.files_deleted, 0);
        assert!(dir.path().join("nested.bin").exists());
    }
}
