use std::path::Path;

use anyhow::{Context, Error};
use nix::sys::statvfs::statvfs;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Filesystem capacity figures in megabytes. `free_mb` is the space available
/// to unprivileged users, matching the semantics of `df`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpaceInfo {
    pub total_mb: u64,
    pub free_mb: u64,
    pub used_mb: u64,
}

/// Queries the filesystem containing `path`.
pub fn query(path: impl AsRef<Path>) -> Result<DiskSpaceInfo, Error> {
    let stat = statvfs(path.as_ref()).context(format!(
        "Failed to stat filesystem at '{}'",
        path.as_ref().display()
    ))?;

    let fragment = stat.fragment_size() as u64;
    let total_mb = stat.blocks() as u64 * fragment / BYTES_PER_MB;
    let free_mb = stat.blocks_available() as u64 * fragment / BYTES_PER_MB;

    Ok(DiskSpaceInfo {
        total_mb,
        free_mb,
        used_mb: total_mb.saturating_sub(free_mb),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_tmp() {
        let info = query("/tmp").unwrap();
        assert!(info.total_mb > 0);
        assert!(info.free_mb <= info.total_mb);
        assert_eq!(info.used_mb, info.total_mb - info.free_mb);
    }

    #[test]
    fn test_query_missing_path() {
        assert!(query("/does-not-exist").is_err());
    }
}
