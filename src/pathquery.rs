//! Structured-path disk-space queries, the contract the adjacent monitoring
//! service consumes: `/sonic/system/filesystem[path=<P>]/disk-space` resolves
//! to the probe's figures as JSON.

use std::path::Path;

use regex::Regex;
use serde_json::{json, Value};

use hostutils::{df, hostpath};

const FILESYSTEM_SUBTREE: &str = "/sonic/system/filesystem";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unknown path '{0}'")]
    NotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
}

/// Answers a structured path query. The configured prefix is applied to the
/// embedded filesystem path before probing.
pub fn query(prefix: &Path, path: &str) -> Result<Value, QueryError> {
    if !path.starts_with(FILESYSTEM_SUBTREE) {
        return Err(QueryError::NotFound(path.to_string()));
    }

    let with_key = Regex::new(r"^/sonic/system/filesystem\[path=([^\]]+)\](.*)$").unwrap();
    let Some(captures) = with_key.captures(path) else {
        return Err(QueryError::InvalidArgument(
            "filesystem queries require a [path=<P>] key".to_string(),
        ));
    };

    let target = &captures[1];
    let resolved = hostpath::resolve(prefix, target);
    let leaf = &captures[2];

    let info = match leaf {
        "/disk-space" | "/disk-space/total-mb" | "/disk-space/available-mb" => df::query(&resolved)
            .map_err(|e| QueryError::NotFound(format!("{target}: {e:#}")))?,
        _ => return Err(QueryError::NotFound(path.to_string())),
    };

    Ok(match leaf {
        "/disk-space/total-mb" => json!(info.total_mb),
        "/disk-space/available-mb" => json!(info.free_mb),
        _ => json!({
            "total-mb": info.total_mb,
            "available-mb": info.free_mb,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_space_object() {
        let value = query(Path::new(""), "/sonic/system/filesystem[path=/tmp]/disk-space").unwrap();
        let total = value["total-mb"].as_u64().unwrap();
        let available = value["available-mb"].as_u64().unwrap();
        assert!(available <= total);
    }

    #[test]
    fn test_scalar_leaves() {
        let total = query(
            Path::new(""),
            "/sonic/system/filesystem[path=/tmp]/disk-space/total-mb",
        )
        .unwrap();
        assert!(total.is_u64());

        let available = query(
            Path::new(""),
            "/sonic/system/filesystem[path=/tmp]/disk-space/available-mb",
        )
        .unwrap();
        assert!(available.is_u64());
    }

    #[test]
    fn test_unknown_subtree() {
        assert_eq!(
            query(Path::new(""), "/sonic/system/memory"),
            Err(QueryError::NotFound("/sonic/system/memory".to_string()))
        );
        assert!(matches!(
            query(
                Path::new(""),
                "/sonic/system/filesystem[path=/tmp]/inode-count"
            ),
            Err(QueryError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_key() {
        assert!(matches!(
            query(Path::new(""), "/sonic/system/filesystem/disk-space"),
            Err(QueryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unqueryable_path() {
        assert!(matches!(
            query(
                Path::new(""),
                "/sonic/system/filesystem[path=/does-not-exist]/disk-space"
            ),
            Err(QueryError::NotFound(_))
        ));
    }

    #[test]
    fn test_prefix_applied() {
        // With a bogus prefix, even /tmp stops resolving.
        assert!(matches!(
            query(
                Path::new("/does-not-exist"),
                "/sonic/system/filesystem[path=/tmp]/disk-space"
            ),
            Err(QueryError::NotFound(_))
        ));
    }
}
