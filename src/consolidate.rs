//! Consolidation planner: keep the running image, remove the rest.

use std::path::Path;

use anyhow::anyhow;
use log::{debug, info};

use hostutils::installer::SonicInstaller;
use upgrade_api::error::{InternalError, ReportError, ServicingError, UpgradeError};
use upgrade_api::{IMAGE_DIR_PREFIX, IMAGE_NAME_PREFIX};

/// The planner's output; `executed == false` marks a dry-run preview, in
/// which `would_remove` and `bytes_estimated` are estimates only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationPlan {
    pub keeper: String,
    pub would_remove: Vec<String>,
    pub bytes_estimated: u64,
    pub warnings: Vec<String>,
    pub executed: bool,
}

/// Consolidates installed images through the host installer. Picks a keeper,
/// estimates the space behind every other image, and, unless this is a
/// dry-run, makes the keeper the default and removes the rest.
pub fn consolidate(
    installer: &SonicInstaller,
    host_root: &Path,
    dry_run: bool,
) -> Result<ConsolidationPlan, UpgradeError> {
    let listing = installer
        .list()
        .structured(ServicingError::ListInstalledImages)?;

    let mut warnings = Vec::new();
    let keeper = listing
        .images
        .iter()
        .find(|image| image.current)
        .map(|image| image.name.clone())
        .or_else(|| listing.current.clone())
        .or_else(|| {
            listing.images.first().map(|image| {
                warnings.push(
                    "No image is marked current; keeping the first listed image".to_string(),
                );
                image.name.clone()
            })
        })
        .ok_or_else(|| anyhow!("Installer reported no installed images"))
        .structured(ServicingError::ListInstalledImages)?;

    info!("Consolidating images around '{keeper}' (dry_run: {dry_run})");

    if !dry_run {
        installer
            .set_default(&keeper)
            .structured(ServicingError::SetDefaultImage {
                image: keeper.clone(),
            })?;
    }

    // The next-boot image survives too, unless it is the keeper itself.
    let protected_next = listing.next.as_ref().filter(|next| **next != keeper);
    let mut would_remove: Vec<String> = listing
        .images
        .iter()
        .map(|image| image.name.clone())
        .filter(|name| *name != keeper && Some(name) != protected_next)
        .collect();

    let mut bytes_estimated = 0;
    for name in &would_remove {
        let raw = name.strip_prefix(IMAGE_NAME_PREFIX).unwrap_or(name);
        let dir = host_root.join(format!("{IMAGE_DIR_PREFIX}{raw}"));
        let size = dir_size(&dir);
        debug!("'{}' holds {size} bytes", dir.display());
        bytes_estimated += size;
    }

    if !dry_run {
        would_remove = installer
            .cleanup()
            .structured(ServicingError::RemoveUnusedImages)?;
    }

    Ok(ConsolidationPlan {
        keeper,
        would_remove,
        bytes_estimated,
        warnings,
        executed: !dry_run,
    })
}

/// Placeholder for the direct bootloader back-end; only the CLI back-end is
/// wired up today.
pub fn consolidate_via_bootloader(
    _bootloader: &hostutils::bootloader::Bootloader,
    _dry_run: bool,
) -> Result<ConsolidationPlan, UpgradeError> {
    Err(UpgradeError::new(InternalError::Internal(
        "bootloader-backed consolidation is not implemented",
    )))
}

/// Recursive byte count of a directory tree, tolerating unreadable entries.
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            total += dir_size(&entry.path());
        } else if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}
