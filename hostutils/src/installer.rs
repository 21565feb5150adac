use anyhow::{Context, Error};
use log::{debug, info};

use upgrade_api::IMAGE_NAME_PREFIX;

use crate::dependencies::{Dependency, HostCommand};

/// Arguments placing the tool in the host's namespaces, with container PID 1
/// as the reference process.
const NSENTER_ARGS: &[&str] = &[
    "--target", "1", "--mount", "--net", "--pid", "--uts", "--ipc", "--user", "--",
];

const CLEANUP_REMOVED_MARKER: &str = "Removing image ";

/// One installed image as reported by the installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledImage {
    pub name: String,
    pub current: bool,
    pub next: bool,
}

/// Aggregate view of the installer's `list` output.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstalledImages {
    pub images: Vec<InstalledImage>,
    pub current: Option<String>,
    pub next: Option<String>,
}

impl InstalledImages {
    pub fn names(&self) -> Vec<String> {
        self.images.iter().map(|i| i.name.clone()).collect()
    }
}

/// Bridge to the host-side `sonic-installer` tool, entered through the
/// namespace helper. This is the authoritative mutator for image state.
#[derive(Debug, Default, Clone)]
pub struct SonicInstaller;

impl SonicInstaller {
    pub fn new() -> Self {
        Self
    }

    fn host_cmd(&self, args: &[&str]) -> HostCommand {
        Dependency::Nsenter
            .cmd()
            .args(NSENTER_ARGS)
            .arg(Dependency::SonicInstaller.name())
            .args(args)
    }

    /// Lists installed images with their current/next markers.
    pub fn list(&self) -> Result<InstalledImages, Error> {
        let stdout = self
            .host_cmd(&["list"])
            .output_and_check()
            .context("Failed to list installed images")?;
        let images = parse_list_output(&stdout);
        debug!(
            "Installer reports {} installed image(s), current: {:?}, next: {:?}",
            images.images.len(),
            images.current,
            images.next
        );
        Ok(images)
    }

    /// Makes `image` the default boot target.
    pub fn set_default(&self, image: &str) -> Result<(), Error> {
        info!("Setting default image to '{image}'");
        self.host_cmd(&["set-default", image])
            .run_and_check()
            .context(format!("Failed to set default image to '{image}'"))
    }

    /// Removes all images but current and next, returning the names the tool
    /// reported as removed.
    pub fn cleanup(&self) -> Result<Vec<String>, Error> {
        info!("Removing unused images");
        let stdout = self
            .host_cmd(&["cleanup", "-y"])
            .output_and_check()
            .context("Failed to remove unused images")?;
        Ok(parse_cleanup_output(&stdout))
    }
}

fn parse_list_output(stdout: &str) -> InstalledImages {
    let mut result = InstalledImages::default();

    for line in stdout.lines() {
        let line = line.trim();

        // Aggregate header lines some installer builds emit.
        for (header, slot) in [
            ("Current:", &mut result.current),
            ("Next:", &mut result.next),
        ] {
            if let Some(value) = line.strip_prefix(header) {
                let value = value.trim();
                if value.starts_with(IMAGE_NAME_PREFIX) && slot.is_none() {
                    *slot = Some(value.to_string());
                }
            }
        }

        if !line.starts_with(IMAGE_NAME_PREFIX) {
            continue;
        }
        let name = line.split_whitespace().next().unwrap_or(line).to_string();
        let image = InstalledImage {
            current: line.contains("(Current)"),
            next: line.contains("(Next)"),
            name,
        };
        if image.current && result.current.is_none() {
            result.current = Some(image.name.clone());
        }
        if image.next && result.next.is_none() {
            result.next = Some(image.name.clone());
        }
        result.images.push(image);
    }

    result
}

fn parse_cleanup_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(CLEANUP_REMOVED_MARKER))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
