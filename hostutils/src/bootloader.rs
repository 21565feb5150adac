use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Error};
use strum_macros::IntoStaticStr;

use upgrade_api::{IMAGE_DIR_PREFIX, IMAGE_NAME_PREFIX};

use crate::hostpath::HostPaths;

/// The bootloader families a switch can run. Detection tries GRUB first,
/// then Aboot; the set is closed.
#[derive(Debug, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Bootloader {
    Grub(GrubBootloader),
    Aboot(AbootBootloader),
}

impl Bootloader {
    pub fn detect(paths: &HostPaths) -> Result<Self, Error> {
        let grub = GrubBootloader::new(paths);
        if grub.detect() {
            return Ok(Self::Grub(grub));
        }
        let aboot = AbootBootloader::new(paths);
        if aboot.detect() {
            return Ok(Self::Aboot(aboot));
        }
        bail!(
            "No supported bootloader detected under '{}'",
            paths.host_root.display()
        );
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Names of all installed images, `SONiC-OS-<raw>` form.
    pub fn installed(&self) -> Result<Vec<String>, Error> {
        match self {
            Self::Grub(grub) => grub.installed(),
            Self::Aboot(aboot) => aboot.installed(),
        }
    }

    /// The image the host is currently running.
    pub fn current(&self) -> Result<String, Error> {
        match self {
            Self::Grub(grub) => grub.current(),
            Self::Aboot(aboot) => aboot.current(),
        }
    }

    /// The image the host will boot next.
    pub fn next(&self) -> Result<String, Error> {
        match self {
            Self::Grub(grub) => grub.next(),
            Self::Aboot(aboot) => aboot.next(),
        }
    }
}

/// Extracts the running image name from a kernel command line: the substring
/// starting at the image name prefix, up to the next whitespace.
fn image_from_cmdline(cmdline: &str) -> Option<String> {
    let start = cmdline.find(IMAGE_NAME_PREFIX)?;
    let rest = &cmdline[start..];
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// Title of a `menuentry` line, i.e. the first single- or double-quoted
/// string after the keyword.
fn menuentry_title(line: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix("menuentry")?;
    let quote_pos = rest.find(|c| c == '\'' || c == '"')?;
    let quote = rest.as_bytes()[quote_pos] as char;
    let title = &rest[quote_pos + 1..];
    let end = title.find(quote)?;
    Some(title[..end].to_string())
}

#[derive(Debug)]
pub struct GrubBootloader {
    grub_cfg: PathBuf,
    grub_env: PathBuf,
    proc_cmdline: PathBuf,
}

impl GrubBootloader {
    pub fn new(paths: &HostPaths) -> Self {
        Self {
            grub_cfg: paths.grub_dir.join("grub.cfg"),
            grub_env: paths.grub_env.clone(),
            proc_cmdline: paths.proc_cmdline.clone(),
        }
    }

    pub fn detect(&self) -> bool {
        self.grub_cfg.is_file()
    }

    fn read_config(&self) -> Result<String, Error> {
        fs::read_to_string(&self.grub_cfg)
            .context(format!("Failed to read '{}'", self.grub_cfg.display()))
    }

    /// All menuentry titles in config order, unfiltered. `set default=N`
    /// indexes into this list.
    fn all_titles(contents: &str) -> Vec<String> {
        contents.lines().filter_map(menuentry_title).collect()
    }

    pub fn installed(&self) -> Result<Vec<String>, Error> {
        Ok(Self::all_titles(&self.read_config()?)
            .into_iter()
            .filter(|title| title.contains(IMAGE_NAME_PREFIX))
            .collect())
    }

    pub fn current(&self) -> Result<String, Error> {
        let cmdline = fs::read_to_string(&self.proc_cmdline)
            .context(format!("Failed to read '{}'", self.proc_cmdline.display()))?;
        if let Some(image) = image_from_cmdline(&cmdline) {
            return Ok(image);
        }
        self.installed()?
            .into_iter()
            .next()
            .context("No installed images found")
    }

    pub fn next(&self) -> Result<String, Error> {
        // The grub environment block wins when it names an image.
        if let Ok(env) = fs::read_to_string(&self.grub_env) {
            let entry = env.lines().find_map(|line| {
                let (key, value) = line.split_once('=')?;
                matches!(key.trim(), "saved_entry" | "next_entry").then(|| value.trim())
            });
            if let Some(value) = entry {
                if value.contains(IMAGE_NAME_PREFIX) {
                    return Ok(value.to_string());
                }
            }
        }

        let contents = self.read_config()?;
        let titles = Self::all_titles(&contents);

        let default_index = contents.lines().find_map(|line| {
            line.trim()
                .strip_prefix("set default=")?
                .trim()
                .parse::<usize>()
                .ok()
        });
        if let Some(title) = default_index.and_then(|n| titles.get(n)) {
            return Ok(title.clone());
        }

        titles
            .into_iter()
            .find(|title| title.contains(IMAGE_NAME_PREFIX))
            .context("No installed images found")
    }
}

#[derive(Debug)]
pub struct AbootBootloader {
    host_root: PathBuf,
    boot_config: PathBuf,
    proc_cmdline: PathBuf,
}

impl AbootBootloader {
    pub fn new(paths: &HostPaths) -> Self {
        Self {
            host_root: paths.host_root.clone(),
            boot_config: paths.boot_config.clone(),
            proc_cmdline: paths.proc_cmdline.clone(),
        }
    }

    pub fn detect(&self) -> bool {
        self.boot_config.exists()
            || self.host_root.join(".aboot").exists()
            || !self.image_dirs().is_empty()
    }

    /// Raw version names of `image-*` payload directories on the host root.
    fn image_dirs(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.host_root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                if !entry.file_type().ok()?.is_dir() {
                    return None;
                }
                entry
                    .file_name()
                    .to_str()?
                    .strip_prefix(IMAGE_DIR_PREFIX)
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }

    pub fn installed(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .image_dirs()
            .into_iter()
            .map(|raw| format!("{IMAGE_NAME_PREFIX}{raw}"))
            .collect())
    }

    pub fn current(&self) -> Result<String, Error> {
        let cmdline = fs::read_to_string(&self.proc_cmdline)
            .context(format!("Failed to read '{}'", self.proc_cmdline.display()))?;
        if let Some(image) = image_from_cmdline(&cmdline) {
            return Ok(image);
        }
        self.installed()?
            .into_iter()
            .next()
            .context("No installed images found")
    }

    pub fn next(&self) -> Result<String, Error> {
        if let Ok(contents) = fs::read_to_string(&self.boot_config) {
            for line in contents.lines() {
                if let Some(start) = line.find(IMAGE_NAME_PREFIX) {
                    let rest = &line[start..];
                    let end = rest
                        .find(|c: char| {
                            c.is_whitespace() || c == '"' || c == '\'' || c == '/'
                        })
                        .unwrap_or(rest.len());
                    return Ok(rest[..end].to_string());
                }
            }
        }
        self.current()
    }
}
