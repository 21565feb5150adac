use std::{fs::File, io::Read, path::Path};

use anyhow::{bail, Context, Error};
use regex::bytes::Regex;
use strum_macros::IntoStaticStr;

use upgrade_api::IMAGE_NAME_PREFIX;

/// ONIE payloads are self-extracting scripts; the version declaration sits in
/// the script header, within the first 1 MiB.
pub const ONIE_SCAN_WINDOW: usize = 1024 * 1024;

/// Header scan reads in 64 KiB chunks and stops early on a match.
pub const ONIE_SCAN_CHUNK: usize = 64 * 1024;

/// Aboot install units are ZIP archives carrying the version in this entry.
const ABOOT_VERSION_ENTRY: &str = ".imagehash";

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

// Bare assignments without quotes are not version declarations.
const ONIE_VERSION_PATTERN: &str = r#"image_version="([^"]*)""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ImageType {
    Onie,
    Aboot,
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

/// Version extracted from an image file. `full` is always the installable
/// image name, `SONiC-OS-<raw>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageVersion {
    pub raw: String,
    pub full: String,
    pub image_type: ImageType,
}

impl ImageVersion {
    pub fn new(raw: impl Into<String>, image_type: ImageType) -> Self {
        let raw = raw.into();
        Self {
            full: format!("{IMAGE_NAME_PREFIX}{raw}"),
            raw,
            image_type,
        }
    }
}

/// Detects the container format of `path` and extracts its version string.
pub fn extract_version(path: &Path) -> Result<ImageVersion, Error> {
    let image_type = detect_type(path)?;
    let raw = match image_type {
        ImageType::Onie => onie_version(path)?,
        ImageType::Aboot => aboot_version(path)?,
    };
    if raw.is_empty() {
        bail!("Empty version extracted from '{}'", path.display());
    }
    Ok(ImageVersion::new(raw, image_type))
}

/// File suffix decides the format; unsuffixed files are sniffed by magic
/// bytes, where a ZIP signature implies Aboot.
fn detect_type(path: &Path) -> Result<ImageType, Error> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("swi") => return Ok(ImageType::Aboot),
        Some("bin") => return Ok(ImageType::Onie),
        _ => {}
    }

    let mut file = File::open(path).context(format!("Failed to open '{}'", path.display()))?;
    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < magic.len() {
        let n = file
            .read(&mut magic[read..])
            .context(format!("Failed to read '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        read += n;
    }

    if read == magic.len() && magic == ZIP_MAGIC {
        Ok(ImageType::Aboot)
    } else {
        Ok(ImageType::Onie)
    }
}

fn onie_version(path: &Path) -> Result<String, Error> {
    let mut file = File::open(path).context(format!("Failed to open '{}'", path.display()))?;
    let re = Regex::new(ONIE_VERSION_PATTERN)?;

    let mut buffer = Vec::with_capacity(ONIE_SCAN_CHUNK);
    let mut chunk = vec![0u8; ONIE_SCAN_CHUNK];
    loop {
        let n = file
            .read(&mut chunk)
            .context(format!("Failed to read '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        let take = n.min(ONIE_SCAN_WINDOW - buffer.len());
        buffer.extend_from_slice(&chunk[..take]);

        if let Some(captures) = re.captures(&buffer) {
            return Ok(String::from_utf8_lossy(&captures[1]).into_owned());
        }
        if buffer.len() >= ONIE_SCAN_WINDOW {
            break;
        }
    }

    bail!(
        "No image_version declaration found in the first {} bytes of '{}'",
        ONIE_SCAN_WINDOW,
        path.display()
    );
}

fn aboot_version(path: &Path) -> Result<String, Error> {
    let file = File::open(path).context(format!("Failed to open '{}'", path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context(format!(
        "'{}' is not a readable ZIP archive",
        path.display()
    ))?;
    let mut entry = archive.by_name(ABOOT_VERSION_ENTRY).context(format!(
        "'{}' has no {} entry",
        path.display(),
        ABOOT_VERSION_ENTRY
    ))?;

    let mut contents = String::new();
    entry.read_to_string(&mut contents).context(format!(
        "Failed to read {} from '{}'",
        ABOOT_VERSION_ENTRY,
        path.display()
    ))?;
    Ok(contents.trim().to_string())
}
