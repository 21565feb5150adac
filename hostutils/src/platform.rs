use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Error};
use strum_macros::IntoStaticStr;

/// Switch vendors the service recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Vendor {
    Mellanox,
    Arista,
    Dell,
    Cisco,
    Nokia,
    Celestica,
    Kvm,
    Unknown,
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

/// Model substrings mapped to canonical platform tags.
const MODEL_TAGS: &[(&str, &str)] = &[
    ("sn2700", "mellanox-sn2700"),
    ("sn3800", "mellanox-sn3800"),
    ("sn4600", "mellanox-sn4600"),
    ("7050", "arista-7050"),
    ("7060", "arista-7060"),
    ("7260", "arista-7260"),
    ("s6000", "dell-s6000"),
    ("s6100", "dell-s6100"),
    ("8101", "cisco-8101"),
    ("8102", "cisco-8102"),
    ("8111", "cisco-8111"),
    ("7215", "nokia-7215"),
    ("e1031", "celestica-e1031"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub vendor: Vendor,
    /// Platform string as declared by the install environment.
    pub platform: String,
    pub machine: String,
    pub asic: String,
    /// Canonical platform tag, or "unknown".
    pub identifier: String,
}

/// Reads the host machine descriptor and derives the vendor and canonical
/// platform tag.
pub fn identify(machine_conf: &Path) -> Result<PlatformInfo, Error> {
    let contents = fs::read_to_string(machine_conf).context(format!(
        "Failed to read machine descriptor '{}'",
        machine_conf.display()
    ))?;
    Ok(from_descriptor(&parse_descriptor(&contents)))
}

/// Parses a `key=value` descriptor. Comments and blank lines are skipped;
/// whitespace around keys and values is trimmed.
fn parse_descriptor(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn from_descriptor(fields: &HashMap<String, String>) -> PlatformInfo {
    let get = |key: &str| fields.get(key).cloned().unwrap_or_default();

    let onie_platform = get("onie_platform");
    let machine = match get("onie_machine") {
        m if m.is_empty() => get("aboot_machine"),
        m => m,
    };
    let asic = get("onie_switch_asic");
    let platform = match onie_platform {
        p if p.is_empty() => get("aboot_platform"),
        p => p,
    };

    // First matching rule wins.
    let vendor = if asic == "mlnx" {
        Vendor::Mellanox
    } else if get("aboot_vendor") == "arista" {
        Vendor::Arista
    } else if platform.contains("kvm") || machine.contains("kvm") || asic == "qemu" {
        Vendor::Kvm
    } else {
        infer_vendor(&platform)
    };

    let identifier = canonical_identifier(vendor, &platform);

    PlatformInfo {
        vendor,
        platform,
        machine,
        asic,
        identifier,
    }
}

fn infer_vendor(platform: &str) -> Vendor {
    let platform = platform.to_ascii_lowercase();
    if platform.contains("mlnx") || platform.contains("mellanox") {
        Vendor::Mellanox
    } else if platform.contains("arista") {
        Vendor::Arista
    } else if platform.contains("dell") {
        Vendor::Dell
    } else if platform.contains("cisco") || platform.contains("8101") || platform.contains("8102") || platform.contains("8111") {
        Vendor::Cisco
    } else if platform.contains("nokia") {
        Vendor::Nokia
    } else if platform.contains("celestica") || platform.contains("cel_") {
        Vendor::Celestica
    } else {
        Vendor::Unknown
    }
}

fn canonical_identifier(vendor: Vendor, platform: &str) -> String {
    if vendor == Vendor::Kvm {
        return platform.to_string();
    }
    if vendor == Vendor::Unknown {
        return "unknown".to_string();
    }
    let platform = platform.to_ascii_lowercase();
    MODEL_TAGS
        .iter()
        .find(|(model, _)| platform.contains(model))
        .map(|(_, tag)| tag.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
