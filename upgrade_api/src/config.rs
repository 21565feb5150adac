use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default TCP port for the RPC listener.
pub const DEFAULT_LISTEN_PORT: u16 = 50051;

/// Default prefix under which the host root filesystem is mounted when the
/// service runs inside a container. Empty or "/" means bare-metal.
pub const DEFAULT_PATH_PREFIX: &str = "/mnt/host";

/// Top-level configuration file. All fields are optional in YAML; absent
/// sections take the defaults below.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

/// Listener and host-mediation settings. Immutable after startup; a value of
/// this type is passed explicitly to every component that needs it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Address to bind the RPC listener to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Prefix under which host-absolute paths are visible to the service.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: PathBuf,

    /// TLS is enabled when this section is present. Missing credential files
    /// prevent service start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Upper bound on connection drain during shutdown, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: None,
            path_prefix: default_path_prefix(),
            tls: None,
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn listen_port(&self) -> u16 {
        self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Where firmware files live on the host and what the cleanup sweep removes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FirmwareConfig {
    /// Host-absolute directories scanned for firmware images. Resolved
    /// through the path prefix.
    #[serde(default = "default_search_dirs")]
    pub search_dirs: Vec<PathBuf>,

    /// Destination directory for downloads when the caller does not name an
    /// output path.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Shell-style glob patterns removed by the cleanup sweep.
    #[serde(default = "default_cleanup_patterns")]
    pub cleanup_patterns: Vec<String>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            search_dirs: default_search_dirs(),
            download_dir: default_download_dir(),
            cleanup_patterns: default_cleanup_patterns(),
        }
    }
}

/// Download engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DownloadConfig {
    /// Interface the strategy ladder binds to first.
    #[serde(default = "default_interface")]
    pub preferred_interface: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_total_timeout")]
    pub total_timeout_seconds: u64,

    /// Upper bound on attempts across all rungs of the ladder.
    #[serde(default = "default_max_fallback_attempts")]
    pub max_fallback_attempts: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            preferred_interface: default_interface(),
            connect_timeout_seconds: default_connect_timeout(),
            total_timeout_seconds: default_total_timeout(),
            max_fallback_attempts: default_max_fallback_attempts(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".into()
}

fn default_path_prefix() -> PathBuf {
    DEFAULT_PATH_PREFIX.into()
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_search_dirs() -> Vec<PathBuf> {
    vec!["/host".into(), "/tmp/firmware".into()]
}

fn default_download_dir() -> PathBuf {
    "/tmp/firmware".into()
}

fn default_cleanup_patterns() -> Vec<String> {
    vec!["*.bin".into(), "*.swi".into(), "*.rpm".into()]
}

fn default_interface() -> String {
    "eth0".into()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_total_timeout() -> u64 {
    3600
}

fn default_max_fallback_attempts() -> u32 {
    10
}

fn default_user_agent() -> String {
    concat!("sonic-upgraded/", env!("CARGO_PKG_VERSION")).into()
}
