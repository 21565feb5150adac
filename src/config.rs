pub use upgrade_api::config::{
    ConfigFile, DownloadConfig, FirmwareConfig, ServiceConfig, TlsConfig,
};

use upgrade_api::error::{InitializationError, ReportError, UpgradeError};

/// Loads the configuration file, or the defaults when no path is given.
pub fn load(path: Option<&str>) -> Result<ConfigFile, UpgradeError> {
    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };
    let contents =
        std::fs::read_to_string(path).structured(InitializationError::LoadConfig {
            path: path.to_string(),
        })?;
    serde_yaml::from_str(&contents).structured(InitializationError::ParseConfig)
}
