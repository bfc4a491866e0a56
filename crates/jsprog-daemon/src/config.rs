//! Daemon configuration loaded from TOML.

use std::path::{Path, PathBuf};

use jsprog_input::OutputIdentity;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DaemonError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Device discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory watched for joystick device nodes.
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            device_dir: default_device_dir(),
        }
    }
}

/// Identity of the synthetic output device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_name")]
    pub name: String,
    #[serde(default = "default_output_vendor")]
    pub vendor: u16,
    #[serde(default = "default_output_product")]
    pub product: u16,
    #[serde(default = "default_output_version")]
    pub version: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: default_output_name(),
            vendor: default_output_vendor(),
            product: default_output_product(),
            version: default_output_version(),
        }
    }
}

impl OutputConfig {
    pub fn identity(&self) -> OutputIdentity {
        OutputIdentity {
            name: self.name.clone(),
            vendor: self.vendor,
            product: self.product,
            version: self.version,
        }
    }
}

/// Load configuration from the given path, or the default location.
/// A missing file yields the defaults.
pub fn load(path: Option<&Path>) -> Result<Config, DaemonError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path(),
    };

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| DaemonError::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("failed to parse config: {e}")))?;
        info!(path = %config_path.display(), "loaded config");
        Ok(config)
    } else {
        info!("no config file found, using defaults");
        Ok(Config::default())
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("jsprog")
        .join("config.toml")
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev/input")
}

fn default_output_name() -> String {
    "JSProg keyboard & mouse".to_string()
}

fn default_output_vendor() -> u16 {
    0x5649
}

fn default_output_product() -> u16 {
    0x4a50
}

fn default_output_version() -> u16 {
    1
}
