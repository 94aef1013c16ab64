//! Persisted launcher defaults.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/fleetrun/config.toml)
//! 3. Built-in defaults (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use fleetrun_core::devices::DeviceKind;
use fleetrun_core::{DistributedMode, LaunchConfig};
use serde::{Deserialize, Serialize};

/// Defaults stored in TOML format. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Log filter used when neither `--log-level` nor `RUST_LOG` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributed_mode: Option<DistributedMode>,

    /// Directory for per-process logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Program that runs training scripts, e.g. `python3 -u`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    /// First port of deterministically allocated endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_port: Option<u16>,

    /// Comma-separated node IPs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<String>,

    /// Comma-separated device ids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpus: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heter_worker_device: Option<DeviceKind>,
}

impl FileConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fleetrun").join("config.toml"))
    }

    /// Load configuration from the default path. A missing file yields the
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &FileConfig) {
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
        if other.distributed_mode.is_some() {
            self.distributed_mode = other.distributed_mode;
        }
        if other.log_dir.is_some() {
            self.log_dir = other.log_dir.clone();
        }
        if other.interpreter.is_some() {
            self.interpreter = other.interpreter.clone();
        }
        if other.start_port.is_some() {
            self.start_port = other.start_port;
        }
        if other.ips.is_some() {
            self.ips = other.ips.clone();
        }
        if other.gpus.is_some() {
            self.gpus = other.gpus.clone();
        }
        if other.heter_worker_device.is_some() {
            self.heter_worker_device = other.heter_worker_device;
        }
    }

    /// Copy every value that is set onto `config`.
    pub fn apply_to(&self, config: &mut LaunchConfig) {
        if let Some(mode) = self.distributed_mode {
            config.mode = mode;
        }
        if self.log_dir.is_some() {
            config.log_dir = self.log_dir.clone();
        }
        if self.interpreter.is_some() {
            config.interpreter = self.interpreter.clone();
        }
        if self.start_port.is_some() {
            config.start_port = self.start_port;
        }
        if self.ips.is_some() {
            config.ips = self.ips.clone();
        }
        if self.gpus.is_some() {
            config.gpus = self.gpus.clone();
        }
        if let Some(device) = self.heter_worker_device {
            config.heter_worker_device = device;
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no config directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fleetrun").join("config.toml");

        let config = FileConfig {
            interpreter: Some("python3 -u".to_string()),
            start_port: Some(7000),
            distributed_mode: Some(DistributedMode::PsHeter),
            heter_worker_device: Some(DeviceKind::Xpu),
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = FileConfig::load_from(&path).unwrap();

        assert_eq!(loaded, config);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("distributed_mode = \"ps_heter\""));
        assert!(!text.contains("log_dir"));
    }

    #[test]
    fn merge_prefers_other() {
        let mut base = FileConfig {
            interpreter: Some("python3".to_string()),
            start_port: Some(6000),
            ..Default::default()
        };

        let cli = FileConfig {
            start_port: Some(7000),
            gpus: Some("0,1".to_string()),
            ..Default::default()
        };

        base.merge(&cli);

        assert_eq!(base.interpreter.as_deref(), Some("python3"));
        assert_eq!(base.start_port, Some(7000));
        assert_eq!(base.gpus.as_deref(), Some("0,1"));
    }

    #[test]
    fn apply_leaves_unset_fields_alone() {
        let mut config = LaunchConfig::new("train.py");
        config.gpus = Some("3".into());

        FileConfig {
            log_dir: Some(PathBuf::from("/var/log/job")),
            ..Default::default()
        }
        .apply_to(&mut config);

        assert_eq!(config.gpus.as_deref(), Some("3"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/job")));
        assert_eq!(config.mode, DistributedMode::Unset);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "start_port = \"not a port\"").unwrap();

        assert!(matches!(
            FileConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
