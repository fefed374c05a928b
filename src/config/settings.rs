use crate::{DccError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::network::LinkTimeouts;
use crate::transport::BindingPreference;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub device: DeviceSettings,
    pub network: NetworkSettings,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Address advertised to peers as our `from_ip`.
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub binding: BindingPreference,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// A peer that reads nothing for this long fails the transfer.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub chunk_size: usize,
    /// Scratch directory for `.part` files. OS temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    /// Where the non-interactive chooser places accepted files.
    pub download_dir: Option<PathBuf>,
    #[serde(default)]
    pub cleanup_partial_on_cancel: bool,
    #[serde(default = "default_auto_open")]
    pub auto_open: bool,
}

fn default_auto_open() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_send_timeout() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: DeviceSettings {
                name: gethostname::gethostname().to_string_lossy().to_string(),
            },
            network: NetworkSettings {
                host: "127.0.0.1".to_string(),
                port: 50002,
                binding: BindingPreference::Auto,
                connect_timeout_secs: default_connect_timeout(),
                send_timeout_secs: default_send_timeout(),
            },
            transfer: TransferSettings {
                chunk_size: DEFAULT_CHUNK_SIZE,
                temp_dir: None,
                download_dir: None,
                cleanup_partial_on_cancel: false,
                auto_open: true,
            },
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };

        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| DccError::Config(format!("Failed to read config: {}", e)))?;

            let settings: Settings = toml::from_str(&content)
                .map_err(|e| DccError::Config(format!("Failed to parse config: {}", e)))?;

            settings.validate()?;
            Ok(settings)
        } else {
            let settings = Self::default();
            settings.save(Some(&path))?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DccError::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| DccError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&path, content)
            .map_err(|e| DccError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(DccError::Config("transfer.chunk_size must be > 0".to_string()));
        }
        if self.network.host.trim().is_empty() {
            return Err(DccError::Config("network.host must not be empty".to_string()));
        }
        if self.network.connect_timeout_secs == 0 || self.network.send_timeout_secs == 0 {
            return Err(DccError::Config("network timeouts must be > 0".to_string()));
        }
        Ok(())
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "dcc", "transfer")
            .ok_or_else(|| DccError::Config("Failed to get project directories".to_string()))?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn get_bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.network.port))
    }

    pub fn link_timeouts(&self) -> LinkTimeouts {
        LinkTimeouts {
            connect: Duration::from_secs(self.network.connect_timeout_secs),
            write: Duration::from_secs(self.network.send_timeout_secs),
        }
    }

    /// Scratch directory for in-flight receives.
    pub fn scratch_dir(&self) -> PathBuf {
        self.transfer
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
