//! Persisted form of declared devices
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::device::{Device, DeviceKind};
use crate::mode::Mode;

/// Declared device as stored in the owner's configuration. Inherited devices
/// are never stored, they are derived from parent groups on load.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub major: String,
    pub minor: String,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub inheritable: bool,
}

/// Device as presented to clients
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub major: String,
    pub minor: String,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub inherited: bool,
    pub inheritable: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to open device config file {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse device config file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize device config for {path:?}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write device config file {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Device list of one owner, stored as JSON
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicesConfig {
    pub devices: Vec<DeviceConfig>,
}

impl DevicesConfig {
    pub fn new(devices: Vec<DeviceConfig>) -> Self {
        Self { devices }
    }

    pub fn to_devices(&self) -> Vec<Device> {
        self.devices.iter().map(Device::load).collect()
    }

    #[instrument(level = "trace", skip(self))]
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| {
                tracing::error!(?path, %err, "failed to open device config file");
                ConfigError::Open {
                    path: path.to_owned(),
                    source: err,
                }
            })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|err| {
            tracing::error!(?path, %err, "failed to serialize device config");
            ConfigError::Serialize {
                path: path.to_owned(),
                source: err,
            }
        })?;
        writer.flush().map_err(|err| {
            tracing::error!(?path, %err, "failed to write device config file");
            ConfigError::Write {
                path: path.to_owned(),
                source: err,
            }
        })?;

        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            tracing::error!(?path, %err, "failed to open device config file");
            ConfigError::Open {
                path: path.to_owned(),
                source: err,
            }
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            tracing::error!(?path, %err, "failed to parse device config file");
            ConfigError::Parse {
                path: path.to_owned(),
                source: err,
            }
        })
    }
}
