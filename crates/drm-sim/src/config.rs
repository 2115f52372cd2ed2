//! Simulator configuration
//!
//! One TOML file holds the request manager configuration under `[drm]`
//! plus one `[[ecus]]` entry per simulated ECU. ECUs are attached to
//! physical connections by connection name.

use std::path::{Path, PathBuf};

use drm_core::{ConfigError, DrmConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Drm(#[from] ConfigError),

    #[error("ECU '{0}' refers to no physical connection")]
    UnknownConnection(String),

    #[error("ECU '{connection}': invalid data hex: {source}")]
    InvalidData {
        connection: String,
        source: hex::FromHexError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// File holding the persisted discovery table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// Stop after this many ticks even if the scenario is not done
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u64,

    pub drm: DrmConfig,

    #[serde(default)]
    pub ecus: Vec<EcuConfig>,
}

fn default_max_ticks() -> u64 {
    3000
}

/// A simulated ECU answering on one physical connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    /// Name of the physical connection the ECU sits behind
    pub connection: String,

    #[serde(default)]
    pub behaviour: Behaviour,

    /// Delay between request and (each) response frame
    #[serde(default = "default_response_delay_ms")]
    pub response_delay_ms: u64,

    /// Hex bytes appended to positive responses (e.g. a VIN)
    #[serde(default)]
    pub data: String,
}

fn default_response_delay_ms() -> u64 {
    20
}

/// How a simulated ECU answers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behaviour {
    /// Positive response
    #[default]
    Respond,
    /// `count` response-pending frames, then a positive response
    Pending { count: u8 },
    /// Negative response with the given NRC
    Negative { nrc: u8 },
    /// No response at all
    Silent,
}

impl SimConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SimConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SimConfigError> {
        self.drm.validate()?;
        for ecu in &self.ecus {
            let attached = self
                .drm
                .connections
                .iter()
                .any(|c| c.name == ecu.connection && !c.functional && c.rx_pdu.is_some());
            if !attached {
                return Err(SimConfigError::UnknownConnection(ecu.connection.clone()));
            }
            hex::decode(&ecu.data).map_err(|source| SimConfigError::InvalidData {
                connection: ecu.connection.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
