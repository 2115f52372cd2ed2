//! Request manager configuration
//!
//! Configuration is loaded from TOML and validated once at construction.
//! Millisecond values are converted into driver ticks at that point so the
//! timer engine only ever counts ticks.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::firewall::ServiceMask;
use crate::types::{ConnectionId, PduId};
use crate::uds::NEGATIVE_RESPONSE_LEN;

/// Largest addressing metadata a dynamic connection may carry
pub const MAX_METADATA_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level request manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrmConfig {
    /// Period of the driver tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Channels shared by application requests
    #[serde(default = "default_application_channels")]
    pub application_channels: usize,
    /// Enforce per-connection service access control
    #[serde(default)]
    pub firewall: bool,
    /// Forward response-pending events to the submitter
    #[serde(default = "default_true")]
    pub forward_response_pending: bool,
    /// Notify the submitter when the request left the transport
    #[serde(default)]
    pub notify_transmission_complete: bool,
    /// Reserve channels for functional requests
    #[serde(default = "default_true")]
    pub functional_requests: bool,
    /// Reserve a channel for ECU discovery
    #[serde(default = "default_true")]
    pub discovery: bool,
    /// Number of functional response buffers
    #[serde(default = "default_functional_buffers")]
    pub functional_buffers: usize,
    /// Payload capacity of each functional response buffer
    #[serde(default = "default_functional_buffer_size")]
    pub functional_buffer_size: usize,
    /// Request delay scheme for physical connections
    #[serde(default)]
    pub delay: RequestDelay,
    /// Delay between consecutive requests on a functional connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functional_delay_ms: Option<u64>,
    /// Connection table; the list index is the connection id
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

fn default_tick_ms() -> u64 {
    10
}

fn default_application_channels() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_functional_buffers() -> usize {
    4
}

fn default_functional_buffer_size() -> usize {
    64
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            application_channels: default_application_channels(),
            firewall: false,
            forward_response_pending: true,
            notify_transmission_complete: false,
            functional_requests: true,
            discovery: true,
            functional_buffers: default_functional_buffers(),
            functional_buffer_size: default_functional_buffer_size(),
            delay: RequestDelay::None,
            functional_delay_ms: None,
            connections: Vec::new(),
        }
    }
}

/// Request delay scheme.
///
/// Separation time and global delay are alternatives; a configuration can
/// only ever select one of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum RequestDelay {
    /// Requests start on the next tick
    #[default]
    None,
    /// Per-connection minimum gap after a request closes
    SeparationTime,
    /// One shared gap between any two requests, served round-robin
    Global { delay_ms: u64 },
}

/// One addressable diagnostic target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Human-readable name used in logs
    #[serde(default)]
    pub name: String,
    /// Transmit PDU id
    pub tx_pdu: u16,
    /// Receive PDU id (functional connections usually have none)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_pdu: Option<u16>,
    /// P2 response timeout in milliseconds
    #[serde(default = "default_p2_ms")]
    pub p2_ms: u64,
    /// P2* timeout after a response pending, in milliseconds
    #[serde(default = "default_p2_extended_ms")]
    pub p2_extended_ms: u64,
    /// Response pending retries allowed per request (0 disables RCRRP)
    #[serde(default = "default_max_rcrrp")]
    pub max_rcrrp: u8,
    /// Separation time in milliseconds (separation-time scheme only)
    #[serde(default)]
    pub separation_time_ms: u64,
    /// Broadcast target whose responses arrive on physical connections
    #[serde(default)]
    pub functional: bool,
    /// Services permitted by the firewall (all known services when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_services: Option<Vec<u8>>,
    /// Addressing metadata length; non-zero marks a dynamic connection
    #[serde(default)]
    pub metadata_len: usize,
}

fn default_p2_ms() -> u64 {
    50
}

fn default_p2_extended_ms() -> u64 {
    5000
}

fn default_max_rcrrp() -> u8 {
    2
}

impl ConnectionConfig {
    /// Physical connection with default timing
    pub fn physical(name: &str, tx_pdu: u16, rx_pdu: u16) -> Self {
        Self {
            name: name.to_string(),
            tx_pdu,
            rx_pdu: Some(rx_pdu),
            p2_ms: default_p2_ms(),
            p2_extended_ms: default_p2_extended_ms(),
            max_rcrrp: default_max_rcrrp(),
            separation_time_ms: 0,
            functional: false,
            allowed_services: None,
            metadata_len: 0,
        }
    }

    /// Functional (broadcast) connection with default timing
    pub fn functional(name: &str, tx_pdu: u16) -> Self {
        Self {
            rx_pdu: None,
            functional: true,
            ..Self::physical(name, tx_pdu, 0)
        }
    }
}

impl DrmConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Convert milliseconds into driver ticks, rounding up
    pub fn ticks(&self, ms: u64) -> u32 {
        let ticks = ms.div_ceil(self.tick_ms.max(1));
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }

    /// Check the configuration and compile the runtime connection table
    pub fn validate(&self) -> Result<Vec<Connection>, ConfigError> {
        if self.tick_ms == 0 {
            return Err(invalid("tick_ms must be greater than zero"));
        }
        if self.connections.is_empty() {
            return Err(invalid("at least one connection is required"));
        }
        if self.connections.len() > usize::from(u16::MAX) {
            return Err(invalid("too many connections"));
        }
        let reserved = usize::from(self.functional_requests) * 2 + usize::from(self.discovery);
        if self.application_channels + reserved > usize::from(u8::MAX) {
            return Err(invalid("too many channels"));
        }
        if self.functional_requests && self.functional_buffer_size < NEGATIVE_RESPONSE_LEN {
            return Err(invalid(format!(
                "functional_buffer_size must be at least {} bytes",
                NEGATIVE_RESPONSE_LEN
            )));
        }
        if let RequestDelay::Global { delay_ms: 0 } = self.delay {
            return Err(invalid("global delay_ms must be greater than zero"));
        }

        let mut tx_pdus = HashSet::new();
        let mut rx_pdus = HashSet::new();

        self.connections
            .iter()
            .enumerate()
            .map(|(index, cfg)| {
                let label = if cfg.name.is_empty() {
                    format!("connection {}", index)
                } else {
                    format!("connection '{}'", cfg.name)
                };
                if !tx_pdus.insert(cfg.tx_pdu) {
                    return Err(invalid(format!(
                        "{}: tx_pdu 0x{:04X} used twice",
                        label, cfg.tx_pdu
                    )));
                }
                if let Some(rx) = cfg.rx_pdu {
                    if !rx_pdus.insert(rx) {
                        return Err(invalid(format!("{}: rx_pdu 0x{:04X} used twice", label, rx)));
                    }
                }
                if cfg.p2_ms == 0 {
                    return Err(invalid(format!("{}: p2_ms must be greater than zero", label)));
                }
                if cfg.p2_extended_ms < cfg.p2_ms {
                    return Err(invalid(format!("{}: p2_extended_ms below p2_ms", label)));
                }
                if cfg.metadata_len > MAX_METADATA_LEN {
                    return Err(invalid(format!(
                        "{}: metadata_len exceeds {} bytes",
                        label, MAX_METADATA_LEN
                    )));
                }
                let services = match &cfg.allowed_services {
                    Some(list) => ServiceMask::from_services(list).map_err(|sid| {
                        invalid(format!("{}: service 0x{:02X} unknown to firewall", label, sid))
                    })?,
                    None => ServiceMask::ALL,
                };

                Ok(Connection {
                    id: ConnectionId(index as u16),
                    name: cfg.name.clone(),
                    tx_pdu: PduId(cfg.tx_pdu),
                    rx_pdu: cfg.rx_pdu.map(PduId),
                    p2: self.ticks(cfg.p2_ms).max(1),
                    p2_extended: self.ticks(cfg.p2_extended_ms).max(1),
                    max_rcrrp: cfg.max_rcrrp,
                    separation: self.ticks(cfg.separation_time_ms),
                    functional: cfg.functional,
                    services,
                    metadata_len: cfg.metadata_len,
                })
            })
            .collect()
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Validated connection with timings in ticks
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub name: String,
    pub tx_pdu: PduId,
    pub rx_pdu: Option<PduId>,
    pub p2: u32,
    pub p2_extended: u32,
    pub max_rcrrp: u8,
    pub separation: u32,
    pub functional: bool,
    pub services: ServiceMask,
    pub metadata_len: usize,
}

impl Connection {
    pub fn is_dynamic(&self) -> bool {
        self.metadata_len > 0
    }
}
