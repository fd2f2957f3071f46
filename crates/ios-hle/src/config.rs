//! Runtime configuration for the IPC core.
//!
//! The timing values are reverse-engineered hardware latencies. Only their relative ordering is
//! load-bearing for guest compatibility, so they are exposed as plain configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::boot::titles;

/// Latencies, in scheduler ticks, used by the kernel when a device does not supply its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcTimings {
    /// Delay between a guest submitting a request and IOS acknowledging it.
    pub ack_delay: u64,
    /// Reply delay for device replies that don't specify one.
    pub default_reply_delay: u64,
    /// Reply delay for an unknown command kind.
    pub invalid_command_delay: u64,
    /// Reply delay for a request against a closed or out-of-range descriptor.
    pub invalid_fd_delay: u64,
    /// Reply delay when the descriptor table is full.
    pub too_many_files_delay: u64,
    /// Reply delay when an open path does not resolve to a device.
    pub unknown_device_delay: u64,
    /// Reload delay for IOS versions that ship as one large monolithic image.
    pub legacy_boot_ticks: u64,
    /// Reload delay for modular IOS versions.
    pub modern_boot_ticks: u64,
}

impl Default for IpcTimings {
    fn default() -> Self {
        Self {
            ack_delay: 500,
            default_reply_delay: 4_000,
            invalid_command_delay: 978,
            invalid_fd_delay: 550,
            too_many_files_delay: 5_000,
            unknown_device_delay: 3_700,
            legacy_boot_ticks: 16_000_000,
            modern_boot_ticks: 2_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IosConfig {
    /// IOS title booted at process start.
    pub default_title_id: u64,
    pub timings: IpcTimings,
    /// Console identifier reported by ES and stored in the key store.
    pub console_id: u32,
    /// Milliseconds since the Unix epoch reported by `/dev/dolphin` at tick zero.
    ///
    /// Fixed by default so that runs are reproducible.
    pub system_time_base_ms: u64,
    /// USB peripherals visible to `/dev/usb/oh0`, as `(vendor id, product id)`.
    pub usb_devices: Vec<(u16, u16)>,
}

impl Default for IosConfig {
    fn default() -> Self {
        Self {
            default_title_id: titles::SYSTEM_MENU_IOS,
            timings: IpcTimings::default(),
            console_id: 0x0403_AC68,
            system_time_base_ms: 946_684_800_000,
            usb_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

impl IosConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Build a config from the environment.
    ///
    /// `IOS_HLE_CONFIG` names an optional JSON file used as the base; the remaining variables
    /// override individual fields:
    ///
    /// - `IOS_HLE_DEFAULT_TITLE` (hex, with or without `0x`)
    /// - `IOS_HLE_ACK_DELAY`, `IOS_HLE_REPLY_DELAY` (ticks)
    /// - `IOS_HLE_CONSOLE_ID` (hex)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|var| std::env::var(var).ok())
    }

    fn from_vars(get: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match get("IOS_HLE_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                let raw = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Self::from_json_str(&raw)?
            }
            None => Self::default(),
        };

        if let Some(value) = get("IOS_HLE_DEFAULT_TITLE") {
            config.default_title_id = parse_hex_u64("IOS_HLE_DEFAULT_TITLE", &value)?;
        }
        if let Some(value) = get("IOS_HLE_ACK_DELAY") {
            config.timings.ack_delay = parse_u64("IOS_HLE_ACK_DELAY", &value)?;
        }
        if let Some(value) = get("IOS_HLE_REPLY_DELAY") {
            config.timings.default_reply_delay = parse_u64("IOS_HLE_REPLY_DELAY", &value)?;
        }
        if let Some(value) = get("IOS_HLE_CONSOLE_ID") {
            let id = parse_hex_u64("IOS_HLE_CONSOLE_ID", &value)?;
            config.console_id = u32::try_from(id).map_err(|_| ConfigError::InvalidEnv {
                var: "IOS_HLE_CONSOLE_ID",
                value,
            })?;
        }
        Ok(config)
    }
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        })
}

fn parse_hex_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}
