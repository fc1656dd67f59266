// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving bridge settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::ble_constants::{self, config::DEFAULT_MTU};
use crate::protocol::{default_port, DEFAULT_MAX_PAYLOAD};

const APP_DIR: &str = "mbot-ble-bridge";

/// Bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Protocol settings.
    pub protocol: ProtocolConfig,

    /// Distance poller settings.
    pub poller: PollerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Local name the robot advertises.
    pub device_name: String,

    pub service_uuid: Uuid,
    pub read_uuid: Uuid,
    pub write_uuid: Uuid,

    /// Give up scanning after this many seconds.
    pub scan_timeout_secs: u64,

    /// Give up waiting for GATT resolution after this many seconds.
    pub discovery_timeout_secs: u64,

    /// ATT MTU used to size writes.
    pub mtu: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: ble_constants::DEVICE_NAME.to_string(),
            service_uuid: ble_constants::SERVICE_UUID,
            read_uuid: ble_constants::READ_UUID,
            write_uuid: ble_constants::WRITE_UUID,
            scan_timeout_secs: 30,
            discovery_timeout_secs: 10,
            mtu: DEFAULT_MTU,
        }
    }
}

impl BluetoothConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest payload accepted in either direction.
    pub max_payload: usize,

    /// Default deadline for a reply in milliseconds.
    pub response_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            response_timeout_ms: 1000,
        }
    }
}

impl ProtocolConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Delay between distance reads in milliseconds.
    pub interval_ms: u64,

    /// Port of the ultrasonic sensor.
    pub distance_port: u8,

    /// Toggle the onboard LEDs between two colours on every tick.
    pub alternate_leds: bool,

    pub led_port: u8,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1500,
            distance_port: default_port::DISTANCE,
            alternate_leds: false,
            led_port: default_port::RGB_LED,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = Self::config_dir();
        std::fs::create_dir_all(&config_dir)?;
        Self::load_from(&config_dir.join("config.toml"))
    }

    /// Load from an explicit path, writing defaults there if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bluetooth.device_name, "Makeblock_LE");
        assert_eq!(config.bluetooth.service_uuid, ble_constants::SERVICE_UUID);
        assert_eq!(config.protocol.max_payload, 255);
        assert_eq!(config.protocol.response_timeout(), Duration::from_secs(1));
        assert_eq!(config.poller.interval(), Duration::from_millis(1500));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[bluetooth]\ndevice_name = \"Makeblock_Lab\"\n\n[poller]\ninterval_ms = 250\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.bluetooth.device_name, "Makeblock_Lab");
        assert_eq!(config.bluetooth.write_uuid, ble_constants::WRITE_UUID);
        assert_eq!(config.poller.interval_ms, 250);
        assert_eq!(config.protocol, ProtocolConfig::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[protocol]\nmax_payload = \"lots\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
