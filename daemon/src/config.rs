// This file is part of slotd, a daemon to program reconfigurable accelerator slots and arbitrate access to them.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// slotd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// slotd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! Daemon configuration.
//!
//! Settings are read once at startup from a TOML file (see [`config_files`]) and merged over the
//! hardcoded defaults in this module. The resolved [`DaemonConfig`] is handed to
//! [`Device::attach`](crate::device::Device::attach) and never consulted through global state.
//!
//! A missing file, a missing section or a missing key is never fatal: each falls back to its
//! default with a log message. A file that exists but cannot be parsed is reported and the
//! defaults are used in its place.

pub mod config_files;

use crate::error::SlotdError;
use crate::signature::SecurityLevel;
use log::{trace, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Location of the configuration file unless overridden through [`CONFIG_PATH_ENV`].
pub static CONFIG_FILE_PATH: &str = "/etc/slotd/config.toml";

/// Environment variable naming an alternative configuration file.
pub static CONFIG_PATH_ENV: &str = "SLOTD_CONFIG";

/// Well-known bus name claimed by the daemon on the system bus.
pub static DBUS_SERVICE_NAME: &str = "com.canonical.slotd";
/// Additional bus name claimed by a privileged daemon so clients can reach it as their peer.
pub static DBUS_PEER_SERVICE_NAME: &str = "com.canonical.slotd.peer";
pub static DBUS_STATUS_PATH: &str = "/com/canonical/slotd/status";
pub static DBUS_CONTROL_PATH: &str = "/com/canonical/slotd/control";
/// Object path of the peer interface served by a privileged daemon.
pub static DBUS_PEER_PATH: &str = "/com/canonical/slotd/peer";

/// Directory searched for configuration images named by a relative path.
pub static FIRMWARE_SEARCH_DIR: &str = "/lib/firmware/";

pub const DEFAULT_SLOT_COUNT: u32 = 4;
pub const DEFAULT_CACHE_EXPIRE_SECS: u64 = 1;
/// Upper bound accepted for the peer value cache lifetime.
pub const MAX_CACHE_EXPIRE_SECS: u64 = 10;
pub const DEFAULT_CALIBRATION_POLL_COUNT: u32 = 20;
pub const DEFAULT_CALIBRATION_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_CONFIG_PORT_POLL_INTERVAL_US: u64 = 5;
pub const DEFAULT_CONFIG_PORT_POLL_TIMEOUT_US: u64 = 50;
pub const DEFAULT_PEER_FLOOR_SECS: u64 = 50;
pub const DEFAULT_PEER_BASE_SECS: u64 = 5;
pub const DEFAULT_PEER_SECS_PER_2MB: u64 = 1;
pub const DEFAULT_PEER_MS_PER_CHANNEL: u64 = 500;

pub const DEFAULT_ID_REGISTER_OFFSET: u64 = 0x0;
pub const DEFAULT_VERSION_REGISTER_OFFSET: u64 = 0x4;
pub const DEFAULT_IDCODE_REGISTER_OFFSET: u64 = 0x8;
pub const DEFAULT_GATE_BASE: u64 = 0x1000;
pub const DEFAULT_CONFIG_PORT_BASE: u64 = 0x2000;
pub const DEFAULT_CALIBRATION_BASE: u64 = 0x3000;
pub const DEFAULT_CLOCK_BASE: u64 = 0x4000;

/// How a broken internal invariant (negative reader count, foreign writer release, ...) is
/// handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvariantPolicy {
    /// Log and panic.
    Abort,
    /// Log and return `SlotdError::InvariantViolation` to the caller.
    #[default]
    Report,
}

impl InvariantPolicy {
    /// Turn a detected violation into the configured outcome.
    pub fn violation(self, what: String) -> SlotdError {
        log::error!("invariant violated: {what}");
        match self {
            InvariantPolicy::Abort => panic!("invariant violated: {what}"),
            InvariantPolicy::Report => SlotdError::InvariantViolation(what),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub slot_count: u32,
    /// Register resource of the privileged function. Absent on client-only hosts.
    pub register_file: Option<PathBuf>,
    pub id_register_offset: u64,
    pub version_register_offset: u64,
    /// Chip identifier code reported to clients.
    pub idcode_register_offset: u64,
    pub gate_base: u64,
    pub config_port_base: u64,
    pub calibration_base: u64,
    pub clock_base: u64,
    /// Interface identifier the platform exposes to images.
    pub interface_uuid: Option<Uuid>,
    /// Slots whose fabric takes part in clock and memory retuning. `None` means all.
    pub programmable_slots: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityConfig {
    pub level: SecurityLevel,
    pub dedicated_key: Option<PathBuf>,
    pub platform_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationConfig {
    pub poll_count: u32,
    pub poll_interval: Duration,
    pub data_retention: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigPortConfig {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub service: String,
    pub floor: Duration,
    pub base: Duration,
    pub per_2mb: Duration,
    pub per_channel: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub device: DeviceConfig,
    pub security: SecurityConfig,
    pub cache_expire: Duration,
    pub calibration: CalibrationConfig,
    pub config_port: ConfigPortConfig,
    pub peer: PeerConfig,
    pub firmware_dir: PathBuf,
    pub invariant_policy: InvariantPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            slot_count: DEFAULT_SLOT_COUNT,
            register_file: None,
            id_register_offset: DEFAULT_ID_REGISTER_OFFSET,
            version_register_offset: DEFAULT_VERSION_REGISTER_OFFSET,
            idcode_register_offset: DEFAULT_IDCODE_REGISTER_OFFSET,
            gate_base: DEFAULT_GATE_BASE,
            config_port_base: DEFAULT_CONFIG_PORT_BASE,
            calibration_base: DEFAULT_CALIBRATION_BASE,
            clock_base: DEFAULT_CLOCK_BASE,
            interface_uuid: None,
            programmable_slots: None,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            level: SecurityLevel::None,
            dedicated_key: None,
            platform_key: None,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            poll_count: DEFAULT_CALIBRATION_POLL_COUNT,
            poll_interval: Duration::from_millis(DEFAULT_CALIBRATION_POLL_INTERVAL_MS),
            data_retention: false,
        }
    }
}

impl Default for ConfigPortConfig {
    fn default() -> Self {
        ConfigPortConfig {
            poll_interval: Duration::from_micros(DEFAULT_CONFIG_PORT_POLL_INTERVAL_US),
            poll_timeout: Duration::from_micros(DEFAULT_CONFIG_PORT_POLL_TIMEOUT_US),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            service: DBUS_PEER_SERVICE_NAME.to_string(),
            floor: Duration::from_secs(DEFAULT_PEER_FLOOR_SECS),
            base: Duration::from_secs(DEFAULT_PEER_BASE_SECS),
            per_2mb: Duration::from_secs(DEFAULT_PEER_SECS_PER_2MB),
            per_channel: Duration::from_millis(DEFAULT_PEER_MS_PER_CHANNEL),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            device: DeviceConfig::default(),
            security: SecurityConfig::default(),
            cache_expire: Duration::from_secs(DEFAULT_CACHE_EXPIRE_SECS),
            calibration: CalibrationConfig::default(),
            config_port: ConfigPortConfig::default(),
            peer: PeerConfig::default(),
            firmware_dir: PathBuf::from(FIRMWARE_SEARCH_DIR),
            invariant_policy: InvariantPolicy::default(),
        }
    }
}

impl DeviceConfig {
    pub fn is_programmable(&self, slot_id: u32) -> bool {
        self.programmable_slots
            .as_ref()
            .is_none_or(|slots| slots.contains(&slot_id))
    }
}

/// Path of the configuration file, honouring [`CONFIG_PATH_ENV`].
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) => {
            trace!("{CONFIG_PATH_ENV} points at {path:?}");
            PathBuf::from(path)
        }
        None => PathBuf::from(CONFIG_FILE_PATH),
    }
}

/// Load the daemon configuration, falling back to defaults on any problem with the file.
pub fn load_config(path: &Path) -> DaemonConfig {
    match config_files::config_from_file(path) {
        Ok(config) => {
            trace!("Successfully loaded config: {config:?}");
            config
        }
        Err(e) => {
            warn!("Using hardcoded defaults because failed to load config: {e}");
            DaemonConfig::default()
        }
    }
}
