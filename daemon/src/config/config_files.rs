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

use crate::config::{
    CalibrationConfig, ConfigPortConfig, DaemonConfig, DeviceConfig, InvariantPolicy,
    MAX_CACHE_EXPIRE_SECS, PeerConfig, SecurityConfig,
};
use crate::error::SlotdError;
use crate::signature::SecurityLevel;
use crate::system_io::fs_read;
use log::{trace, warn};
use serde::Deserialize;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// This is the top level struct which holds all sections
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TomlConfig {
    device: Option<DeviceToml>,
    security: Option<SecurityToml>,
    cache: Option<CacheToml>,
    calibration: Option<CalibrationToml>,
    config_port: Option<ConfigPortToml>,
    peer: Option<PeerToml>,
    firmware: Option<FirmwareToml>,
    policy: Option<PolicyToml>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DeviceToml {
    slot_count: Option<u32>,
    register_file: Option<PathBuf>,
    id_register_offset: Option<u64>,
    version_register_offset: Option<u64>,
    idcode_register_offset: Option<u64>,
    gate_base: Option<u64>,
    config_port_base: Option<u64>,
    calibration_base: Option<u64>,
    clock_base: Option<u64>,
    interface_uuid: Option<Uuid>,
    programmable_slots: Option<Vec<u32>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SecurityToml {
    level: Option<SecurityLevel>,
    dedicated_key: Option<PathBuf>,
    platform_key: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CacheToml {
    expire_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CalibrationToml {
    poll_count: Option<u32>,
    poll_interval_ms: Option<u64>,
    data_retention: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConfigPortToml {
    poll_interval_us: Option<u64>,
    poll_timeout_us: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PeerToml {
    service: Option<String>,
    floor_secs: Option<u64>,
    base_secs: Option<u64>,
    secs_per_2mb: Option<u64>,
    ms_per_channel: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FirmwareToml {
    search_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PolicyToml {
    invariant_violation: Option<InvariantPolicy>,
}

fn or_default<T: Debug>(value: Option<T>, name: &str, default: T) -> T {
    value.unwrap_or_else(|| {
        trace!("No {name} provided. Using hardcoded value {default:?}.");
        default
    })
}

impl DeviceToml {
    fn resolve(self, fallback: DeviceConfig) -> DeviceConfig {
        DeviceConfig {
            slot_count: or_default(self.slot_count, "slot_count", fallback.slot_count),
            register_file: self.register_file.or(fallback.register_file),
            id_register_offset: or_default(
                self.id_register_offset,
                "id_register_offset",
                fallback.id_register_offset,
            ),
            version_register_offset: or_default(
                self.version_register_offset,
                "version_register_offset",
                fallback.version_register_offset,
            ),
            idcode_register_offset: or_default(
                self.idcode_register_offset,
                "idcode_register_offset",
                fallback.idcode_register_offset,
            ),
            gate_base: or_default(self.gate_base, "gate_base", fallback.gate_base),
            config_port_base: or_default(
                self.config_port_base,
                "config_port_base",
                fallback.config_port_base,
            ),
            calibration_base: or_default(
                self.calibration_base,
                "calibration_base",
                fallback.calibration_base,
            ),
            clock_base: or_default(self.clock_base, "clock_base", fallback.clock_base),
            interface_uuid: self.interface_uuid.or(fallback.interface_uuid),
            programmable_slots: self.programmable_slots.or(fallback.programmable_slots),
        }
    }
}

impl SecurityToml {
    fn resolve(self, fallback: SecurityConfig) -> SecurityConfig {
        SecurityConfig {
            level: or_default(self.level, "security level", fallback.level),
            dedicated_key: self.dedicated_key.or(fallback.dedicated_key),
            platform_key: self.platform_key.or(fallback.platform_key),
        }
    }
}

impl CalibrationToml {
    fn resolve(self, fallback: CalibrationConfig) -> CalibrationConfig {
        CalibrationConfig {
            poll_count: or_default(self.poll_count, "poll_count", fallback.poll_count),
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(fallback.poll_interval),
            data_retention: or_default(
                self.data_retention,
                "data_retention",
                fallback.data_retention,
            ),
        }
    }
}

impl ConfigPortToml {
    fn resolve(self, fallback: ConfigPortConfig) -> ConfigPortConfig {
        ConfigPortConfig {
            poll_interval: self
                .poll_interval_us
                .map(Duration::from_micros)
                .unwrap_or(fallback.poll_interval),
            poll_timeout: self
                .poll_timeout_us
                .map(Duration::from_micros)
                .unwrap_or(fallback.poll_timeout),
        }
    }
}

impl PeerToml {
    fn resolve(self, fallback: PeerConfig) -> PeerConfig {
        PeerConfig {
            service: or_default(self.service, "peer service", fallback.service),
            floor: self
                .floor_secs
                .map(Duration::from_secs)
                .unwrap_or(fallback.floor),
            base: self
                .base_secs
                .map(Duration::from_secs)
                .unwrap_or(fallback.base),
            per_2mb: self
                .secs_per_2mb
                .map(Duration::from_secs)
                .unwrap_or(fallback.per_2mb),
            per_channel: self
                .ms_per_channel
                .map(Duration::from_millis)
                .unwrap_or(fallback.per_channel),
        }
    }
}

impl TomlConfig {
    pub(crate) fn resolve(self, fallback: DaemonConfig) -> DaemonConfig {
        let cache_expire = match self.cache.and_then(|c| c.expire_secs) {
            Some(secs) if secs > MAX_CACHE_EXPIRE_SECS => {
                warn!(
                    "cache expire_secs {secs} is above {MAX_CACHE_EXPIRE_SECS}, using {MAX_CACHE_EXPIRE_SECS}"
                );
                Duration::from_secs(MAX_CACHE_EXPIRE_SECS)
            }
            Some(secs) => Duration::from_secs(secs),
            None => fallback.cache_expire,
        };
        DaemonConfig {
            device: self.device.unwrap_or_default().resolve(fallback.device),
            security: self.security.unwrap_or_default().resolve(fallback.security),
            cache_expire,
            calibration: self
                .calibration
                .unwrap_or_default()
                .resolve(fallback.calibration),
            config_port: self
                .config_port
                .unwrap_or_default()
                .resolve(fallback.config_port),
            peer: self.peer.unwrap_or_default().resolve(fallback.peer),
            firmware_dir: self
                .firmware
                .and_then(|f| f.search_dir)
                .unwrap_or(fallback.firmware_dir),
            invariant_policy: self
                .policy
                .and_then(|p| p.invariant_violation)
                .unwrap_or(fallback.invariant_policy),
        }
    }
}

pub(crate) fn toml_str_to_config(toml_string: &str, file: &Path) -> Result<TomlConfig, SlotdError> {
    toml::from_str(toml_string).map_err(|e| SlotdError::TomlDe {
        file: file.into(),
        e,
    })
}

pub fn config_from_file(file_path: &Path) -> Result<DaemonConfig, SlotdError> {
    if !file_path.is_file() {
        return Err(SlotdError::Argument(format!(
            "Config file not found in {file_path:?}"
        )));
    }
    let config = toml_str_to_config(&fs_read(file_path)?, file_path)?;
    Ok(config.resolve(DaemonConfig::default()))
}
