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

use crate::comm::dbus::parse_metadata_kind;
use crate::device::Device;
use log::info;
use std::sync::Arc;
use zbus::{fdo, interface};

pub struct StatusInterface {
    device: Arc<Device>,
}

impl StatusInterface {
    pub fn new(device: Arc<Device>) -> Self {
        StatusInterface { device }
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[interface(name = "com.canonical.slotd.status")]
impl StatusInterface {
    async fn get_configuration_id(&self, slot: u32) -> Result<String, fdo::Error> {
        info!("get_configuration_id called with slot: {slot}");
        Ok(self.device.query_configuration_id(slot)?.to_string())
    }

    async fn get_reader_count(&self, slot: u32) -> Result<String, fdo::Error> {
        info!("get_reader_count called with slot: {slot}");
        Ok(self.device.reader_count(slot)?.to_string())
    }

    async fn get_in_use_count(&self, slot: u32) -> Result<String, fdo::Error> {
        info!("get_in_use_count called with slot: {slot}");
        Ok(self.device.in_use_count(slot)?.to_string())
    }

    async fn get_data_retention(&self) -> Result<String, fdo::Error> {
        info!("get_data_retention called");
        Ok(self.device.data_retention().await?.to_string())
    }

    async fn get_max_host_mem_aperture(&self, slot: u32) -> Result<String, fdo::Error> {
        info!("get_max_host_mem_aperture called with slot: {slot}");
        Ok(self.device.max_host_mem_aperture(slot)?.to_string())
    }

    /// Configured clock targets in MHz, comma separated.
    async fn get_clock_frequencies(&self, slot: u32) -> Result<String, fdo::Error> {
        info!("get_clock_frequencies called with slot: {slot}");
        Ok(join(&self.device.clock_frequencies(slot).await?))
    }

    /// Measured clock frequencies in kHz, comma separated.
    async fn get_measured_frequencies(&self, slot: u32) -> Result<String, fdo::Error> {
        info!("get_measured_frequencies called with slot: {slot}");
        Ok(join(&self.device.measured_frequencies(slot).await?))
    }

    async fn get_calibration_status(&self, slot: u32) -> Result<String, fdo::Error> {
        info!("get_calibration_status called with slot: {slot}");
        Ok(format!(
            "{:#x}",
            self.device.query_calibration_status(slot).await?
        ))
    }

    async fn get_idcode(&self) -> Result<String, fdo::Error> {
        info!("get_idcode called");
        Ok(format!("{:#010x}", self.device.idcode().await?))
    }

    async fn get_role(&self) -> Result<String, fdo::Error> {
        info!("get_role called");
        Ok(self.device.role().to_string())
    }

    async fn get_security_level(&self) -> Result<String, fdo::Error> {
        info!("get_security_level called");
        Ok(self.device.security_level()?.to_string())
    }

    /// Hex dump of one metadata buffer of the slot's committed configuration.
    async fn get_metadata(&self, slot: u32, kind: &str) -> Result<String, fdo::Error> {
        info!("get_metadata called with slot: {slot} and kind: {kind}");
        let kind = parse_metadata_kind(kind)?;
        Ok(self.device.metadata_hex(slot, kind)?)
    }
}
