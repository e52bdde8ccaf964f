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

use crate::comm::dbus::{parse_configuration_id, requester_from_header};
use crate::device::Device;
use crate::hardware::FirmwareLoader;
use crate::signature::SecurityLevel;
use log::{info, trace};
use std::path::Path;
use std::sync::Arc;
use zbus::message::Header;
use zbus::{fdo, interface};

pub struct ControlInterface {
    device: Arc<Device>,
    firmware: Arc<dyn FirmwareLoader>,
}

impl ControlInterface {
    pub fn new(device: Arc<Device>, firmware: Arc<dyn FirmwareLoader>) -> Self {
        ControlInterface { device, firmware }
    }
}

#[interface(name = "com.canonical.slotd.control")]
impl ControlInterface {
    /// Program a slot with an image from the firmware search directory.
    async fn program_slot(
        &self,
        #[zbus(header)] header: Header<'_>,
        slot: u32,
        image_path: &str,
    ) -> Result<String, fdo::Error> {
        info!("program_slot called with slot: {slot} and image_path: {image_path}");
        let requester = requester_from_header(&header);
        let bytes = self.firmware.load(Path::new(image_path))?;
        trace!("loaded {} bytes from {image_path}", bytes.len());
        self.device.program(slot, &bytes, requester).await?;
        Ok(format!(
            "{image_path} loaded to slot {slot} as {}",
            self.device.query_configuration_id(slot)?
        ))
    }

    async fn program_slot_bytes(
        &self,
        #[zbus(header)] header: Header<'_>,
        slot: u32,
        image: Vec<u8>,
    ) -> Result<String, fdo::Error> {
        info!("program_slot_bytes called with slot: {slot} and {} bytes", image.len());
        let requester = requester_from_header(&header);
        self.device.program(slot, &image, requester).await?;
        Ok(format!(
            "{} bytes loaded to slot {slot} as {}",
            image.len(),
            self.device.query_configuration_id(slot)?
        ))
    }

    async fn mark_in_use(&self, slot: u32, configuration_id: &str) -> Result<String, fdo::Error> {
        info!("mark_in_use called with slot: {slot} and configuration_id: {configuration_id}");
        let id = parse_configuration_id(configuration_id)?;
        let count = self.device.mark_in_use(slot, id)?;
        Ok(format!("slot {slot} in use by {count} consumers"))
    }

    async fn mark_unused(&self, slot: u32, configuration_id: &str) -> Result<String, fdo::Error> {
        info!("mark_unused called with slot: {slot} and configuration_id: {configuration_id}");
        let id = parse_configuration_id(configuration_id)?;
        let count = self.device.mark_unused(slot, id)?;
        Ok(format!("slot {slot} in use by {count} consumers"))
    }

    async fn set_data_retention(&self, enabled: bool) -> Result<String, fdo::Error> {
        info!("set_data_retention called with enabled: {enabled}");
        self.device.set_data_retention(enabled)?;
        Ok(format!("data retention set to {enabled}"))
    }

    async fn set_security_level(&self, level: &str) -> Result<String, fdo::Error> {
        info!("set_security_level called with level: {level}");
        let level: SecurityLevel = level.parse()?;
        self.device.set_security_level(level)?;
        Ok(format!("security level set to {level}"))
    }

    async fn set_cache_ttl(&self, secs: u64) -> Result<String, fdo::Error> {
        info!("set_cache_ttl called with secs: {secs}");
        self.device.set_cache_ttl(secs)?;
        Ok(format!("peer values are cached for {secs}s"))
    }
}
