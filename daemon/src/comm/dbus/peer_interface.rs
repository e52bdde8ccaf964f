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

//! Served by the privileged function for its clients.

use crate::comm::dbus::requester_from_header;
use crate::device::Device;
use crate::peer::PeerValuesWire;
use log::info;
use std::sync::Arc;
use zbus::message::Header;
use zbus::{fdo, interface};

pub struct PeerInterface {
    device: Arc<Device>,
}

impl PeerInterface {
    pub fn new(device: Arc<Device>) -> Self {
        PeerInterface { device }
    }
}

#[interface(name = "com.canonical.slotd.peer")]
impl PeerInterface {
    async fn load_image(
        &self,
        #[zbus(header)] header: Header<'_>,
        slot: u32,
        image: Vec<u8>,
    ) -> Result<(), fdo::Error> {
        let requester = requester_from_header(&header);
        info!("load_image called by {requester} with slot: {slot} and {} bytes", image.len());
        Ok(self.device.program(slot, &image, requester).await?)
    }

    async fn peer_values(&self) -> Result<PeerValuesWire, fdo::Error> {
        info!("peer_values called");
        Ok(self.device.peer_values()?.to_wire())
    }
}
