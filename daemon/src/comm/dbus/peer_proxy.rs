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

//! The client side of `com.canonical.slotd.peer`.

use crate::config::DBUS_PEER_PATH;
use crate::error::SlotdError;
use crate::peer::{PeerChannel, PeerFuture, PeerValues, PeerValuesWire};
use log::trace;
use zbus::{Connection, DBusError, fdo, proxy};

#[proxy(
    interface = "com.canonical.slotd.peer",
    default_service = "com.canonical.slotd.peer",
    default_path = "/com/canonical/slotd/peer"
)]
pub trait Peer {
    fn load_image(&self, slot: u32, image: &[u8]) -> zbus::Result<()>;
    fn peer_values(&self) -> zbus::Result<PeerValuesWire>;
}

/// The error a failed reply of the peer stands for.
pub fn reply_error(reply: &fdo::Error) -> SlotdError {
    SlotdError::from_remote(reply.name().as_str(), reply.description().unwrap_or_default())
}

/// Map a failed peer call to the variant the peer failed with. Transport failures are
/// [`SlotdError::Peer`].
pub fn peer_error(e: zbus::Error) -> SlotdError {
    match e {
        zbus::Error::MethodError(name, detail, _) => {
            SlotdError::from_remote(name.as_str(), detail.as_deref().unwrap_or_default())
        }
        zbus::Error::FDO(reply) => reply_error(&reply),
        other => SlotdError::Peer(other.to_string()),
    }
}

/// [`PeerChannel`] over the system bus.
pub struct DbusPeer {
    proxy: PeerProxy<'static>,
}

impl DbusPeer {
    /// Reach the privileged function under the bus name `service`.
    pub async fn connect(connection: &Connection, service: &str) -> Result<Self, SlotdError> {
        trace!("connecting to peer {service} at {DBUS_PEER_PATH}");
        let proxy = PeerProxy::builder(connection)
            .destination(service.to_owned())
            .map_err(peer_error)?
            .build()
            .await
            .map_err(peer_error)?;
        Ok(DbusPeer { proxy })
    }
}

impl PeerChannel for DbusPeer {
    fn load_image<'a>(&'a self, slot_id: u32, image: &'a [u8]) -> PeerFuture<'a, ()> {
        Box::pin(async move {
            self.proxy
                .load_image(slot_id, image)
                .await
                .map_err(peer_error)
        })
    }

    fn peer_values(&self) -> PeerFuture<'_, PeerValues> {
        Box::pin(async move {
            let wire = self.proxy.peer_values().await.map_err(peer_error)?;
            PeerValues::from_wire(wire)
        })
    }
}
