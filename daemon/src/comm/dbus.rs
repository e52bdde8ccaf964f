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

pub mod control_interface;
pub mod peer_interface;
pub mod peer_proxy;
pub mod status_interface;

use crate::access::Requester;
use crate::error::SlotdError;
use crate::slot::{ConfigurationId, MetadataKind};
use log::trace;
use zbus::message::Header;

/// Identify the caller of a D-Bus method by its unique bus name.
pub(crate) fn requester_from_header(header: &Header<'_>) -> Requester {
    match header.sender() {
        Some(sender) => Requester::from(sender.to_string()),
        None => {
            trace!("message carries no sender");
            Requester::from("anonymous")
        }
    }
}

/// Parse a configuration id as sent over the bus.
pub(crate) fn parse_configuration_id(id: &str) -> Result<ConfigurationId, SlotdError> {
    if id.is_empty() {
        return Err(SlotdError::Argument(
            "configuration id cannot be empty".into(),
        ));
    }
    id.trim().parse()
}

pub(crate) fn parse_metadata_kind(kind: &str) -> Result<MetadataKind, SlotdError> {
    kind.trim().to_ascii_lowercase().parse()
}
