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

//! The contract between a client-role daemon and its privileged peer.
//!
//! A client cannot touch the hardware, so it hands images to the privileged peer and asks it for
//! the values only the peer can read. The transport is not defined here: [`PeerChannel`] is
//! implemented over D-Bus in [`comm::dbus::peer_proxy`](crate::comm::dbus::peer_proxy) and in
//! process by tests.

use crate::config::PeerConfig;
use crate::error::SlotdError;
use crate::slot::ConfigurationId;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type PeerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SlotdError>> + Send + 'a>>;

const TWO_MIB: u64 = 2 * 1024 * 1024;

/// Values the privileged peer reports in one query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerValues {
    /// Configured clock targets in MHz.
    pub clock_freqs_mhz: Vec<u16>,
    /// Measured clock frequencies in kHz.
    pub freq_counters_khz: Vec<u32>,
    pub idcode: u32,
    /// Committed configuration per slot, indexed by slot id.
    pub configuration_ids: Vec<ConfigurationId>,
    pub calibration_status: u32,
    pub data_retention: bool,
}

/// Wire form of [`PeerValues`]: D-Bus signature `(aqauuasub)`.
pub type PeerValuesWire = (Vec<u16>, Vec<u32>, u32, Vec<String>, u32, bool);

impl PeerValues {
    pub fn configuration_id(&self, slot_id: u32) -> ConfigurationId {
        self.configuration_ids
            .get(slot_id as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn to_wire(&self) -> PeerValuesWire {
        (
            self.clock_freqs_mhz.clone(),
            self.freq_counters_khz.clone(),
            self.idcode,
            self.configuration_ids.iter().map(|id| id.to_string()).collect(),
            self.calibration_status,
            self.data_retention,
        )
    }

    pub fn from_wire(wire: PeerValuesWire) -> Result<Self, SlotdError> {
        let (clock_freqs_mhz, freq_counters_khz, idcode, ids, calibration_status, data_retention) =
            wire;
        let configuration_ids = ids
            .iter()
            .map(|id| id.parse::<ConfigurationId>())
            .collect::<Result<_, _>>()
            .map_err(|e| SlotdError::Peer(format!("peer sent a malformed id: {e}")))?;
        Ok(PeerValues {
            clock_freqs_mhz,
            freq_counters_khz,
            idcode,
            configuration_ids,
            calibration_status,
            data_retention,
        })
    }
}

/// Request/response channel to the privileged peer.
pub trait PeerChannel: Send + Sync {
    /// Ask the peer to program `slot_id` with `image`.
    fn load_image<'a>(&'a self, slot_id: u32, image: &'a [u8]) -> PeerFuture<'a, ()>;

    fn peer_values(&self) -> PeerFuture<'_, PeerValues>;
}

/// Deadline for a peer download of `image_len` bytes needing `channels` calibrations.
///
/// A fixed base, plus an allowance per started 2 MiB of image, plus an allowance per memory
/// channel, never less than the configured floor.
pub fn peer_timeout(config: &PeerConfig, image_len: usize, channels: usize) -> Duration {
    let chunks = (image_len as u64).div_ceil(TWO_MIB);
    let scaled = config.base
        + config.per_2mb.saturating_mul(chunks as u32)
        + config.per_channel.saturating_mul(channels as u32);
    scaled.max(config.floor)
}

/// Run a peer request with a deadline, turning expiry into `Timeout`.
pub async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    request: PeerFuture<'_, T>,
) -> Result<T, SlotdError> {
    tokio::time::timeout(deadline, request)
        .await
        .map_err(|_| SlotdError::Timeout(format!("{what}: no answer from peer within {deadline:?}")))?
}
