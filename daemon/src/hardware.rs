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

//! Hardware-facing collaborators of the programming flow.
//!
//! The privileged path drives the device through these traits only. [`registers`] implements
//! them on top of a mapped register resource, tests implement them in memory.

pub mod firmware;
pub mod registers;

use crate::error::SlotdError;
use crate::image::sections::IpKind;
use log::trace;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Status bits of the configuration port reporting that a download completed.
pub const CONFIG_PORT_DONE_MASK: u32 = 0x5;
/// Control bit of the configuration port that starts a transfer. Cleared by hardware.
pub const CONFIG_PORT_START: u32 = 0x1;
/// Calibration status bit set once every channel finished calibrating.
pub const CALIBRATION_DONE: u32 = 0x1;

pub trait RegisterAccess: Send + Sync {
    fn read32(&self, offset: u64) -> Result<u32, SlotdError>;
    fn write32(&self, offset: u64, value: u32) -> Result<(), SlotdError>;
}

/// Bus-isolation gate in front of the reconfigurable region.
pub trait FreezeGate: Send + Sync {
    fn freeze(&self) -> Result<(), SlotdError>;
    fn unfreeze(&self) -> Result<(), SlotdError>;
}

/// The port bitstream words are pushed through.
pub trait ConfigPort: Send + Sync {
    /// Number of words the write FIFO accepts right now.
    fn vacancy(&self) -> Result<u32, SlotdError>;
    fn write_words(&self, words: &[u32]) -> Result<(), SlotdError>;
    /// Start transferring the queued words.
    fn start(&self) -> Result<(), SlotdError>;
    fn control(&self) -> Result<u32, SlotdError>;
    fn status(&self) -> Result<u32, SlotdError>;
}

pub trait ClockController: Send + Sync {
    /// Program the clock generators to the given targets in MHz, one per clock.
    fn set_frequencies(&self, targets_mhz: &[u16]) -> Result<(), SlotdError>;
    fn configured_frequencies(&self) -> Result<Vec<u16>, SlotdError>;
    /// Frequencies measured by the on-chip counters, in kHz.
    fn measured_frequencies(&self) -> Result<Vec<u32>, SlotdError>;
}

pub trait MemoryCalibration: Send + Sync {
    /// Kick off calibration of `channels` memory channels. With `retain` the channels are not
    /// reset and their contents are kept.
    fn calibrate(&self, channels: usize, retain: bool) -> Result<(), SlotdError>;
    fn status(&self) -> Result<u32, SlotdError>;
}

/// Kinds of auxiliary resources created from an image's IP and debug layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuxResourceKind {
    MemoryController,
    MemoryDdr4,
    MemoryHbm,
    Authentication,
    DebugMonitor(u8),
}

impl AuxResourceKind {
    /// The auxiliary resource an IP layout entry asks for, if any.
    pub fn for_ip(kind: IpKind) -> Option<Self> {
        match kind {
            IpKind::Ddr4Controller => Some(AuxResourceKind::MemoryController),
            IpKind::MemDdr4 => Some(AuxResourceKind::MemoryDdr4),
            IpKind::MemHbm => Some(AuxResourceKind::MemoryHbm),
            IpKind::Dnasc => Some(AuxResourceKind::Authentication),
            IpKind::Microblaze | IpKind::Kernel | IpKind::Other(_) => None,
        }
    }
}

impl Display for AuxResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AuxResourceKind::MemoryController => f.write_str("memory-controller"),
            AuxResourceKind::MemoryDdr4 => f.write_str("mem-ddr4"),
            AuxResourceKind::MemoryHbm => f.write_str("mem-hbm"),
            AuxResourceKind::Authentication => f.write_str("authentication"),
            AuxResourceKind::DebugMonitor(t) => write!(f, "debug-monitor-{t}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceHandle(pub u64);

pub trait ResourceFactory: Send + Sync {
    fn create(
        &self,
        kind: AuxResourceKind,
        base_address: u64,
        name: &str,
    ) -> Result<ResourceHandle, SlotdError>;
    fn destroy(&self, handle: ResourceHandle) -> Result<(), SlotdError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConsumerHandle(pub u64);

/// Registration of compute units with whatever schedules work onto them.
pub trait ConsumerRegistry: Send + Sync {
    fn register(
        &self,
        slot_id: u32,
        name: &str,
        base_address: u64,
    ) -> Result<ConsumerHandle, SlotdError>;
    fn unregister(&self, handle: ConsumerHandle) -> Result<(), SlotdError>;
}

pub trait FirmwareLoader: Send + Sync {
    fn load(&self, name: &Path) -> Result<Vec<u8>, SlotdError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub kind: AuxResourceKind,
    pub base_address: u64,
    pub name: String,
}

/// Keeps track of created auxiliary resources in memory.
#[derive(Debug, Default)]
pub struct ResourceTable {
    next: AtomicU64,
    live: Mutex<BTreeMap<ResourceHandle, ResourceRecord>>,
}

impl ResourceTable {
    pub fn live(&self) -> Vec<ResourceRecord> {
        self.live
            .lock()
            .map(|live| live.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl ResourceFactory for ResourceTable {
    fn create(
        &self,
        kind: AuxResourceKind,
        base_address: u64,
        name: &str,
    ) -> Result<ResourceHandle, SlotdError> {
        let handle = ResourceHandle(self.next.fetch_add(1, Ordering::Relaxed));
        trace!("creating {kind} '{name}' at {base_address:#x} as {handle:?}");
        self.live
            .lock()
            .map_err(|_| SlotdError::Internal("resource table is poisoned".into()))?
            .insert(
                handle,
                ResourceRecord {
                    kind,
                    base_address,
                    name: name.to_string(),
                },
            );
        Ok(handle)
    }

    fn destroy(&self, handle: ResourceHandle) -> Result<(), SlotdError> {
        trace!("destroying {handle:?}");
        self.live
            .lock()
            .map_err(|_| SlotdError::Internal("resource table is poisoned".into()))?
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| SlotdError::Hardware(format!("no resource {handle:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub slot_id: u32,
    pub name: String,
    pub base_address: u64,
}

/// Keeps track of registered compute units in memory.
#[derive(Debug, Default)]
pub struct ConsumerTable {
    next: AtomicU64,
    live: Mutex<BTreeMap<ConsumerHandle, ConsumerRecord>>,
}

impl ConsumerTable {
    pub fn registered(&self, slot_id: u32) -> Vec<ConsumerRecord> {
        self.live
            .lock()
            .map(|live| {
                live.values()
                    .filter(|c| c.slot_id == slot_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ConsumerRegistry for ConsumerTable {
    fn register(
        &self,
        slot_id: u32,
        name: &str,
        base_address: u64,
    ) -> Result<ConsumerHandle, SlotdError> {
        let handle = ConsumerHandle(self.next.fetch_add(1, Ordering::Relaxed));
        trace!("slot {slot_id}: registering compute unit '{name}' at {base_address:#x}");
        self.live
            .lock()
            .map_err(|_| SlotdError::Internal("consumer table is poisoned".into()))?
            .insert(
                handle,
                ConsumerRecord {
                    slot_id,
                    name: name.to_string(),
                    base_address,
                },
            );
        Ok(handle)
    }

    fn unregister(&self, handle: ConsumerHandle) -> Result<(), SlotdError> {
        self.live
            .lock()
            .map_err(|_| SlotdError::Internal("consumer table is poisoned".into()))?
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| SlotdError::Hardware(format!("no consumer {handle:?}")))
    }
}
