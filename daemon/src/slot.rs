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

//! The slot table: per-slot committed configuration and metadata buffers.
//!
//! Every slot owns its metadata buffers exclusively. A buffer is replaced by assigning a new
//! `Arc` under the slot's own lock, so a reader holding a [`MetadataView`](crate::access) sees
//! either the old buffer or the new one, never a torn write. All mutating operations require a
//! [`WriteGuard`] for the slot, which guarantees no reader is active while they run.

use crate::access::WriteGuard;
use crate::error::SlotdError;
use crate::image::SectionKind;
use log::{info, trace};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Identifier of a committed configuration. The nil id means "nothing loaded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConfigurationId(Uuid);

impl ConfigurationId {
    pub const fn nil() -> Self {
        ConfigurationId(Uuid::nil())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        ConfigurationId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<Uuid> for ConfigurationId {
    fn from(value: Uuid) -> Self {
        ConfigurationId(value)
    }
}

impl Display for ConfigurationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for ConfigurationId {
    type Err = SlotdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(ConfigurationId)
            .map_err(|e| SlotdError::Argument(format!("'{s}' is not a configuration id: {e}")))
    }
}

/// The metadata buffers a slot keeps for its committed configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataKind {
    IpLayout,
    MemTopology,
    DebugIpLayout,
    Connectivity,
    GroupConnectivity,
    GroupTopology,
    SoftKernel,
    ClockFreqTopology,
    PartitionMetadata,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 9] = [
        MetadataKind::IpLayout,
        MetadataKind::MemTopology,
        MetadataKind::DebugIpLayout,
        MetadataKind::Connectivity,
        MetadataKind::GroupConnectivity,
        MetadataKind::GroupTopology,
        MetadataKind::SoftKernel,
        MetadataKind::ClockFreqTopology,
        MetadataKind::PartitionMetadata,
    ];

    /// Image section the buffer is copied from.
    pub fn section(self) -> SectionKind {
        match self {
            MetadataKind::IpLayout => SectionKind::IpLayout,
            MetadataKind::MemTopology => SectionKind::MemTopology,
            MetadataKind::DebugIpLayout => SectionKind::DebugIpLayout,
            MetadataKind::Connectivity => SectionKind::Connectivity,
            MetadataKind::GroupConnectivity => SectionKind::GroupConnectivity,
            MetadataKind::GroupTopology => SectionKind::GroupTopology,
            MetadataKind::SoftKernel => SectionKind::SoftKernel,
            MetadataKind::ClockFreqTopology => SectionKind::ClockFreqTopology,
            MetadataKind::PartitionMetadata => SectionKind::PartitionMetadata,
        }
    }

    fn name(self) -> &'static str {
        match self {
            MetadataKind::IpLayout => "ip-layout",
            MetadataKind::MemTopology => "mem-topology",
            MetadataKind::DebugIpLayout => "debug-ip-layout",
            MetadataKind::Connectivity => "connectivity",
            MetadataKind::GroupConnectivity => "group-connectivity",
            MetadataKind::GroupTopology => "group-topology",
            MetadataKind::SoftKernel => "soft-kernel",
            MetadataKind::ClockFreqTopology => "clock-freq-topology",
            MetadataKind::PartitionMetadata => "partition-metadata",
        }
    }
}

impl Display for MetadataKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetadataKind {
    type Err = SlotdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetadataKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| SlotdError::Argument(format!("'{s}' is not a metadata kind")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub slot_id: u32,
    pub configuration_id: ConfigurationId,
    pub is_programmable_region: bool,
    /// Size in bytes of the host memory window of the committed configuration.
    pub max_host_mem_aperture: u64,
    metadata: BTreeMap<MetadataKind, Arc<[u8]>>,
}

impl Slot {
    fn new(slot_id: u32, is_programmable_region: bool) -> Self {
        Slot {
            slot_id,
            configuration_id: ConfigurationId::nil(),
            is_programmable_region,
            max_host_mem_aperture: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn metadata(&self, kind: MetadataKind) -> Option<&Arc<[u8]>> {
        self.metadata.get(&kind)
    }

    /// Whether any metadata buffer is present.
    pub fn is_populated(&self) -> bool {
        !self.metadata.is_empty()
    }
}

/// Fixed-capacity table of slots, indexed by slot id.
#[derive(Debug)]
pub struct SlotRegistry {
    slots: Vec<Mutex<Option<Slot>>>,
}

impl SlotRegistry {
    pub fn new(capacity: u32) -> Self {
        SlotRegistry {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn lock(&self, slot_id: u32) -> Result<MutexGuard<'_, Option<Slot>>, SlotdError> {
        self.slots
            .get(slot_id as usize)
            .ok_or_else(|| {
                SlotdError::Argument(format!(
                    "slot {slot_id} does not exist, the device has {} slots",
                    self.slots.len()
                ))
            })?
            .lock()
            .map_err(|_| SlotdError::Internal(format!("slot {slot_id} table entry is poisoned")))
    }

    /// Discard the slot's structure, if any, and install an empty one with a nil id.
    ///
    /// # Returns: `Result<(), SlotdError>`
    /// * `Ok(())` - The slot is empty
    /// * `Err(SlotdError::ResourceExhausted)` - `slot_id` lies beyond the table's capacity
    pub fn reset_slot(&self, slot_id: u32, is_programmable_region: bool) -> Result<(), SlotdError> {
        if slot_id as usize >= self.slots.len() {
            return Err(SlotdError::ResourceExhausted(format!(
                "no room for slot {slot_id} in a table of {} slots",
                self.slots.len()
            )));
        }
        let mut entry = self.lock(slot_id)?;
        trace!("resetting slot {slot_id}");
        *entry = Some(Slot::new(slot_id, is_programmable_region));
        Ok(())
    }

    /// Reset the slot unless it already has a structure. Returns whether a reset happened.
    pub fn ensure_slot(&self, slot_id: u32, is_programmable_region: bool) -> Result<bool, SlotdError> {
        if slot_id as usize >= self.slots.len() {
            return self.reset_slot(slot_id, is_programmable_region).map(|_| true);
        }
        let mut entry = self.lock(slot_id)?;
        if entry.is_some() {
            return Ok(false);
        }
        trace!("first use of slot {slot_id}");
        *entry = Some(Slot::new(slot_id, is_programmable_region));
        Ok(true)
    }

    fn with_slot<T>(
        &self,
        guard: &WriteGuard<'_>,
        f: impl FnOnce(&mut Slot) -> T,
    ) -> Result<T, SlotdError> {
        let slot_id = guard.slot_id();
        let mut entry = self.lock(slot_id)?;
        let slot = entry.as_mut().ok_or_else(|| {
            SlotdError::Internal(format!("slot {slot_id} was never reset before use"))
        })?;
        Ok(f(slot))
    }

    /// Swap one metadata buffer, returning the previous one.
    pub fn replace_metadata(
        &self,
        guard: &WriteGuard<'_>,
        kind: MetadataKind,
        buffer: Option<Arc<[u8]>>,
    ) -> Result<Option<Arc<[u8]>>, SlotdError> {
        self.with_slot(guard, |slot| {
            trace!(
                "slot {}: replacing {kind} with {} bytes",
                slot.slot_id,
                buffer.as_ref().map_or(0, |b| b.len())
            );
            match buffer {
                Some(buffer) => slot.metadata.insert(kind, buffer),
                None => slot.metadata.remove(&kind),
            }
        })
    }

    /// Record `configuration_id` as loaded. This is the only way a slot gets a non-nil id.
    pub fn commit(
        &self,
        guard: &WriteGuard<'_>,
        configuration_id: ConfigurationId,
        max_host_mem_aperture: u64,
    ) -> Result<(), SlotdError> {
        self.with_slot(guard, |slot| {
            info!("slot {}: committed configuration {configuration_id}", slot.slot_id);
            slot.configuration_id = configuration_id;
            slot.max_host_mem_aperture = max_host_mem_aperture;
        })
    }

    /// Return the slot to the empty state: nil id and no metadata.
    pub fn rollback(&self, guard: &WriteGuard<'_>) -> Result<(), SlotdError> {
        self.with_slot(guard, |slot| {
            info!(
                "slot {}: rolled back from {}",
                slot.slot_id, slot.configuration_id
            );
            slot.configuration_id = ConfigurationId::nil();
            slot.max_host_mem_aperture = 0;
            slot.metadata.clear();
        })
    }

    /// Committed id of the slot. A slot that was never programmed reports nil.
    pub fn configuration_id(&self, slot_id: u32) -> Result<ConfigurationId, SlotdError> {
        Ok(self
            .lock(slot_id)?
            .as_ref()
            .map_or(ConfigurationId::nil(), |s| s.configuration_id))
    }

    /// Copy of the slot's current state. Metadata buffers are shared, not copied.
    pub fn snapshot(&self, slot_id: u32) -> Result<Option<Slot>, SlotdError> {
        Ok(self.lock(slot_id)?.clone())
    }
}
