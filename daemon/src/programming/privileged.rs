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

//! Bring-up of a slot on the function that owns the hardware.

use crate::config::DeviceConfig;
use crate::device::Generation;
use crate::error::SlotdError;
use crate::hardware::registers::{
    RegisterCalibration, RegisterClocks, RegisterConfigPort, RegisterGate,
};
use crate::hardware::{
    AuxResourceKind, CALIBRATION_DONE, CONFIG_PORT_DONE_MASK, CONFIG_PORT_START, ClockController,
    ConfigPort, FreezeGate, MemoryCalibration, RegisterAccess, ResourceFactory, ResourceHandle,
    ResourceTable,
};
use crate::image::{ImageMode, SectionKind};
use crate::poller::{poll_for, poll_until};
use crate::programming::{Attempt, Stage, UndoStack};
use crate::slot::MetadataKind;
use log::{info, trace, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// The hardware collaborators the privileged path drives.
#[derive(Clone)]
pub struct PrivilegedHardware {
    pub gate: Arc<dyn FreezeGate>,
    pub port: Arc<dyn ConfigPort>,
    /// Absent on fixed-clock platforms.
    pub clocks: Option<Arc<dyn ClockController>>,
    pub calibration: Arc<dyn MemoryCalibration>,
    pub resources: Arc<dyn ResourceFactory>,
}

impl PrivilegedHardware {
    /// Collaborators backed by the register blocks of `regs`.
    pub fn from_registers(regs: Arc<dyn RegisterAccess>, config: &DeviceConfig) -> Self {
        PrivilegedHardware {
            gate: Arc::new(RegisterGate::new(regs.clone(), config.gate_base)),
            port: Arc::new(RegisterConfigPort::new(regs.clone(), config.config_port_base)),
            clocks: Some(Arc::new(RegisterClocks::new(regs.clone(), config.clock_base))),
            calibration: Arc::new(RegisterCalibration::new(regs, config.calibration_base)),
            resources: Arc::new(ResourceTable::default()),
        }
    }
}

/// Operation table of the privileged role.
pub struct PrivilegedOps {
    pub registers: Arc<dyn RegisterAccess>,
    pub hardware: PrivilegedHardware,
    pub generation: Generation,
    /// Serialises everything that touches shared hardware: the gate and the port are
    /// coarser than a slot.
    hw_lock: AsyncMutex<()>,
    /// Auxiliary resources created for each slot's committed configuration.
    owned: Mutex<BTreeMap<u32, Vec<ResourceHandle>>>,
}

impl PrivilegedOps {
    pub fn new(
        registers: Arc<dyn RegisterAccess>,
        hardware: PrivilegedHardware,
        generation: Generation,
    ) -> Self {
        PrivilegedOps {
            registers,
            hardware,
            generation,
            hw_lock: AsyncMutex::new(()),
            owned: Mutex::new(BTreeMap::new()),
        }
    }

    /// Destroy the auxiliary resources of `slot_id`'s committed configuration.
    pub fn release_resources(&self, slot_id: u32) -> Result<(), SlotdError> {
        let handles = self
            .owned
            .lock()
            .map_err(|_| SlotdError::Internal("resource ownership map is poisoned".into()))?
            .remove(&slot_id)
            .unwrap_or_default();
        for handle in handles.into_iter().rev() {
            if let Err(e) = self.hardware.resources.destroy(handle) {
                warn!("slot {slot_id}: could not destroy {handle:?}: {e}");
            }
        }
        Ok(())
    }

    pub fn owned_resources(&self, slot_id: u32) -> Vec<ResourceHandle> {
        self.owned
            .lock()
            .map(|owned| owned.get(&slot_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Run the privileged path for a validated attempt and commit it, or roll it back.
    pub async fn bring_up(&self, attempt: &Attempt<'_>) -> Result<(), SlotdError> {
        let _hw = self.hw_lock.lock().await;
        let slot_id = attempt.slot_id();
        let previous_topology = attempt.registry.snapshot(slot_id)?.and_then(|slot| {
            slot.metadata(MetadataKind::MemTopology)
                .or_else(|| slot.metadata(MetadataKind::GroupTopology))
                .cloned()
        });
        // The old configuration is going away whatever happens next.
        self.release_resources(slot_id)?;

        let mut undo = UndoStack::default();
        match self
            .run(attempt, previous_topology.as_deref(), &mut undo)
            .await
        {
            Ok(handles) => {
                undo.disarm();
                self.owned
                    .lock()
                    .map_err(|_| {
                        SlotdError::Internal("resource ownership map is poisoned".into())
                    })?
                    .insert(slot_id, handles);
                Ok(())
            }
            Err(e) => {
                undo.unwind();
                attempt.roll_back(&e);
                Err(e)
            }
        }
    }

    async fn run<'s>(
        &'s self,
        attempt: &Attempt<'_>,
        previous_topology: Option<&[u8]>,
        undo: &mut UndoStack<'s>,
    ) -> Result<Vec<ResourceHandle>, SlotdError> {
        let gate = &self.hardware.gate;

        attempt.enter(Stage::Freezing);
        gate.freeze()?;
        undo.push("unfreeze gate", || gate.unfreeze());

        if attempt.image.header().mode == ImageMode::Flat {
            info!("slot {}: flat image, nothing to stream", attempt.slot_id());
        } else {
            attempt.enter(Stage::Streaming);
            self.stream(attempt).await?;
        }

        attempt.enter(Stage::Unfreezing);
        undo.pop();
        gate.unfreeze()?;

        attempt.enter(Stage::RescalingClocks);
        self.rescale_clocks(attempt)?;

        attempt.enter(Stage::CreatingAuxResources);
        let handles = self.create_resources(attempt, undo)?;

        attempt.enter(Stage::Calibrating);
        self.calibrate(attempt, previous_topology).await?;

        attempt.stage_metadata()?;
        attempt.commit()?;
        Ok(handles)
    }

    /// Push the bitstream through the configuration port in chunks the FIFO can take.
    async fn stream(&self, attempt: &Attempt<'_>) -> Result<(), SlotdError> {
        let Some(payload) = [
            SectionKind::Bitstream,
            SectionKind::PartialPdi,
            SectionKind::Pdi,
        ]
        .into_iter()
        .find_map(|kind| attempt.image.section(kind)) else {
            info!("slot {}: image carries no bitstream", attempt.slot_id());
            return Ok(());
        };
        let port = &self.hardware.port;
        let interval = attempt.config.config_port.poll_interval;
        let timeout = attempt.config.config_port.poll_timeout;
        let words = to_words(payload);
        trace!("streaming {} words", words.len());

        let mut rest = words.as_slice();
        while !rest.is_empty() {
            let vacancy = poll_for(|| port.vacancy(), |v| v > 0, interval, timeout)
                .await
                .map_err(|e| stream_error("write FIFO never drained", e))?;
            let (chunk, tail) = rest.split_at((vacancy as usize).min(rest.len()));
            port.write_words(chunk)?;
            port.start()?;
            poll_until(|| port.control(), CONFIG_PORT_START, 0, interval, timeout)
                .await
                .map_err(|e| stream_error("transfer never completed", e))?;
            rest = tail;
        }
        poll_for(
            || port.status(),
            |status| status & CONFIG_PORT_DONE_MASK != 0,
            interval,
            timeout,
        )
        .await
        .map_err(|e| stream_error("configuration never reported done", e))?;
        Ok(())
    }

    fn rescale_clocks(&self, attempt: &Attempt<'_>) -> Result<(), SlotdError> {
        let slot_id = attempt.slot_id();
        let (Some(topology), Some(clocks)) = (&attempt.sections.clocks, &self.hardware.clocks)
        else {
            trace!("slot {slot_id}: no clock topology or no clock controller");
            return Ok(());
        };
        if self.generation == Generation::Flat
            || !attempt.config.device.is_programmable(slot_id)
        {
            trace!("slot {slot_id}: clocks are fixed");
            return Ok(());
        }
        clocks.set_frequencies(&topology.targets())
    }

    fn create_resources<'s>(
        &'s self,
        attempt: &Attempt<'_>,
        undo: &mut UndoStack<'s>,
    ) -> Result<Vec<ResourceHandle>, SlotdError> {
        let mut wanted = Vec::new();
        if let Some(layout) = &attempt.sections.ip_layout {
            wanted.extend(layout.entries.iter().filter_map(|ip| {
                AuxResourceKind::for_ip(ip.kind).map(|kind| (kind, ip.base_address, &ip.name))
            }));
        }
        if let Some(layout) = &attempt.sections.debug_ip_layout {
            wanted.extend(layout.entries.iter().map(|ip| {
                (
                    AuxResourceKind::DebugMonitor(ip.debug_type),
                    ip.base_address,
                    &ip.name,
                )
            }));
        }

        let resources = &self.hardware.resources;
        let mut handles = Vec::with_capacity(wanted.len());
        for (kind, base_address, name) in wanted {
            let handle = resources.create(kind, base_address, name)?;
            undo.push(format!("destroy {kind} '{name}'"), move || {
                resources.destroy(handle)
            });
            handles.push(handle);
        }
        Ok(handles)
    }

    async fn calibrate(
        &self,
        attempt: &Attempt<'_>,
        previous_topology: Option<&[u8]>,
    ) -> Result<(), SlotdError> {
        let slot_id = attempt.slot_id();
        let channels = attempt.sections.calibrated_channels();
        if channels == 0 {
            info!("slot {slot_id}: no memory channels to calibrate");
            return Ok(());
        }
        let unchanged = previous_topology.is_some()
            && previous_topology == attempt.sections.mem_topology_bytes.as_deref();
        let retain = attempt.data_retention && unchanged;
        if attempt.data_retention && !unchanged {
            warn!("slot {slot_id}: memory topology changed, data retention disabled");
        }

        let calibration = &self.hardware.calibration;
        calibration.calibrate(channels, retain)?;
        let settings = attempt.config.calibration;
        poll_until(
            || calibration.status(),
            CALIBRATION_DONE,
            CALIBRATION_DONE,
            settings.poll_interval,
            settings.poll_interval * settings.poll_count,
        )
        .await
        .map_err(|e| match e {
            SlotdError::Timeout(detail) => SlotdError::Timeout(format!(
                "slot {slot_id}: calibration of {channels} channels did not finish: {detail}"
            )),
            other => other,
        })?;
        info!("slot {slot_id}: calibrated {channels} channels (retain: {retain})");
        Ok(())
    }
}

/// Bitstream bytes as the big-endian words the port consumes. A trailing partial word is
/// zero padded.
fn to_words(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_be_bytes(word)
        })
        .collect()
}

fn stream_error(what: &str, e: SlotdError) -> SlotdError {
    match e {
        SlotdError::Timeout(detail) => SlotdError::Timeout(format!("{what}: {detail}")),
        other => other,
    }
}
