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

//! The programming state machine.
//!
//! An attempt is entered holding exclusive access to the slot and runs:
//!
//! ```text
//! Validating -> Privileged: Freezing -> Streaming -> Unfreezing -> RescalingClocks
//!                            -> CreatingAuxResources -> Calibrating -> Committed
//!            -> Client:     RequestingPeer -> CachingMetadata -> RegisteringConsumers -> Committed
//! ```
//!
//! Validation failures touch nothing. Any failure after validation unwinds what the attempt
//! created, in reverse order, and leaves the slot with a nil configuration id and no metadata.
//! [`SlotRegistry::commit`] is only reached once every step of the chosen path succeeded.

pub mod client;
pub mod privileged;
pub mod validate;

use crate::access::WriteGuard;
use crate::config::DaemonConfig;
use crate::error::SlotdError;
use crate::image::ConfigImage;
use crate::programming::validate::ParsedSections;
use crate::slot::{MetadataKind, SlotRegistry};
use log::{info, warn};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Freezing,
    Streaming,
    Unfreezing,
    RescalingClocks,
    CreatingAuxResources,
    Calibrating,
    RequestingPeer,
    CachingMetadata,
    RegisteringConsumers,
    Committed,
    RolledBack,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Validating => "validating",
            Stage::Freezing => "freezing",
            Stage::Streaming => "streaming",
            Stage::Unfreezing => "unfreezing",
            Stage::RescalingClocks => "rescaling clocks",
            Stage::CreatingAuxResources => "creating auxiliary resources",
            Stage::Calibrating => "calibrating",
            Stage::RequestingPeer => "requesting peer",
            Stage::CachingMetadata => "caching metadata",
            Stage::RegisteringConsumers => "registering consumers",
            Stage::Committed => "committed",
            Stage::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// Everything one programming attempt works with.
pub struct Attempt<'a> {
    pub guard: &'a WriteGuard<'a>,
    pub registry: &'a SlotRegistry,
    pub config: &'a DaemonConfig,
    pub image: &'a ConfigImage<'a>,
    pub sections: &'a ParsedSections,
    /// Whether calibration may keep memory contents when the topology is unchanged.
    pub data_retention: bool,
}

impl Attempt<'_> {
    pub fn slot_id(&self) -> u32 {
        self.guard.slot_id()
    }

    pub fn enter(&self, stage: Stage) {
        info!("slot {}: {stage}", self.slot_id());
    }

    /// Copy the image's metadata sections into the slot, replacing whatever was there.
    pub fn stage_metadata(&self) -> Result<(), SlotdError> {
        for kind in MetadataKind::ALL {
            let buffer = self.image.section(kind.section()).map(Arc::<[u8]>::from);
            self.registry.replace_metadata(self.guard, kind, buffer)?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<(), SlotdError> {
        let aperture = self
            .sections
            .mem_topology
            .as_ref()
            .map_or(0, |t| t.host_mem_aperture());
        self.registry
            .commit(self.guard, self.image.configuration_id(), aperture)?;
        self.enter(Stage::Committed);
        Ok(())
    }

    /// Return the slot to the empty state after a failure.
    pub fn roll_back(&self, cause: &SlotdError) {
        warn!("slot {}: attempt failed: {cause}", self.slot_id());
        if let Err(e) = self.registry.rollback(self.guard) {
            warn!("slot {}: rollback failed: {e}", self.slot_id());
        }
        self.enter(Stage::RolledBack);
    }
}

type UndoStep<'a> = Box<dyn FnOnce() -> Result<(), SlotdError> + Send + 'a>;

/// Compensating actions for the partial state an attempt created, run newest first.
#[derive(Default)]
pub struct UndoStack<'a> {
    steps: Vec<(String, UndoStep<'a>)>,
}

impl<'a> UndoStack<'a> {
    pub fn push(
        &mut self,
        what: impl Into<String>,
        step: impl FnOnce() -> Result<(), SlotdError> + Send + 'a,
    ) {
        self.steps.push((what.into(), Box::new(step)));
    }

    /// Drop the newest step without running it, because its effect was already reversed.
    pub fn pop(&mut self) {
        self.steps.pop();
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Forget every step: the attempt succeeded and its state is now owned elsewhere.
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    /// Run every step newest first. Failures are logged and do not stop the unwinding.
    pub fn unwind(mut self) {
        while let Some((what, step)) = self.steps.pop() {
            info!("undo: {what}");
            if let Err(e) = step() {
                warn!("undo of {what} failed: {e}");
            }
        }
    }
}
