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

//! Per-slot access arbitration.
//!
//! Each slot carries two independent protocols:
//!
//! * Exclusive (write) access for reprogramming. A second writer is refused with `Busy`. The
//!   writer that wins waits, without spinning, until every reader has left.
//! * Shared (read) access for status and metadata queries. Readers never queue: while a writer
//!   owns the slot they are refused with `Busy`.
//!
//! Independently of both, an in-use count tracks how many hardware consumers are bound to the
//! slot's committed configuration.
//!
//! Access is handed out as scoped guards. Dropping a [`WriteGuard`] or [`ReadGuard`] releases
//! it, so ownership cannot outlive the call that acquired it, including when the wait for
//! readers is interrupted.

use crate::config::InvariantPolicy;
use crate::error::SlotdError;
use crate::slot::{ConfigurationId, MetadataKind, Slot, SlotRegistry};
use log::{error, trace, warn};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Identity of whoever asked for exclusive access, e.g. a D-Bus unique name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requester(String);

impl From<&str> for Requester {
    fn from(value: &str) -> Self {
        Requester(value.to_string())
    }
}

impl From<String> for Requester {
    fn from(value: String) -> Self {
        Requester(value)
    }
}

impl Display for Requester {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default)]
struct AccessState {
    reader_count: u32,
    writer_owner: Option<Requester>,
    in_use_count: u32,
}

#[derive(Debug, Default)]
struct SlotAccess {
    state: Mutex<AccessState>,
    /// Signalled when the last reader departs.
    drained: Notify,
}

#[derive(Debug)]
pub struct SlotAccessController {
    slots: Vec<SlotAccess>,
    policy: InvariantPolicy,
}

impl SlotAccessController {
    pub fn new(slot_count: u32, policy: InvariantPolicy) -> Self {
        SlotAccessController {
            slots: (0..slot_count).map(|_| SlotAccess::default()).collect(),
            policy,
        }
    }

    fn slot(&self, slot_id: u32) -> Result<&SlotAccess, SlotdError> {
        self.slots.get(slot_id as usize).ok_or_else(|| {
            SlotdError::Argument(format!(
                "slot {slot_id} does not exist, the device has {} slots",
                self.slots.len()
            ))
        })
    }

    fn lock(&self, slot_id: u32) -> Result<MutexGuard<'_, AccessState>, SlotdError> {
        self.slot(slot_id)?
            .state
            .lock()
            .map_err(|_| SlotdError::Internal(format!("slot {slot_id} access state is poisoned")))
    }

    /// Take exclusive access to the slot, waiting for readers to drain.
    pub async fn acquire_write(
        &self,
        slot_id: u32,
        requester: Requester,
    ) -> Result<WriteGuard<'_>, SlotdError> {
        self.acquire_write_until(slot_id, requester, std::future::pending())
            .await
    }

    /// Like [`acquire_write`](Self::acquire_write), but gives up with `Interrupted` once
    /// `interrupt` completes. The ownership claim is released before the error is returned.
    ///
    /// # Returns: `Result<WriteGuard, SlotdError>`
    /// * `Ok(WriteGuard)` - Exclusive access with no readers present
    /// * `Err(SlotdError::Busy)` - Another writer owns the slot. Nothing was waited for.
    /// * `Err(SlotdError::Interrupted)` - `interrupt` fired while readers were still present
    pub async fn acquire_write_until(
        &self,
        slot_id: u32,
        requester: Requester,
        interrupt: impl Future<Output = ()>,
    ) -> Result<WriteGuard<'_>, SlotdError> {
        let access = self.slot(slot_id)?;
        {
            let mut state = self.lock(slot_id)?;
            if let Some(owner) = &state.writer_owner {
                return Err(SlotdError::Busy(format!(
                    "slot {slot_id} is being reprogrammed by {owner}"
                )));
            }
            state.writer_owner = Some(requester.clone());
        }
        trace!("slot {slot_id}: write access claimed by {requester}");
        let guard = WriteGuard {
            controller: self,
            slot_id,
            requester,
        };

        tokio::pin!(interrupt);
        loop {
            let drained = access.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            let readers = self.lock(slot_id)?.reader_count;
            if readers == 0 {
                return Ok(guard);
            }
            trace!("slot {slot_id}: waiting for {readers} readers to leave");
            tokio::select! {
                _ = &mut drained => {}
                _ = &mut interrupt => {
                    warn!("slot {slot_id}: wait for readers interrupted, releasing claim of {}", guard.requester);
                    return Err(SlotdError::Interrupted(format!(
                        "slot {slot_id} still had {readers} readers"
                    )));
                }
            }
        }
    }

    /// Clear write ownership. Normally called by dropping the [`WriteGuard`].
    pub fn release_write(&self, slot_id: u32, requester: &Requester) -> Result<(), SlotdError> {
        let mut state = self.lock(slot_id)?;
        match &state.writer_owner {
            Some(owner) if owner == requester => {
                state.writer_owner = None;
                trace!("slot {slot_id}: write access released by {requester}");
                Ok(())
            }
            owner => {
                let what = format!(
                    "slot {slot_id}: write access released by {requester} but owned by {owner:?}"
                );
                drop(state);
                Err(self.policy.violation(what))
            }
        }
    }

    /// Take shared access. Fails immediately while a writer owns the slot.
    pub fn acquire_read(&self, slot_id: u32) -> Result<ReadGuard<'_>, SlotdError> {
        let mut state = self.lock(slot_id)?;
        if let Some(owner) = &state.writer_owner {
            return Err(SlotdError::Busy(format!(
                "slot {slot_id} is being reprogrammed by {owner}"
            )));
        }
        state.reader_count += 1;
        Ok(ReadGuard {
            controller: self,
            slot_id,
        })
    }

    /// Drop one reader. Normally called by dropping the [`ReadGuard`].
    pub fn release_read(&self, slot_id: u32) -> Result<(), SlotdError> {
        let mut state = self.lock(slot_id)?;
        let Some(remaining) = state.reader_count.checked_sub(1) else {
            drop(state);
            return Err(self
                .policy
                .violation(format!("slot {slot_id}: reader count would become negative")));
        };
        state.reader_count = remaining;
        if remaining == 0 {
            self.slot(slot_id)?.drained.notify_waiters();
        }
        Ok(())
    }

    pub fn reader_count(&self, slot_id: u32) -> Result<u32, SlotdError> {
        Ok(self.lock(slot_id)?.reader_count)
    }

    pub fn writer_owner(&self, slot_id: u32) -> Result<Option<Requester>, SlotdError> {
        Ok(self.lock(slot_id)?.writer_owner.clone())
    }

    /// Bind one more consumer to the slot's committed configuration.
    ///
    /// Refused with `Busy` while the slot is being reprogrammed or when `configuration_id` is
    /// not the committed one.
    pub fn mark_in_use(
        &self,
        slot_id: u32,
        configuration_id: ConfigurationId,
        registry: &SlotRegistry,
    ) -> Result<u32, SlotdError> {
        let mut state = self.lock(slot_id)?;
        if let Some(owner) = &state.writer_owner {
            return Err(SlotdError::Busy(format!(
                "slot {slot_id} is being reprogrammed by {owner}"
            )));
        }
        let committed = registry.configuration_id(slot_id)?;
        if committed.is_nil() || committed != configuration_id {
            return Err(SlotdError::Busy(format!(
                "slot {slot_id} holds {committed}, not {configuration_id}"
            )));
        }
        state.in_use_count += 1;
        Ok(state.in_use_count)
    }

    /// Unbind one consumer. The id must be the committed one.
    pub fn mark_unused(
        &self,
        slot_id: u32,
        configuration_id: ConfigurationId,
        registry: &SlotRegistry,
    ) -> Result<u32, SlotdError> {
        let mut state = self.lock(slot_id)?;
        let committed = registry.configuration_id(slot_id)?;
        if committed != configuration_id {
            return Err(SlotdError::Argument(format!(
                "slot {slot_id} holds {committed}, not {configuration_id}"
            )));
        }
        let Some(remaining) = state.in_use_count.checked_sub(1) else {
            drop(state);
            return Err(self
                .policy
                .violation(format!("slot {slot_id}: in-use count would become negative")));
        };
        state.in_use_count = remaining;
        Ok(remaining)
    }

    /// Drop every consumer binding at once, returning how many there were.
    pub fn force_unused(&self, slot_id: u32) -> Result<u32, SlotdError> {
        let mut state = self.lock(slot_id)?;
        let previous = std::mem::take(&mut state.in_use_count);
        if previous > 0 {
            warn!("slot {slot_id}: forcing {previous} consumers off");
        }
        Ok(previous)
    }

    pub fn in_use_count(&self, slot_id: u32) -> Result<u32, SlotdError> {
        Ok(self.lock(slot_id)?.in_use_count)
    }
}

/// Exclusive access to one slot. Released on drop.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    controller: &'a SlotAccessController,
    slot_id: u32,
    requester: Requester,
}

impl WriteGuard<'_> {
    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    /// In-use count observed while holding exclusive access.
    pub fn in_use_count(&self) -> Result<u32, SlotdError> {
        self.controller.in_use_count(self.slot_id)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.controller.release_write(self.slot_id, &self.requester) {
            error!("failed to release write access: {e}");
        }
    }
}

/// Shared access to one slot. Released on drop.
#[derive(Debug)]
pub struct ReadGuard<'a> {
    controller: &'a SlotAccessController,
    slot_id: u32,
}

impl ReadGuard<'_> {
    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.controller.release_read(self.slot_id) {
            error!("failed to release read access: {e}");
        }
    }
}

/// A slot's committed state, readable for as long as shared access is held.
#[derive(Debug)]
pub struct MetadataView<'a> {
    _guard: ReadGuard<'a>,
    slot_id: u32,
    slot: Option<Slot>,
}

impl<'a> MetadataView<'a> {
    pub fn new(guard: ReadGuard<'a>, registry: &SlotRegistry) -> Result<Self, SlotdError> {
        let slot_id = guard.slot_id();
        let slot = registry.snapshot(slot_id)?;
        Ok(MetadataView {
            _guard: guard,
            slot_id,
            slot,
        })
    }

    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn configuration_id(&self) -> ConfigurationId {
        self.slot
            .as_ref()
            .map_or(ConfigurationId::nil(), |s| s.configuration_id)
    }

    pub fn metadata(&self, kind: MetadataKind) -> Option<Arc<[u8]>> {
        self.slot.as_ref()?.metadata(kind).cloned()
    }

    pub fn max_host_mem_aperture(&self) -> u64 {
        self.slot.as_ref().map_or(0, |s| s.max_host_mem_aperture)
    }
}
