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

//! Programming through the privileged peer, for functions that cannot touch the hardware.

use crate::cache::PeerValueCache;
use crate::error::SlotdError;
use crate::hardware::{ConsumerHandle, ConsumerRegistry};
use crate::peer::{PeerChannel, peer_timeout, with_deadline};
use crate::programming::{Attempt, Stage, UndoStack};
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Operation table of the client role.
pub struct ClientOps {
    pub peer: Arc<dyn PeerChannel>,
    pub cache: PeerValueCache,
    consumers: Arc<dyn ConsumerRegistry>,
    registered: Mutex<BTreeMap<u32, Vec<ConsumerHandle>>>,
}

impl ClientOps {
    pub fn new(
        peer: Arc<dyn PeerChannel>,
        consumers: Arc<dyn ConsumerRegistry>,
        cache_ttl: Duration,
    ) -> Self {
        ClientOps {
            peer,
            cache: PeerValueCache::new(cache_ttl),
            consumers,
            registered: Mutex::new(BTreeMap::new()),
        }
    }

    /// Unregister the compute units of `slot_id`'s committed configuration.
    pub fn unregister_consumers(&self, slot_id: u32) -> Result<(), SlotdError> {
        let handles = self
            .registered
            .lock()
            .map_err(|_| SlotdError::Internal("consumer ownership map is poisoned".into()))?
            .remove(&slot_id)
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = self.consumers.unregister(handle) {
                warn!("slot {slot_id}: could not unregister {handle:?}: {e}");
            }
        }
        Ok(())
    }

    /// Hand a validated attempt to the peer and mirror the result locally.
    pub async fn deliver(&self, attempt: &Attempt<'_>) -> Result<(), SlotdError> {
        let slot_id = attempt.slot_id();
        let in_use = attempt.guard.in_use_count()?;
        if in_use > 0 {
            return Err(SlotdError::Busy(format!(
                "slot {slot_id} has {in_use} local consumers"
            )));
        }

        let mut undo = UndoStack::default();
        match self.run(attempt, &mut undo).await {
            Ok(handles) => {
                undo.disarm();
                self.registered
                    .lock()
                    .map_err(|_| {
                        SlotdError::Internal("consumer ownership map is poisoned".into())
                    })?
                    .insert(slot_id, handles);
                Ok(())
            }
            Err(e) => {
                undo.unwind();
                attempt.roll_back(&e);
                // The peer may have rolled back too.
                self.cache.expire().await;
                Err(e)
            }
        }
    }

    async fn run<'s>(
        &'s self,
        attempt: &Attempt<'_>,
        undo: &mut UndoStack<'s>,
    ) -> Result<Vec<ConsumerHandle>, SlotdError> {
        let slot_id = attempt.slot_id();
        let wanted = attempt.image.configuration_id();
        // The old configuration is gone from the slot whatever happens next.
        self.unregister_consumers(slot_id)?;

        attempt.enter(Stage::RequestingPeer);
        let peer_has_it = self
            .cache
            .peek()
            .await
            .is_some_and(|values| values.configuration_id(slot_id) == wanted);
        if peer_has_it {
            info!("slot {slot_id}: peer already holds {wanted}, skipping download");
        } else {
            let bytes = attempt.image.bytes();
            let deadline = peer_timeout(
                &attempt.config.peer,
                bytes.len(),
                attempt.sections.calibrated_channels(),
            );
            info!("slot {slot_id}: sending {} bytes to peer, deadline {deadline:?}", bytes.len());
            with_deadline(deadline, "load_image", self.peer.load_image(slot_id, bytes)).await?;
            self.cache.expire().await;
        }

        attempt.enter(Stage::CachingMetadata);
        attempt.stage_metadata()?;

        attempt.enter(Stage::RegisteringConsumers);
        let consumers = &self.consumers;
        let mut handles = Vec::new();
        if let Some(layout) = &attempt.sections.ip_layout {
            for (index, kernel) in layout.kernels() {
                let arguments = attempt
                    .sections
                    .connectivity
                    .as_ref()
                    .map_or(0, |c| c.arguments_of(index));
                info!("slot {slot_id}: '{}' has {arguments} memory-connected arguments", kernel.name);
                let handle = consumers.register(slot_id, &kernel.name, kernel.base_address)?;
                undo.push(format!("unregister '{}'", kernel.name), move || {
                    consumers.unregister(handle)
                });
                handles.push(handle);
            }
        }

        attempt.commit()?;
        Ok(handles)
    }
}
