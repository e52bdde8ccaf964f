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

//! Time-bounded cache of the values a client obtains from its privileged peer.

use crate::error::SlotdError;
use crate::peer::{PeerChannel, PeerValues};
use log::trace;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Cached {
    values: PeerValues,
    expires: Instant,
}

/// Holds the last [`PeerValues`] for a configurable time-to-live.
///
/// Concurrent callers that find the cache stale are serialised on the cache lock, so an expiry
/// results in exactly one fresh peer query.
#[derive(Debug)]
pub struct PeerValueCache {
    ttl: std::sync::RwLock<Duration>,
    cached: Mutex<Option<Cached>>,
}

impl PeerValueCache {
    pub fn new(ttl: Duration) -> Self {
        PeerValueCache {
            ttl: std::sync::RwLock::new(ttl),
            cached: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl.read().map_or(Duration::ZERO, |ttl| *ttl)
    }

    /// Change the time-to-live. Takes effect for values fetched from now on.
    pub fn set_ttl(&self, ttl: Duration) -> Result<(), SlotdError> {
        *self
            .ttl
            .write()
            .map_err(|_| SlotdError::Internal("cache lifetime lock is poisoned".into()))? = ttl;
        Ok(())
    }

    /// Current values, queried from `peer` only when the cached ones are missing or expired.
    pub async fn get(&self, peer: &dyn PeerChannel) -> Result<PeerValues, SlotdError> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref().filter(|c| Instant::now() < c.expires) {
            trace!("peer values served from cache");
            return Ok(entry.values.clone());
        }
        trace!("peer values expired, querying peer");
        let values = peer.peer_values().await?;
        *cached = Some(Cached {
            values: values.clone(),
            expires: Instant::now() + self.ttl(),
        });
        Ok(values)
    }

    /// Forget the cached values so the next [`get`](Self::get) queries the peer.
    pub async fn expire(&self) {
        trace!("expiring peer value cache");
        *self.cached.lock().await = None;
    }

    /// The cached values if still fresh, without querying anyone.
    pub async fn peek(&self) -> Option<PeerValues> {
        self.cached
            .lock()
            .await
            .as_ref()
            .filter(|c| Instant::now() < c.expires)
            .map(|c| c.values.clone())
    }
}
