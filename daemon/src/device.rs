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

//! The device context.
//!
//! A [`Device`] is created once by [`Device::attach`] and owns everything the daemon knows about
//! the accelerator: the slot table, the access controller, the security settings and the
//! operation table of its role. Every operation goes through it; there is no global state.
//!
//! # Role selection
//!
//! At attach time the identifier register of the register resource is compared against
//! [`DEVICE_ID_MAGIC`]. A match selects the privileged operation table, and the version register
//! then picks the hardware [`Generation`]. Without a register resource the client table is
//! selected and every hardware request goes to the privileged peer. A register resource that
//! does not identify itself correctly is a fatal [`SlotdError::Layout`] error. The choice is
//! never revisited.

use crate::access::{MetadataView, Requester, SlotAccessController};
use crate::config::{DaemonConfig, MAX_CACHE_EXPIRE_SECS};
use crate::error::SlotdError;
use crate::hardware::{ConsumerRegistry, RegisterAccess};
use crate::peer::{PeerChannel, PeerValues};
use crate::poller::check_register_layout;
use crate::programming::client::ClientOps;
use crate::programming::privileged::{PrivilegedHardware, PrivilegedOps};
use crate::programming::validate::{ValidationPolicy, validate};
use crate::programming::{Attempt, Stage};
use crate::signature::{SecurityLevel, SignatureVerifier};
use crate::slot::{ConfigurationId, MetadataKind, SlotRegistry};
use log::{info, trace, warn};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Value of the identifier register of a function that owns the hardware. ASCII "slot".
pub const DEVICE_ID_MAGIC: u32 = 0x736c_6f74;

const DETACH_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Privileged,
    Client,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Privileged => f.write_str("privileged"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Hardware generations the privileged role knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// A single fixed-clock region, programmed with flat images.
    Flat,
    /// Partitioned fabric with reprogrammable clocks.
    Partitioned,
}

impl Generation {
    pub fn from_version(version: u32) -> Result<Self, SlotdError> {
        match version {
            1 => Ok(Generation::Flat),
            2 => Ok(Generation::Partitioned),
            other => Err(SlotdError::Layout(format!(
                "unknown hardware generation {other}"
            ))),
        }
    }
}

/// Identify the hardware behind `regs`.
///
/// # Returns: `Result<Generation, SlotdError>`
/// * `Ok(Generation)` - The register resource belongs to a privileged function
/// * `Err(SlotdError::Layout)` - The identifier or version register holds an unexpected value
pub fn probe(regs: &dyn RegisterAccess, config: &DaemonConfig) -> Result<Generation, SlotdError> {
    let device = &config.device;
    check_register_layout(
        || regs.read32(device.id_register_offset),
        "device identifier",
        DEVICE_ID_MAGIC,
    )?;
    Generation::from_version(regs.read32(device.version_register_offset)?)
}

pub enum OperationTable {
    Privileged(PrivilegedOps),
    Client(ClientOps),
}

/// Everything outside the daemon a [`Device`] talks to.
pub struct Collaborators {
    /// Register resource of the privileged function, if this host has one.
    pub registers: Option<Arc<dyn RegisterAccess>>,
    /// Overrides the register-backed hardware collaborators.
    pub hardware: Option<PrivilegedHardware>,
    /// Channel to the privileged peer, needed in the client role.
    pub peer: Option<Arc<dyn PeerChannel>>,
    pub consumers: Arc<dyn ConsumerRegistry>,
    pub verifier: Arc<dyn SignatureVerifier>,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    security_level: SecurityLevel,
    data_retention: bool,
}

pub struct Device {
    config: DaemonConfig,
    registry: SlotRegistry,
    access: SlotAccessController,
    ops: OperationTable,
    verifier: Arc<dyn SignatureVerifier>,
    settings: RwLock<Settings>,
    shutdown: watch::Sender<bool>,
    detached: AtomicBool,
}

impl Device {
    /// Probe the hardware, select the operation table and build the context.
    pub fn attach(config: DaemonConfig, collaborators: Collaborators) -> Result<Self, SlotdError> {
        let Collaborators {
            registers,
            hardware,
            peer,
            consumers,
            verifier,
        } = collaborators;
        let ops = match (registers, peer) {
            (Some(registers), _) => {
                let generation = probe(registers.as_ref(), &config)?;
                info!("attached as privileged function, {generation:?} generation");
                let hardware = hardware.unwrap_or_else(|| {
                    PrivilegedHardware::from_registers(registers.clone(), &config.device)
                });
                OperationTable::Privileged(PrivilegedOps::new(registers, hardware, generation))
            }
            (None, Some(peer)) => {
                info!("attached as client function, peer at {}", config.peer.service);
                OperationTable::Client(ClientOps::new(peer, consumers, config.cache_expire))
            }
            (None, None) => {
                return Err(SlotdError::Argument(
                    "a device needs either a register resource or a peer".into(),
                ));
            }
        };
        let settings = Settings {
            security_level: config.security.level,
            data_retention: config.calibration.data_retention,
        };
        Ok(Device {
            registry: SlotRegistry::new(config.device.slot_count),
            access: SlotAccessController::new(config.device.slot_count, config.invariant_policy),
            ops,
            verifier,
            settings: RwLock::new(settings),
            shutdown: watch::Sender::new(false),
            detached: AtomicBool::new(false),
            config,
        })
    }

    pub fn role(&self) -> Role {
        match self.ops {
            OperationTable::Privileged(_) => Role::Privileged,
            OperationTable::Client(_) => Role::Client,
        }
    }

    pub fn generation(&self) -> Option<Generation> {
        match &self.ops {
            OperationTable::Privileged(ops) => Some(ops.generation),
            OperationTable::Client(_) => None,
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.registry.capacity()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    fn settings(&self) -> Result<Settings, SlotdError> {
        self.settings
            .read()
            .map(|s| *s)
            .map_err(|_| SlotdError::Internal("device settings lock is poisoned".into()))
    }

    fn update_settings(&self, f: impl FnOnce(&mut Settings)) -> Result<(), SlotdError> {
        let mut settings = self
            .settings
            .write()
            .map_err(|_| SlotdError::Internal("device settings lock is poisoned".into()))?;
        f(&mut settings);
        Ok(())
    }

    fn ensure_attached(&self) -> Result<(), SlotdError> {
        if self.detached.load(Ordering::Acquire) {
            return Err(SlotdError::Argument("device is detached".into()));
        }
        Ok(())
    }

    /// Completes once [`shutdown`](Self::shutdown) was called.
    fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stop = self.shutdown.subscribe();
        async move {
            let _ = stop.wait_for(|stop| *stop).await;
        }
    }

    /// Interrupt every writer still waiting for readers to drain.
    pub fn shutdown(&self) {
        info!("shutting down, interrupting waiting writers");
        self.shutdown.send_replace(true);
    }

    /// Program `slot_id` with `bytes` on behalf of `requester`.
    ///
    /// # Returns: `Result<(), SlotdError>`
    /// * `Ok(())` - The image is committed, or was already
    /// * `Err(SlotdError::Busy)` - Another writer owns the slot or consumers are bound to it.
    ///   Nothing changed.
    /// * `Err(SlotdError::InvalidImage | IncompatibleInterface | SignatureRejected)` - Rejected
    ///   before any hardware was touched. Nothing changed.
    /// * `Err(SlotdError::ResourceExhausted)` - `slot_id` is beyond the slot table
    /// * `Err(SlotdError::Timeout | Hardware | Peer)` - Bring-up failed and the slot was rolled
    ///   back to the empty state
    pub async fn program(
        &self,
        slot_id: u32,
        bytes: &[u8],
        requester: Requester,
    ) -> Result<(), SlotdError> {
        if slot_id >= self.registry.capacity() {
            return Err(SlotdError::ResourceExhausted(format!(
                "slot {slot_id} is beyond the {} slots of this device",
                self.registry.capacity()
            )));
        }
        self.ensure_attached()?;
        info!("slot {slot_id}: programming {} bytes for {requester}", bytes.len());
        let guard = self
            .access
            .acquire_write_until(slot_id, requester, self.shutdown_signal())
            .await?;
        // Detach may have drained this slot while we waited.
        self.ensure_attached()?;
        self.registry
            .ensure_slot(slot_id, self.config.device.is_programmable(slot_id))?;
        let in_use = guard.in_use_count()?;
        if in_use > 0 {
            return Err(SlotdError::Busy(format!(
                "slot {slot_id} is in use by {in_use} consumers"
            )));
        }

        info!("slot {slot_id}: {}", Stage::Validating);
        let settings = self.settings()?;
        let (image, sections) = validate(
            bytes,
            ValidationPolicy {
                security_level: settings.security_level,
                verifier: self.verifier.as_ref(),
                baseline: self.config.device.interface_uuid.as_ref(),
            },
        )?;

        let attempt = Attempt {
            guard: &guard,
            registry: &self.registry,
            config: &self.config,
            image: &image,
            sections: &sections,
            data_retention: settings.data_retention,
        };
        match &self.ops {
            OperationTable::Privileged(ops) => {
                if self.already_loaded(slot_id, image.configuration_id())? {
                    info!(
                        "slot {slot_id}: {} is already loaded",
                        image.configuration_id()
                    );
                    return Ok(());
                }
                ops.bring_up(&attempt).await
            }
            OperationTable::Client(ops) => ops.deliver(&attempt).await,
        }
    }

    fn already_loaded(&self, slot_id: u32, wanted: ConfigurationId) -> Result<bool, SlotdError> {
        Ok(self.registry.snapshot(slot_id)?.is_some_and(|slot| {
            !slot.configuration_id.is_nil()
                && slot.configuration_id == wanted
                && slot.is_populated()
        }))
    }

    pub fn mark_in_use(&self, slot_id: u32, id: ConfigurationId) -> Result<u32, SlotdError> {
        self.ensure_attached()?;
        self.access.mark_in_use(slot_id, id, &self.registry)
    }

    pub fn mark_unused(&self, slot_id: u32, id: ConfigurationId) -> Result<u32, SlotdError> {
        self.ensure_attached()?;
        self.access.mark_unused(slot_id, id, &self.registry)
    }

    /// Shared access to the slot's committed state. Fails with `Busy` while it is reprogrammed.
    pub fn acquire_read(&self, slot_id: u32) -> Result<MetadataView<'_>, SlotdError> {
        self.ensure_attached()?;
        MetadataView::new(self.access.acquire_read(slot_id)?, &self.registry)
    }

    pub fn query_configuration_id(&self, slot_id: u32) -> Result<ConfigurationId, SlotdError> {
        Ok(self.acquire_read(slot_id)?.configuration_id())
    }

    pub fn reader_count(&self, slot_id: u32) -> Result<u32, SlotdError> {
        self.access.reader_count(slot_id)
    }

    pub fn in_use_count(&self, slot_id: u32) -> Result<u32, SlotdError> {
        self.access.in_use_count(slot_id)
    }

    pub fn max_host_mem_aperture(&self, slot_id: u32) -> Result<u64, SlotdError> {
        Ok(self.acquire_read(slot_id)?.max_host_mem_aperture())
    }

    /// Hex dump of one metadata buffer of the committed configuration.
    pub fn metadata_hex(&self, slot_id: u32, kind: MetadataKind) -> Result<String, SlotdError> {
        let view = self.acquire_read(slot_id)?;
        view.metadata(kind)
            .map(hex::encode)
            .ok_or_else(|| SlotdError::Argument(format!("slot {slot_id} has no {kind}")))
    }

    async fn peer_snapshot(&self, ops: &ClientOps) -> Result<PeerValues, SlotdError> {
        ops.cache.get(ops.peer.as_ref()).await
    }

    /// Configured clock targets in MHz.
    pub async fn clock_frequencies(&self, slot_id: u32) -> Result<Vec<u16>, SlotdError> {
        let _view = self.acquire_read(slot_id)?;
        match &self.ops {
            OperationTable::Privileged(ops) => match &ops.hardware.clocks {
                Some(clocks) => clocks.configured_frequencies(),
                None => Err(SlotdError::NotSupported("clocks are fixed on this device".into())),
            },
            OperationTable::Client(ops) => Ok(self.peer_snapshot(ops).await?.clock_freqs_mhz),
        }
    }

    /// Configured target of clock `index` in MHz.
    pub async fn query_clock(&self, slot_id: u32, index: usize) -> Result<u16, SlotdError> {
        let clocks = self.clock_frequencies(slot_id).await?;
        clocks.get(index).copied().ok_or_else(|| {
            SlotdError::Argument(format!("clock {index} does not exist, there are {}", clocks.len()))
        })
    }

    /// Frequencies measured by the clock counters in kHz.
    pub async fn measured_frequencies(&self, slot_id: u32) -> Result<Vec<u32>, SlotdError> {
        let _view = self.acquire_read(slot_id)?;
        match &self.ops {
            OperationTable::Privileged(ops) => match &ops.hardware.clocks {
                Some(clocks) => clocks.measured_frequencies(),
                None => Err(SlotdError::NotSupported("clocks are fixed on this device".into())),
            },
            OperationTable::Client(ops) => Ok(self.peer_snapshot(ops).await?.freq_counters_khz),
        }
    }

    pub async fn query_calibration_status(&self, slot_id: u32) -> Result<u32, SlotdError> {
        let _view = self.acquire_read(slot_id)?;
        match &self.ops {
            OperationTable::Privileged(ops) => ops.hardware.calibration.status(),
            OperationTable::Client(ops) => Ok(self.peer_snapshot(ops).await?.calibration_status),
        }
    }

    /// Chip identifier code.
    pub async fn idcode(&self) -> Result<u32, SlotdError> {
        match &self.ops {
            OperationTable::Privileged(ops) => ops
                .registers
                .read32(self.config.device.idcode_register_offset),
            OperationTable::Client(ops) => Ok(self.peer_snapshot(ops).await?.idcode),
        }
    }

    pub async fn data_retention(&self) -> Result<bool, SlotdError> {
        match &self.ops {
            OperationTable::Privileged(_) => Ok(self.settings()?.data_retention),
            OperationTable::Client(ops) => Ok(self.peer_snapshot(ops).await?.data_retention),
        }
    }

    /// Only the function that calibrates memory can change whether it retains data.
    pub fn set_data_retention(&self, enabled: bool) -> Result<(), SlotdError> {
        if self.role() != Role::Privileged {
            return Err(SlotdError::NotSupported(
                "data retention is set on the privileged function".into(),
            ));
        }
        info!("data retention {}", if enabled { "enabled" } else { "disabled" });
        self.update_settings(|s| s.data_retention = enabled)
    }

    pub fn security_level(&self) -> Result<SecurityLevel, SlotdError> {
        Ok(self.settings()?.security_level)
    }

    pub fn set_security_level(&self, level: SecurityLevel) -> Result<(), SlotdError> {
        info!("security level set to {level}");
        self.update_settings(|s| s.security_level = level)
    }

    /// Change how long peer values are cached, in seconds.
    pub fn set_cache_ttl(&self, secs: u64) -> Result<(), SlotdError> {
        let OperationTable::Client(ops) = &self.ops else {
            return Err(SlotdError::NotSupported(
                "only a client caches peer values".into(),
            ));
        };
        if secs > MAX_CACHE_EXPIRE_SECS {
            return Err(SlotdError::Argument(format!(
                "cache lifetime must be at most {MAX_CACHE_EXPIRE_SECS}s, got {secs}"
            )));
        }
        ops.cache.set_ttl(Duration::from_secs(secs))
    }

    /// The values the privileged function reports to its clients.
    pub fn peer_values(&self) -> Result<PeerValues, SlotdError> {
        let OperationTable::Privileged(ops) = &self.ops else {
            return Err(SlotdError::NotSupported(
                "only the privileged function serves peer values".into(),
            ));
        };
        let (clock_freqs_mhz, freq_counters_khz) = match &ops.hardware.clocks {
            Some(clocks) => (
                clocks.configured_frequencies()?,
                clocks.measured_frequencies()?,
            ),
            None => (Vec::new(), Vec::new()),
        };
        Ok(PeerValues {
            clock_freqs_mhz,
            freq_counters_khz,
            idcode: ops
                .registers
                .read32(self.config.device.idcode_register_offset)?,
            configuration_ids: (0..self.registry.capacity())
                .map(|slot_id| self.registry.configuration_id(slot_id))
                .collect::<Result<_, _>>()?,
            calibration_status: ops.hardware.calibration.status()?,
            data_retention: self.settings()?.data_retention,
        })
    }

    /// Drain every slot and release what its configuration holds.
    ///
    /// Takes write access on each slot in turn, waiting for readers and retrying while another
    /// writer finishes, then drops consumer bindings and auxiliary resources. Afterwards every
    /// slot operation fails with `Argument`.
    pub async fn detach(&self) -> Result<(), SlotdError> {
        info!("detaching device");
        self.detached.store(true, Ordering::Release);
        for slot_id in 0..self.registry.capacity() {
            let _guard = loop {
                match self.access.acquire_write(slot_id, "detach".into()).await {
                    Ok(guard) => break guard,
                    Err(SlotdError::Busy(owner)) => {
                        trace!("slot {slot_id}: waiting for writer to finish: {owner}");
                        tokio::time::sleep(DETACH_RETRY).await;
                    }
                    Err(e) => return Err(e),
                }
            };
            let dropped = self.access.force_unused(slot_id)?;
            if dropped > 0 {
                warn!("slot {slot_id}: dropped {dropped} consumer bindings");
            }
            match &self.ops {
                OperationTable::Privileged(ops) => ops.release_resources(slot_id)?,
                OperationTable::Client(ops) => ops.unregister_consumers(slot_id)?,
            }
        }
        info!("device detached");
        Ok(())
    }
}
