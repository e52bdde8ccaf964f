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

//! In-memory collaborators for driving a whole [`Device`] in process.

use slotd::access::Requester;
use slotd::comm::dbus::peer_proxy::reply_error;
use slotd::config::DaemonConfig;
use slotd::device::{Collaborators, DEVICE_ID_MAGIC, Device};
use slotd::error::SlotdError;
use slotd::hardware::{
    ClockController, ConfigPort, ConsumerTable, FreezeGate, MemoryCalibration, RegisterAccess,
    ResourceTable,
};
use slotd::image::sections::encode;
use slotd::image::{ImageBuilder, SectionKind};
use slotd::peer::{PeerChannel, PeerFuture, PeerValues};
use slotd::programming::privileged::PrivilegedHardware;
use slotd::signature::Ed25519Verifier;
use slotd::slot::ConfigurationId;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zbus::fdo;

pub const IDCODE: u32 = 0x04b3_1093;

/// Ordered record of what the hardware was asked to do.
#[derive(Debug, Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn log(&self, event: impl Into<String>) {
        self.0.lock().expect("journal lock").push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().expect("journal lock").clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }
}

/// Identifier, version and idcode registers of a privileged function.
pub struct IdRegisters {
    pub version: u32,
}

impl RegisterAccess for IdRegisters {
    fn read32(&self, offset: u64) -> Result<u32, SlotdError> {
        Ok(match offset {
            0x0 => DEVICE_ID_MAGIC,
            0x4 => self.version,
            0x8 => IDCODE,
            _ => 0,
        })
    }

    fn write32(&self, _offset: u64, _value: u32) -> Result<(), SlotdError> {
        Ok(())
    }
}

pub struct RecordingGate {
    pub journal: Arc<Journal>,
}

impl FreezeGate for RecordingGate {
    fn freeze(&self) -> Result<(), SlotdError> {
        self.journal.log("freeze");
        Ok(())
    }

    fn unfreeze(&self) -> Result<(), SlotdError> {
        self.journal.log("unfreeze");
        Ok(())
    }
}

/// A configuration port whose FIFO takes `vacancy` words at a time and that reports done
/// once anything was streamed.
pub struct ScriptedPort {
    pub journal: Arc<Journal>,
    pub vacancy: AtomicU32,
    pub words: Mutex<Vec<u32>>,
}

impl ScriptedPort {
    pub fn new(journal: Arc<Journal>, vacancy: u32) -> Self {
        ScriptedPort {
            journal,
            vacancy: AtomicU32::new(vacancy),
            words: Mutex::new(Vec::new()),
        }
    }

    pub fn words(&self) -> Vec<u32> {
        self.words.lock().expect("port lock").clone()
    }
}

impl ConfigPort for ScriptedPort {
    fn vacancy(&self) -> Result<u32, SlotdError> {
        Ok(self.vacancy.load(Ordering::SeqCst))
    }

    fn write_words(&self, words: &[u32]) -> Result<(), SlotdError> {
        self.journal.log(format!("write {}", words.len()));
        self.words.lock().expect("port lock").extend_from_slice(words);
        Ok(())
    }

    fn start(&self) -> Result<(), SlotdError> {
        Ok(())
    }

    fn control(&self) -> Result<u32, SlotdError> {
        Ok(0)
    }

    fn status(&self) -> Result<u32, SlotdError> {
        Ok(if self.words.lock().expect("port lock").is_empty() {
            0
        } else {
            0x4
        })
    }
}

/// Clock generators that lock exactly on target.
#[derive(Default)]
pub struct ScriptedClocks {
    pub journal: Arc<Journal>,
    pub targets: Mutex<Vec<u16>>,
}

impl ClockController for ScriptedClocks {
    fn set_frequencies(&self, targets_mhz: &[u16]) -> Result<(), SlotdError> {
        self.journal.log(format!("clocks {targets_mhz:?}"));
        *self.targets.lock().expect("clock lock") = targets_mhz.to_vec();
        Ok(())
    }

    fn configured_frequencies(&self) -> Result<Vec<u16>, SlotdError> {
        Ok(self.targets.lock().expect("clock lock").clone())
    }

    fn measured_frequencies(&self) -> Result<Vec<u32>, SlotdError> {
        Ok(self
            .targets
            .lock()
            .expect("clock lock")
            .iter()
            .map(|mhz| u32::from(*mhz) * 1000)
            .collect())
    }
}

/// Calibration that finishes immediately, or never when `completes` is false.
pub struct ScriptedCalibration {
    pub journal: Arc<Journal>,
    pub completes: AtomicBool,
    pub runs: Mutex<Vec<(usize, bool)>>,
}

impl ScriptedCalibration {
    pub fn runs(&self) -> Vec<(usize, bool)> {
        self.runs.lock().expect("calibration lock").clone()
    }
}

impl MemoryCalibration for ScriptedCalibration {
    fn calibrate(&self, channels: usize, retain: bool) -> Result<(), SlotdError> {
        self.journal.log(format!("calibrate {channels}"));
        self.runs
            .lock()
            .expect("calibration lock")
            .push((channels, retain));
        Ok(())
    }

    fn status(&self) -> Result<u32, SlotdError> {
        Ok(u32::from(self.completes.load(Ordering::SeqCst)))
    }
}

/// A privileged device on mocked hardware, plus handles on every mock.
pub struct PrivilegedRig {
    pub device: Arc<Device>,
    pub journal: Arc<Journal>,
    pub port: Arc<ScriptedPort>,
    pub clocks: Arc<ScriptedClocks>,
    pub calibration: Arc<ScriptedCalibration>,
    pub resources: Arc<ResourceTable>,
}

pub fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.device.slot_count = 2;
    config
}

pub fn privileged_rig(version: u32) -> PrivilegedRig {
    privileged_rig_with(version, test_config(), Ed25519Verifier::default())
}

pub fn privileged_rig_with(
    version: u32,
    config: DaemonConfig,
    verifier: Ed25519Verifier,
) -> PrivilegedRig {
    let journal = Arc::new(Journal::default());
    let port = Arc::new(ScriptedPort::new(journal.clone(), 16));
    let clocks = Arc::new(ScriptedClocks {
        journal: journal.clone(),
        targets: Mutex::new(Vec::new()),
    });
    let calibration = Arc::new(ScriptedCalibration {
        journal: journal.clone(),
        completes: AtomicBool::new(true),
        runs: Mutex::new(Vec::new()),
    });
    let resources = Arc::new(ResourceTable::default());
    let hardware = PrivilegedHardware {
        gate: Arc::new(RecordingGate {
            journal: journal.clone(),
        }),
        port: port.clone(),
        clocks: Some(clocks.clone()),
        calibration: calibration.clone(),
        resources: resources.clone(),
    };
    let collaborators = Collaborators {
        registers: Some(Arc::new(IdRegisters { version })),
        hardware: Some(hardware),
        peer: None,
        consumers: Arc::new(ConsumerTable::default()),
        verifier: Arc::new(verifier),
    };
    PrivilegedRig {
        device: Arc::new(Device::attach(config, collaborators).expect("attach privileged")),
        journal,
        port,
        clocks,
        calibration,
        resources,
    }
}

/// What a client sees of `e` after it crossed the bus as a method error reply.
fn over_the_bus(e: SlotdError) -> SlotdError {
    reply_error(&fdo::Error::from(e))
}

/// Serves a client straight from a privileged [`Device`] in the same process.
pub struct InProcessPeer {
    pub device: Arc<Device>,
    pub loads: AtomicU32,
    pub queries: AtomicU32,
    /// Delay before every answer.
    pub latency: Duration,
}

impl InProcessPeer {
    pub fn new(device: Arc<Device>) -> Self {
        InProcessPeer {
            device,
            loads: AtomicU32::new(0),
            queries: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }
}

impl PeerChannel for InProcessPeer {
    fn load_image<'a>(&'a self, slot_id: u32, image: &'a [u8]) -> PeerFuture<'a, ()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(self.latency).await;
            self.device
                .program(slot_id, image, Requester::from(":1.client"))
                .await
                .map_err(over_the_bus)
        })
    }

    fn peer_values(&self) -> PeerFuture<'_, PeerValues> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(self.latency).await;
            self.device.peer_values().map_err(over_the_bus)
        })
    }
}

pub struct ClientRig {
    pub device: Arc<Device>,
    pub peer: Arc<InProcessPeer>,
    pub privileged: PrivilegedRig,
    pub consumers: Arc<ConsumerTable>,
}

pub fn client_rig(latency: Duration) -> ClientRig {
    let privileged = privileged_rig(2);
    let mut peer = InProcessPeer::new(privileged.device.clone());
    peer.latency = latency;
    let peer = Arc::new(peer);
    let consumers = Arc::new(ConsumerTable::default());
    let collaborators = Collaborators {
        registers: None,
        hardware: None,
        peer: Some(peer.clone()),
        consumers: consumers.clone(),
        verifier: Arc::new(Ed25519Verifier::default()),
    };
    ClientRig {
        device: Arc::new(Device::attach(test_config(), collaborators).expect("attach client")),
        peer,
        privileged,
        consumers,
    }
}

pub fn id(byte: u8) -> ConfigurationId {
    ConfigurationId::from_bytes([byte; 16])
}

/// A partial image with a bitstream, two calibrated banks, one host bank, a kernel, a memory
/// controller and two clocks.
pub fn full_image(configuration: u8) -> ImageBuilder {
    ImageBuilder::new(id(configuration))
        .platform("xilinx_u250_gen3x16_xdma_shell_4_1")
        .section(SectionKind::Bitstream, (0..40u8).collect())
        .section(
            SectionKind::MemTopology,
            encode::mem_topology(&[
                (1, true, 16 * 1024 * 1024, 0x40_0000_0000, "DDR[0]"),
                (1, true, 16 * 1024 * 1024, 0x50_0000_0000, "DDR[1]"),
                (3, true, 0, 0, "stream0"),
                (10, true, 256 * 1024, 0x0, "HOST[0]"),
            ]),
        )
        .section(
            SectionKind::IpLayout,
            encode::ip_layout(&[
                (1, 0x1800000, "vadd:vadd_1"),
                (3, 0x1810000, "ddr4_ctrl"),
            ]),
        )
        .section(
            SectionKind::ClockFreqTopology,
            encode::clock_topology(&[(300, 1, "DATA_CLK"), (500, 2, "KERNEL_CLK")]),
        )
}

/// An image with only a bitstream and no metadata that triggers calibration or resources.
pub fn bare_image(configuration: u8) -> ImageBuilder {
    ImageBuilder::new(id(configuration)).section(SectionKind::Bitstream, vec![0xaa; 8])
}
