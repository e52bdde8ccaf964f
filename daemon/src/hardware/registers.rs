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

//! Collaborators backed by a mapped register resource of the privileged function.

use crate::error::SlotdError;
use crate::hardware::{
    CONFIG_PORT_START, ClockController, ConfigPort, FreezeGate, MemoryCalibration,
    RegisterAccess,
};
use crate::system_io::fs_open_registers;
use log::{info, trace, warn};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const GATE_WRITE: u64 = 0x0;
const GATE_READ: u64 = 0x8;
const GATE_FREEZE: u32 = 0xc;
const GATE_RELEASE_SEQUENCE: [u32; 4] = [0xe, 0xc, 0xe, 0xf];

const PORT_WRITE_FIFO: u64 = 0x100;
const PORT_CONTROL: u64 = 0x10c;
const PORT_STATUS: u64 = 0x110;
const PORT_VACANCY: u64 = 0x114;

const CALIBRATION_STATUS: u64 = 0x0;
const CALIBRATION_CONTROL: u64 = 0x4;
const CALIBRATION_RUN: u32 = 0x1;
const CALIBRATION_RETAIN: u32 = 0x2;

const CLOCK_COUNT: u64 = 4;
const CLOCK_MEASURED: u64 = 0x40;

/// A register resource, such as a PCI BAR exposed through sysfs, mapped into the daemon.
///
/// Every access is one aligned, bounds-checked volatile 32-bit read or write of the mapping.
pub struct RegisterFile {
    path: PathBuf,
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is owned by this value and stays valid until drop. Accesses are single
// volatile words, which the hardware serialises, so sharing across threads is sound.
unsafe impl Send for RegisterFile {}
unsafe impl Sync for RegisterFile {}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterFile")
            .field("path", &self.path)
            .field("base", &format_args!("{:p}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

impl RegisterFile {
    /// Map the whole of the resource at `path` shared and read-write.
    pub fn open(path: &Path) -> Result<Self, SlotdError> {
        let file = fs_open_registers(path)?;
        let len = file
            .metadata()
            .map_err(|e| SlotdError::IORead {
                file: path.into(),
                e,
            })?
            .len();
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len >= 4)
            .ok_or_else(|| {
                SlotdError::Argument(format!("{path:?} is {len} bytes, too small for registers"))
            })?;
        // SAFETY: a fresh shared mapping of `len` bytes of an open file; the kernel returns
        // either a valid region or an error, and nothing else refers to it.
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| SlotdError::IORead {
            file: path.into(),
            e: e.into(),
        })?;
        info!("mapped {path:?} at {base:p}, {len:#x} bytes");
        Ok(RegisterFile {
            path: path.to_path_buf(),
            base: base.cast(),
            len,
        })
    }

    /// Pointer to the word at `offset`, if it lies aligned and whole inside the mapping.
    fn word(&self, offset: u64) -> Result<*mut u32, SlotdError> {
        let index = usize::try_from(offset)
            .ok()
            .filter(|o| o % 4 == 0 && o.checked_add(4).is_some_and(|end| end <= self.len))
            .ok_or_else(|| {
                SlotdError::Argument(format!(
                    "register {offset:#x} is unaligned or outside the {:#x} bytes of {:?}",
                    self.len, self.path
                ))
            })?;
        // SAFETY: index + 4 <= len, so the word is inside the mapping.
        Ok(unsafe { self.base.add(index) }.cast())
    }
}

impl RegisterAccess for RegisterFile {
    fn read32(&self, offset: u64) -> Result<u32, SlotdError> {
        let word = self.word(offset)?;
        // SAFETY: `word` is aligned and inside the live mapping.
        let value = unsafe { std::ptr::read_volatile(word) };
        trace!("{:?}[{offset:#x}] -> {value:#010x}", self.path);
        Ok(value)
    }

    fn write32(&self, offset: u64, value: u32) -> Result<(), SlotdError> {
        let word = self.word(offset)?;
        trace!("{:?}[{offset:#x}] <- {value:#010x}", self.path);
        // SAFETY: `word` is aligned and inside the live mapping.
        unsafe { std::ptr::write_volatile(word, value) };
        Ok(())
    }
}

impl Drop for RegisterFile {
    fn drop(&mut self) {
        // SAFETY: `base` and `len` describe the mapping made in `open`, unmapped only here.
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            warn!("could not unmap {:?}: {e}", self.path);
        }
    }
}

/// A block of registers at a fixed base inside a register resource.
#[derive(Clone)]
struct Block {
    regs: Arc<dyn RegisterAccess>,
    base: u64,
}

impl Block {
    fn read(&self, offset: u64) -> Result<u32, SlotdError> {
        self.regs.read32(self.base + offset)
    }

    fn write(&self, offset: u64, value: u32) -> Result<(), SlotdError> {
        self.regs.write32(self.base + offset, value)
    }
}

pub struct RegisterGate(Block);

impl RegisterGate {
    pub fn new(regs: Arc<dyn RegisterAccess>, base: u64) -> Self {
        RegisterGate(Block { regs, base })
    }
}

impl FreezeGate for RegisterGate {
    fn freeze(&self) -> Result<(), SlotdError> {
        info!("freezing gate at {:#x}", self.0.base);
        self.0.write(GATE_WRITE, GATE_FREEZE)?;
        self.0.read(GATE_READ)?;
        Ok(())
    }

    fn unfreeze(&self) -> Result<(), SlotdError> {
        info!("releasing gate at {:#x}", self.0.base);
        for value in GATE_RELEASE_SEQUENCE {
            self.0.write(GATE_WRITE, value)?;
            self.0.read(GATE_READ)?;
        }
        Ok(())
    }
}

pub struct RegisterConfigPort(Block);

impl RegisterConfigPort {
    pub fn new(regs: Arc<dyn RegisterAccess>, base: u64) -> Self {
        RegisterConfigPort(Block { regs, base })
    }
}

impl ConfigPort for RegisterConfigPort {
    fn vacancy(&self) -> Result<u32, SlotdError> {
        self.0.read(PORT_VACANCY)
    }

    fn write_words(&self, words: &[u32]) -> Result<(), SlotdError> {
        trace!("queueing {} words", words.len());
        words
            .iter()
            .try_for_each(|word| self.0.write(PORT_WRITE_FIFO, *word))
    }

    fn start(&self) -> Result<(), SlotdError> {
        self.0.write(PORT_CONTROL, CONFIG_PORT_START)
    }

    fn control(&self) -> Result<u32, SlotdError> {
        self.0.read(PORT_CONTROL)
    }

    fn status(&self) -> Result<u32, SlotdError> {
        self.0.read(PORT_STATUS)
    }
}

pub struct RegisterCalibration(Block);

impl RegisterCalibration {
    pub fn new(regs: Arc<dyn RegisterAccess>, base: u64) -> Self {
        RegisterCalibration(Block { regs, base })
    }
}

impl MemoryCalibration for RegisterCalibration {
    fn calibrate(&self, channels: usize, retain: bool) -> Result<(), SlotdError> {
        let mut control = CALIBRATION_RUN | ((channels as u32) << 8);
        if retain {
            control |= CALIBRATION_RETAIN;
        }
        self.0.write(CALIBRATION_CONTROL, control)
    }

    fn status(&self) -> Result<u32, SlotdError> {
        self.0.read(CALIBRATION_STATUS)
    }
}

pub struct RegisterClocks(Block);

impl RegisterClocks {
    pub fn new(regs: Arc<dyn RegisterAccess>, base: u64) -> Self {
        RegisterClocks(Block { regs, base })
    }
}

impl ClockController for RegisterClocks {
    fn set_frequencies(&self, targets_mhz: &[u16]) -> Result<(), SlotdError> {
        if targets_mhz.len() as u64 > CLOCK_COUNT {
            return Err(SlotdError::NotSupported(format!(
                "{} clocks requested, the clock block drives {CLOCK_COUNT}",
                targets_mhz.len()
            )));
        }
        for (index, target) in targets_mhz.iter().enumerate() {
            info!("clock {index} -> {target} MHz");
            self.0.write(4 * index as u64, u32::from(*target))?;
        }
        Ok(())
    }

    fn configured_frequencies(&self) -> Result<Vec<u16>, SlotdError> {
        (0..CLOCK_COUNT)
            .map(|index| self.0.read(4 * index).map(|v| (v & 0xffff) as u16))
            .collect()
    }

    fn measured_frequencies(&self) -> Result<Vec<u32>, SlotdError> {
        (0..CLOCK_COUNT)
            .map(|index| self.0.read(CLOCK_MEASURED + 4 * index))
            .collect()
    }
}
