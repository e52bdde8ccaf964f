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

//! Typed views of the image sections the programming flow interprets.
//!
//! Every section is a count followed by fixed-size little-endian records. Parsing checks that
//! the declared count fits inside the section before any record is read.

use crate::error::SlotdError;
use crate::image::fixed_str;
use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, KnownLayout};

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawMemData {
    mem_type: u8,
    used: u8,
    _padding: [u8; 6],
    size_kb: u64,
    base_address: u64,
    tag: [u8; 16],
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawIpData {
    ip_type: u32,
    properties: u32,
    base_address: u64,
    name: [u8; 64],
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawConnection {
    arg_index: i32,
    ip_layout_index: i32,
    mem_data_index: i32,
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawDebugIpData {
    debug_type: u8,
    index_lowbyte: u8,
    properties: u8,
    major: u8,
    minor: u8,
    index_highbyte: u8,
    _reserved: [u8; 2],
    base_address: u64,
    name: [u8; 128],
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawClockFreq {
    freq_mhz: u16,
    clock_type: u8,
    _padding: [u8; 5],
    name: [u8; 128],
}

/// Read `count` records of `T` starting at `start`.
fn records<T: FromBytes + KnownLayout + Immutable>(
    bytes: &[u8],
    start: usize,
    count: usize,
    what: &str,
) -> Result<Vec<T>, SlotdError> {
    let needed = count
        .checked_mul(size_of::<T>())
        .and_then(|n| n.checked_add(start))
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            SlotdError::InvalidImage(format!(
                "{what}: {count} records do not fit in {} bytes",
                bytes.len()
            ))
        })?;
    let mut out = Vec::with_capacity(count);
    let mut at = start;
    while at < needed {
        let (record, _) = T::read_from_prefix(&bytes[at..])
            .map_err(|_| SlotdError::InvalidImage(format!("{what}: truncated record")))?;
        out.push(record);
        at += size_of::<T>();
    }
    Ok(out)
}

fn count_i32(bytes: &[u8], what: &str) -> Result<usize, SlotdError> {
    let raw: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SlotdError::InvalidImage(format!("{what}: missing record count")))?;
    usize::try_from(i32::from_le_bytes(raw))
        .map_err(|_| SlotdError::InvalidImage(format!("{what}: negative record count")))
}

fn count_u16(bytes: &[u8], what: &str) -> Result<usize, SlotdError> {
    let raw: [u8; 2] = bytes
        .get(..2)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SlotdError::InvalidImage(format!("{what}: missing record count")))?;
    Ok(u16::from_le_bytes(raw) as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Ddr3,
    Ddr4,
    Dram,
    Streaming,
    PreallocatedGlobal,
    Are,
    Hbm,
    Bram,
    Uram,
    StreamingConnection,
    Host,
    Other(u8),
}

impl From<u8> for MemType {
    fn from(value: u8) -> Self {
        match value {
            0 => MemType::Ddr3,
            1 => MemType::Ddr4,
            2 => MemType::Dram,
            3 => MemType::Streaming,
            4 => MemType::PreallocatedGlobal,
            5 => MemType::Are,
            6 => MemType::Hbm,
            7 => MemType::Bram,
            8 => MemType::Uram,
            9 => MemType::StreamingConnection,
            10 => MemType::Host,
            other => MemType::Other(other),
        }
    }
}

impl MemType {
    pub fn is_streaming(self) -> bool {
        matches!(self, MemType::Streaming | MemType::StreamingConnection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemEntry {
    pub mem_type: MemType,
    pub used: bool,
    pub size_kb: u64,
    pub base_address: u64,
    pub tag: String,
}

impl MemEntry {
    pub fn is_host(&self) -> bool {
        self.mem_type == MemType::Host || self.tag.starts_with("HOST")
    }
}

/// Memory topology, in plain or grouped form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemTopology {
    pub entries: Vec<MemEntry>,
}

impl MemTopology {
    pub fn parse(bytes: &[u8]) -> Result<Self, SlotdError> {
        let count = count_i32(bytes, "memory topology")?;
        let entries = records::<RawMemData>(bytes, 8, count, "memory topology")?
            .into_iter()
            .map(|raw| MemEntry {
                mem_type: MemType::from(raw.mem_type),
                used: raw.used != 0,
                size_kb: raw.size_kb,
                base_address: raw.base_address,
                tag: fixed_str(&raw.tag),
            })
            .collect();
        Ok(MemTopology { entries })
    }

    /// Number of used memory channels that need calibration after a controller change.
    pub fn calibrated_channels(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.used && !e.mem_type.is_streaming() && !e.is_host())
            .count()
    }

    /// Size in bytes of the last used host memory bank, 0 when there is none.
    pub fn host_mem_aperture(&self) -> u64 {
        self.entries
            .iter()
            .rev()
            .find(|e| e.used && e.tag.starts_with("HOST"))
            .map_or(0, |e| e.size_kb << 10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpKind {
    Microblaze,
    Kernel,
    Dnasc,
    Ddr4Controller,
    MemDdr4,
    MemHbm,
    Other(u32),
}

impl From<u32> for IpKind {
    fn from(value: u32) -> Self {
        match value {
            0 => IpKind::Microblaze,
            1 => IpKind::Kernel,
            2 => IpKind::Dnasc,
            3 => IpKind::Ddr4Controller,
            4 => IpKind::MemDdr4,
            5 => IpKind::MemHbm,
            other => IpKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpEntry {
    pub kind: IpKind,
    pub properties: u32,
    pub base_address: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpLayout {
    pub entries: Vec<IpEntry>,
}

impl IpLayout {
    pub fn parse(bytes: &[u8]) -> Result<Self, SlotdError> {
        let count = count_i32(bytes, "ip layout")?;
        let entries = records::<RawIpData>(bytes, 8, count, "ip layout")?
            .into_iter()
            .map(|raw| IpEntry {
                kind: IpKind::from(raw.ip_type),
                properties: raw.properties,
                base_address: raw.base_address,
                name: fixed_str(&raw.name),
            })
            .collect();
        Ok(IpLayout { entries })
    }

    /// Compute units with their position in the layout, which connectivity refers to.
    pub fn kernels(&self) -> impl Iterator<Item = (usize, &IpEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == IpKind::Kernel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub arg_index: i32,
    pub ip_layout_index: i32,
    pub mem_data_index: i32,
}

/// Kernel argument to memory bank connectivity, in plain or grouped form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connectivity {
    pub connections: Vec<Connection>,
}

impl Connectivity {
    pub fn parse(bytes: &[u8]) -> Result<Self, SlotdError> {
        let count = count_i32(bytes, "connectivity")?;
        let connections = records::<RawConnection>(bytes, 4, count, "connectivity")?
            .into_iter()
            .map(|raw| Connection {
                arg_index: raw.arg_index,
                ip_layout_index: raw.ip_layout_index,
                mem_data_index: raw.mem_data_index,
            })
            .collect();
        Ok(Connectivity { connections })
    }

    /// Reject connections to an IP or memory bank the image does not describe.
    pub fn check_references(&self, ip_count: usize, mem_count: usize) -> Result<(), SlotdError> {
        let in_range = |index: i32, count: usize| usize::try_from(index).is_ok_and(|i| i < count);
        match self.connections.iter().find(|c| {
            !in_range(c.ip_layout_index, ip_count) || !in_range(c.mem_data_index, mem_count)
        }) {
            Some(c) => Err(SlotdError::InvalidImage(format!(
                "connectivity argument {} joins IP {} to memory bank {}, image has {ip_count} IPs and {mem_count} banks",
                c.arg_index, c.ip_layout_index, c.mem_data_index
            ))),
            None => Ok(()),
        }
    }

    /// Arguments of the IP at `ip_index` that are wired to memory.
    pub fn arguments_of(&self, ip_index: usize) -> usize {
        self.connections
            .iter()
            .filter(|c| usize::try_from(c.ip_layout_index).is_ok_and(|i| i == ip_index))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugIpEntry {
    pub debug_type: u8,
    pub index: u16,
    pub properties: u8,
    pub version: (u8, u8),
    pub base_address: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugIpLayout {
    pub entries: Vec<DebugIpEntry>,
}

impl DebugIpLayout {
    pub fn parse(bytes: &[u8]) -> Result<Self, SlotdError> {
        let count = count_u16(bytes, "debug ip layout")?;
        let entries = records::<RawDebugIpData>(bytes, 8, count, "debug ip layout")?
            .into_iter()
            .map(|raw| DebugIpEntry {
                debug_type: raw.debug_type,
                index: u16::from_le_bytes([raw.index_lowbyte, raw.index_highbyte]),
                properties: raw.properties,
                version: (raw.major, raw.minor),
                base_address: raw.base_address,
                name: fixed_str(&raw.name),
            })
            .collect();
        Ok(DebugIpLayout { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    Unused,
    Data,
    Kernel,
    System,
    Other(u8),
}

impl From<u8> for ClockType {
    fn from(value: u8) -> Self {
        match value {
            0 => ClockType::Unused,
            1 => ClockType::Data,
            2 => ClockType::Kernel,
            3 => ClockType::System,
            other => ClockType::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockEntry {
    pub freq_mhz: u16,
    pub clock_type: ClockType,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClockFreqTopology {
    pub clocks: Vec<ClockEntry>,
}

impl ClockFreqTopology {
    pub fn parse(bytes: &[u8]) -> Result<Self, SlotdError> {
        let count = count_u16(bytes, "clock frequency topology")?;
        let clocks = records::<RawClockFreq>(bytes, 2, count, "clock frequency topology")?
            .into_iter()
            .map(|raw| ClockEntry {
                freq_mhz: raw.freq_mhz,
                clock_type: ClockType::from(raw.clock_type),
                name: fixed_str(&raw.name),
            })
            .collect();
        Ok(ClockFreqTopology { clocks })
    }

    /// Target frequencies of the clocks that are in use, in declaration order.
    pub fn targets(&self) -> Vec<u16> {
        self.clocks
            .iter()
            .filter(|c| c.clock_type != ClockType::Unused)
            .map(|c| c.freq_mhz)
            .collect()
    }
}

/// Interface identifiers the image was built against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionMetadata {
    pub interfaces: Vec<Uuid>,
}

impl PartitionMetadata {
    pub fn parse(bytes: &[u8]) -> Result<Self, SlotdError> {
        let raw: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                SlotdError::InvalidImage("partition metadata: missing record count".into())
            })?;
        let count = u32::from_le_bytes(raw) as usize;
        let interfaces = records::<[u8; 16]>(bytes, 8, count, "partition metadata")?
            .into_iter()
            .map(Uuid::from_bytes)
            .collect();
        Ok(PartitionMetadata { interfaces })
    }

    pub fn is_compatible_with(&self, baseline: &Uuid) -> bool {
        self.interfaces.contains(baseline)
    }
}

/// Encoders for the record formats above, for assembling images in tests and tooling.
pub mod encode {
    use uuid::Uuid;

    fn name<const N: usize>(value: &str) -> [u8; N] {
        let mut out = [0u8; N];
        let len = value.len().min(N - 1);
        out[..len].copy_from_slice(&value.as_bytes()[..len]);
        out
    }

    /// `(mem_type, used, size_kb, base_address, tag)` per entry.
    pub fn mem_topology(entries: &[(u8, bool, u64, u64, &str)]) -> Vec<u8> {
        let mut out = (entries.len() as i32).to_le_bytes().to_vec();
        out.extend_from_slice(&[0; 4]);
        for (mem_type, used, size_kb, base, tag) in entries {
            out.push(*mem_type);
            out.push(u8::from(*used));
            out.extend_from_slice(&[0; 6]);
            out.extend_from_slice(&size_kb.to_le_bytes());
            out.extend_from_slice(&base.to_le_bytes());
            out.extend_from_slice(&name::<16>(tag));
        }
        out
    }

    /// `(ip_type, base_address, name)` per entry.
    pub fn ip_layout(entries: &[(u32, u64, &str)]) -> Vec<u8> {
        let mut out = (entries.len() as i32).to_le_bytes().to_vec();
        out.extend_from_slice(&[0; 4]);
        for (ip_type, base, ip_name) in entries {
            out.extend_from_slice(&ip_type.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&base.to_le_bytes());
            out.extend_from_slice(&name::<64>(ip_name));
        }
        out
    }

    /// `(arg_index, ip_layout_index, mem_data_index)` per entry.
    pub fn connectivity(entries: &[(i32, i32, i32)]) -> Vec<u8> {
        let mut out = (entries.len() as i32).to_le_bytes().to_vec();
        for (arg, ip, mem) in entries {
            out.extend_from_slice(&arg.to_le_bytes());
            out.extend_from_slice(&ip.to_le_bytes());
            out.extend_from_slice(&mem.to_le_bytes());
        }
        out
    }

    /// `(debug_type, index, base_address, name)` per entry.
    pub fn debug_ip_layout(entries: &[(u8, u16, u64, &str)]) -> Vec<u8> {
        let mut out = (entries.len() as u16).to_le_bytes().to_vec();
        out.extend_from_slice(&[0; 6]);
        for (debug_type, index, base, ip_name) in entries {
            let [low, high] = index.to_le_bytes();
            out.extend_from_slice(&[*debug_type, low, 0, 1, 0, high, 0, 0]);
            out.extend_from_slice(&base.to_le_bytes());
            out.extend_from_slice(&name::<128>(ip_name));
        }
        out
    }

    /// `(freq_mhz, clock_type, name)` per entry.
    pub fn clock_topology(entries: &[(u16, u8, &str)]) -> Vec<u8> {
        let mut out = (entries.len() as i16).to_le_bytes().to_vec();
        for (freq, clock_type, clock_name) in entries {
            out.extend_from_slice(&freq.to_le_bytes());
            out.push(*clock_type);
            out.extend_from_slice(&[0; 5]);
            out.extend_from_slice(&name::<128>(clock_name));
        }
        out
    }

    pub fn partition_metadata(interfaces: &[Uuid]) -> Vec<u8> {
        let mut out = (interfaces.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(&[0; 4]);
        for id in interfaces {
            out.extend_from_slice(id.as_bytes());
        }
        out
    }
}
