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

//! Configuration image container.
//!
//! An image is a little-endian container: a fixed preamble (magic, trailing-signature length,
//! key block, unique id), a fixed header (total length, mode, configuration id, ...) and a table
//! of typed, offset-addressed sections. [`ConfigImage::parse`] checks everything that can be
//! checked without hardware: magic, declared length, and that every section and the signature
//! stay inside the declared length. The typed section records live in [`sections`].

pub mod sections;

use crate::error::SlotdError;
use crate::slot::ConfigurationId;
use log::trace;
use std::fmt::{Display, Formatter};
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub const IMAGE_MAGIC: &[u8; 8] = b"xclbin2\0";

/// Signature length value meaning "no trailing signature".
pub const UNSIGNED: i32 = -1;

/// Offset of the signature length field inside the image.
pub const SIGNATURE_LENGTH_OFFSET: usize = 8;
/// Offset of the total length field inside the image.
pub const LENGTH_OFFSET: usize = 304;
/// Size of the preamble plus header, where the section table starts.
pub const HEADER_SIZE: usize = size_of::<RawImageHeader>();
pub const SECTION_HEADER_SIZE: usize = size_of::<RawSectionHeader>();

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawImageHeader {
    magic: [u8; 8],
    signature_length: i32,
    _reserved: [u8; 28],
    _key_block: [u8; 256],
    unique_id: u64,
    length: u64,
    timestamp: u64,
    _feature_rom_timestamp: u64,
    version_patch: u16,
    version_major: u8,
    version_minor: u8,
    mode: u16,
    _action_mask: u16,
    _feature_rom_uuid: [u8; 16],
    platform_vbnv: [u8; 64],
    uuid: [u8; 16],
    _debug_bin: [u8; 16],
    num_sections: u32,
    _padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawSectionHeader {
    kind: u32,
    name: [u8; 16],
    _padding: u32,
    offset: u64,
    size: u64,
}

/// Section kinds this daemon knows about. Everything else is carried as [`SectionKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKind {
    Bitstream,
    ClearingBitstream,
    Firmware,
    MemTopology,
    Connectivity,
    IpLayout,
    DebugIpLayout,
    ClockFreqTopology,
    Pdi,
    PartialPdi,
    PartitionMetadata,
    SoftKernel,
    GroupTopology,
    GroupConnectivity,
    Unknown(u32),
}

impl From<u32> for SectionKind {
    fn from(value: u32) -> Self {
        match value {
            0 => SectionKind::Bitstream,
            1 => SectionKind::ClearingBitstream,
            3 => SectionKind::Firmware,
            6 => SectionKind::MemTopology,
            7 => SectionKind::Connectivity,
            8 => SectionKind::IpLayout,
            9 => SectionKind::DebugIpLayout,
            11 => SectionKind::ClockFreqTopology,
            18 => SectionKind::Pdi,
            19 => SectionKind::PartialPdi,
            20 => SectionKind::PartitionMetadata,
            23 => SectionKind::SoftKernel,
            26 => SectionKind::GroupTopology,
            27 => SectionKind::GroupConnectivity,
            other => SectionKind::Unknown(other),
        }
    }
}

impl From<SectionKind> for u32 {
    fn from(kind: SectionKind) -> Self {
        match kind {
            SectionKind::Bitstream => 0,
            SectionKind::ClearingBitstream => 1,
            SectionKind::Firmware => 3,
            SectionKind::MemTopology => 6,
            SectionKind::Connectivity => 7,
            SectionKind::IpLayout => 8,
            SectionKind::DebugIpLayout => 9,
            SectionKind::ClockFreqTopology => 11,
            SectionKind::Pdi => 18,
            SectionKind::PartialPdi => 19,
            SectionKind::PartitionMetadata => 20,
            SectionKind::SoftKernel => 23,
            SectionKind::GroupTopology => 26,
            SectionKind::GroupConnectivity => 27,
            SectionKind::Unknown(other) => other,
        }
    }
}

/// Build mode of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    /// Built for a flat shell. The bitstream was flashed with the shell and is not streamed.
    Flat,
    /// Partial reconfiguration of a slot.
    Partial,
    Other(u16),
}

impl From<u16> for ImageMode {
    fn from(value: u16) -> Self {
        match value {
            0 => ImageMode::Flat,
            1 => ImageMode::Partial,
            other => ImageMode::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub signature_length: i32,
    pub unique_id: u64,
    /// Total length in bytes, including a trailing signature if there is one.
    pub length: u64,
    pub timestamp: u64,
    pub version: (u8, u8, u16),
    pub mode: ImageMode,
    pub configuration_id: ConfigurationId,
    pub platform_vbnv: String,
    pub num_sections: u32,
}

impl ImageHeader {
    pub fn is_signed(&self) -> bool {
        self.signature_length != UNSIGNED
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionEntry {
    pub kind: SectionKind,
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

/// A validated, borrowed view of one configuration image.
#[derive(Debug, Clone)]
pub struct ConfigImage<'a> {
    bytes: &'a [u8],
    header: ImageHeader,
    sections: Vec<SectionEntry>,
}

/// Decode a fixed size, NUL padded name field.
pub(crate) fn fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl<'a> ConfigImage<'a> {
    /// Parse and bounds-check an image.
    ///
    /// # Returns: `Result<ConfigImage, SlotdError>`
    /// * `Ok(ConfigImage)` - Header and section table are consistent
    /// * `Err(SlotdError::InvalidImage)` - Bad magic, truncated data, or a section or signature
    ///   reaching past the declared total length
    pub fn parse(bytes: &'a [u8]) -> Result<Self, SlotdError> {
        let (raw, _) = RawImageHeader::read_from_prefix(bytes).map_err(|_| {
            SlotdError::InvalidImage(format!(
                "{} bytes is too short for an image header of {HEADER_SIZE} bytes",
                bytes.len()
            ))
        })?;
        if &raw.magic != IMAGE_MAGIC {
            return Err(SlotdError::InvalidImage(format!(
                "bad magic {:?}",
                String::from_utf8_lossy(&raw.magic)
            )));
        }

        let length = raw.length;
        if length > bytes.len() as u64 {
            return Err(SlotdError::InvalidImage(format!(
                "declared length {length} exceeds the {} bytes supplied",
                bytes.len()
            )));
        }
        let table_end = (raw.num_sections as u64)
            .checked_mul(SECTION_HEADER_SIZE as u64)
            .and_then(|table| table.checked_add(HEADER_SIZE as u64))
            .filter(|end| *end <= length)
            .ok_or_else(|| {
                SlotdError::InvalidImage(format!(
                    "section table of {} entries does not fit in {length} bytes",
                    raw.num_sections
                ))
            })?;

        match raw.signature_length {
            UNSIGNED => {}
            n if n < 0 || n as u64 > length - table_end => {
                return Err(SlotdError::InvalidImage(format!(
                    "signature length {n} does not fit in the image"
                )));
            }
            _ => {}
        }

        let mut sections = Vec::with_capacity(raw.num_sections as usize);
        for index in 0..raw.num_sections as usize {
            let at = HEADER_SIZE + index * SECTION_HEADER_SIZE;
            let (entry, _) = RawSectionHeader::read_from_prefix(&bytes[at..]).map_err(|_| {
                SlotdError::InvalidImage(format!("section header {index} is truncated"))
            })?;
            let in_bounds = entry
                .offset
                .checked_add(entry.size)
                .is_some_and(|end| end <= length);
            if !in_bounds {
                return Err(SlotdError::InvalidImage(format!(
                    "section {index} (kind {}) at {:#x}+{:#x} exceeds declared length {length}",
                    entry.kind, entry.offset, entry.size
                )));
            }
            sections.push(SectionEntry {
                kind: SectionKind::from(entry.kind),
                name: fixed_str(&entry.name),
                offset: entry.offset,
                size: entry.size,
            });
        }

        let header = ImageHeader {
            signature_length: raw.signature_length,
            unique_id: raw.unique_id,
            length,
            timestamp: raw.timestamp,
            version: (raw.version_major, raw.version_minor, raw.version_patch),
            mode: ImageMode::from(raw.mode),
            configuration_id: ConfigurationId::from_bytes(raw.uuid),
            platform_vbnv: fixed_str(&raw.platform_vbnv),
            num_sections: raw.num_sections,
        };
        trace!(
            "parsed image {} with {} sections, {} bytes",
            header.configuration_id,
            sections.len(),
            length
        );
        Ok(ConfigImage {
            bytes,
            header,
            sections,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn configuration_id(&self) -> ConfigurationId {
        self.header.configuration_id
    }

    pub fn sections(&self) -> &[SectionEntry] {
        &self.sections
    }

    /// The image bytes up to the declared length.
    pub fn bytes(&self) -> &'a [u8] {
        &self.bytes[..self.header.length as usize]
    }

    /// Payload of the first section of `kind`.
    pub fn section(&self, kind: SectionKind) -> Option<&'a [u8]> {
        self.sections_of(kind).next()
    }

    /// Payloads of every section of `kind`, in table order.
    pub fn sections_of(&self, kind: SectionKind) -> impl Iterator<Item = &'a [u8]> + '_ {
        let bytes = self.bytes;
        self.sections
            .iter()
            .filter(move |s| s.kind == kind)
            .map(move |s| &bytes[s.offset as usize..(s.offset + s.size) as usize])
    }

    /// Split a signed image into the bytes the signature covers and the signature itself.
    ///
    /// The covered bytes are the image with the header restored to its unsigned form: signature
    /// length set to [`UNSIGNED`] and total length reduced by the signature length.
    pub fn signed_payload(&self) -> Option<(Vec<u8>, &'a [u8])> {
        if !self.header.is_signed() {
            return None;
        }
        let total = self.header.length as usize;
        let original = total - self.header.signature_length as usize;
        let mut payload = self.bytes[..original].to_vec();
        payload[SIGNATURE_LENGTH_OFFSET..SIGNATURE_LENGTH_OFFSET + 4]
            .copy_from_slice(&UNSIGNED.to_le_bytes());
        payload[LENGTH_OFFSET..LENGTH_OFFSET + 8].copy_from_slice(&(original as u64).to_le_bytes());
        Some((payload, &self.bytes[original..total]))
    }
}

impl Display for ConfigImage<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {} sections, {} bytes)",
            self.header.configuration_id,
            self.header.platform_vbnv,
            self.sections.len(),
            self.header.length
        )
    }
}

/// Assembles images in memory. Used by tests and by tooling that repackages sections.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    configuration_id: [u8; 16],
    mode: u16,
    platform_vbnv: String,
    sections: Vec<(u32, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new(configuration_id: ConfigurationId) -> Self {
        ImageBuilder {
            configuration_id: *configuration_id.as_bytes(),
            mode: 1,
            ..Default::default()
        }
    }

    pub fn mode(mut self, mode: u16) -> Self {
        self.mode = mode;
        self
    }

    pub fn platform(mut self, vbnv: &str) -> Self {
        self.platform_vbnv = vbnv.to_string();
        self
    }

    pub fn section(mut self, kind: SectionKind, payload: Vec<u8>) -> Self {
        self.sections.push((kind.into(), payload));
        self
    }

    /// Serialise the image without a signature.
    pub fn build(&self) -> Vec<u8> {
        let table_end = HEADER_SIZE + self.sections.len() * SECTION_HEADER_SIZE;
        let body_len: usize = self.sections.iter().map(|(_, p)| p.len()).sum();
        let length = table_end + body_len;
        let mut out = vec![0u8; length];

        out[..8].copy_from_slice(IMAGE_MAGIC);
        out[SIGNATURE_LENGTH_OFFSET..SIGNATURE_LENGTH_OFFSET + 4]
            .copy_from_slice(&UNSIGNED.to_le_bytes());
        out[LENGTH_OFFSET..LENGTH_OFFSET + 8].copy_from_slice(&(length as u64).to_le_bytes());
        // mode follows length(8), timestamp(8), feature rom timestamp(8) and version(4)
        let mode_at = LENGTH_OFFSET + 28;
        out[mode_at..mode_at + 2].copy_from_slice(&self.mode.to_le_bytes());
        let vbnv_at = mode_at + 4 + 16;
        let vbnv = self.platform_vbnv.as_bytes();
        let vbnv_len = vbnv.len().min(63);
        out[vbnv_at..vbnv_at + vbnv_len].copy_from_slice(&vbnv[..vbnv_len]);
        let uuid_at = vbnv_at + 64;
        out[uuid_at..uuid_at + 16].copy_from_slice(&self.configuration_id);
        let count_at = uuid_at + 32;
        out[count_at..count_at + 4].copy_from_slice(&(self.sections.len() as u32).to_le_bytes());

        let mut offset = table_end;
        for (index, (kind, payload)) in self.sections.iter().enumerate() {
            let at = HEADER_SIZE + index * SECTION_HEADER_SIZE;
            out[at..at + 4].copy_from_slice(&kind.to_le_bytes());
            out[at + 24..at + 32].copy_from_slice(&(offset as u64).to_le_bytes());
            out[at + 32..at + 40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
            out[offset..offset + payload.len()].copy_from_slice(payload);
            offset += payload.len();
        }
        out
    }

    /// Serialise the image and append a signature produced by `sign` over the unsigned bytes.
    pub fn build_signed(&self, sign: impl FnOnce(&[u8]) -> Vec<u8>) -> Vec<u8> {
        let mut out = self.build();
        let signature = sign(&out);
        let total = (out.len() + signature.len()) as u64;
        out[SIGNATURE_LENGTH_OFFSET..SIGNATURE_LENGTH_OFFSET + 4]
            .copy_from_slice(&(signature.len() as i32).to_le_bytes());
        out[LENGTH_OFFSET..LENGTH_OFFSET + 8].copy_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&signature);
        out
    }
}
