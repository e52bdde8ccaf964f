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

//! The Validating stage: everything that can reject an image without touching hardware.

use crate::error::SlotdError;
use crate::image::sections::{
    ClockFreqTopology, Connectivity, DebugIpLayout, IpLayout, MemTopology, PartitionMetadata,
};
use crate::image::{ConfigImage, SectionKind};
use crate::signature::{SecurityLevel, SignatureVerifier};
use log::{trace, warn};
use uuid::Uuid;

/// Metadata sections decoded up front, so a malformed record is reported as `InvalidImage`
/// before the gate is frozen rather than half way through bring-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSections {
    pub mem_topology: Option<MemTopology>,
    /// Raw bytes the memory topology was decoded from, compared for data retention.
    pub mem_topology_bytes: Option<Vec<u8>>,
    pub ip_layout: Option<IpLayout>,
    pub connectivity: Option<Connectivity>,
    pub debug_ip_layout: Option<DebugIpLayout>,
    pub clocks: Option<ClockFreqTopology>,
}

impl ParsedSections {
    pub fn parse(image: &ConfigImage<'_>) -> Result<Self, SlotdError> {
        let topology = image
            .section(SectionKind::MemTopology)
            .or_else(|| image.section(SectionKind::GroupTopology));
        let sections = ParsedSections {
            mem_topology: topology.map(MemTopology::parse).transpose()?,
            mem_topology_bytes: topology.map(<[u8]>::to_vec),
            ip_layout: image
                .section(SectionKind::IpLayout)
                .map(IpLayout::parse)
                .transpose()?,
            connectivity: image
                .section(SectionKind::Connectivity)
                .or_else(|| image.section(SectionKind::GroupConnectivity))
                .map(Connectivity::parse)
                .transpose()?,
            debug_ip_layout: image
                .section(SectionKind::DebugIpLayout)
                .map(DebugIpLayout::parse)
                .transpose()?,
            clocks: image
                .section(SectionKind::ClockFreqTopology)
                .map(ClockFreqTopology::parse)
                .transpose()?,
        };
        if let Some(connectivity) = &sections.connectivity {
            connectivity.check_references(
                sections.ip_layout.as_ref().map_or(0, |l| l.entries.len()),
                sections.mem_topology.as_ref().map_or(0, |t| t.entries.len()),
            )?;
        }
        Ok(sections)
    }

    /// Memory channels the image needs calibrated.
    pub fn calibrated_channels(&self) -> usize {
        self.mem_topology
            .as_ref()
            .map_or(0, MemTopology::calibrated_channels)
    }
}

/// Platform facts an image is checked against.
#[derive(Clone, Copy)]
pub struct ValidationPolicy<'a> {
    pub security_level: SecurityLevel,
    pub verifier: &'a dyn SignatureVerifier,
    /// Interface identifier of the platform, if it publishes one.
    pub baseline: Option<&'a Uuid>,
}

/// Check structure, interface compatibility and signature of `bytes`.
///
/// # Returns: `Result<(ConfigImage, ParsedSections), SlotdError>`
/// * `Err(SlotdError::InvalidImage)` - Bad magic, a section outside the declared length or a
///   malformed metadata record
/// * `Err(SlotdError::IncompatibleInterface)` - The image does not list the platform interface
/// * `Err(SlotdError::SignatureRejected)` - Signing is required and the image is unsigned or
///   its signature does not verify
pub fn validate<'a>(
    bytes: &'a [u8],
    policy: ValidationPolicy<'_>,
) -> Result<(ConfigImage<'a>, ParsedSections), SlotdError> {
    let image = ConfigImage::parse(bytes)?;
    trace!("validating {image}");
    check_interface(&image, policy.baseline)?;
    check_signature(&image, policy.security_level, policy.verifier)?;
    let sections = ParsedSections::parse(&image)?;
    Ok((image, sections))
}

fn check_interface(image: &ConfigImage<'_>, baseline: Option<&Uuid>) -> Result<(), SlotdError> {
    let Some(raw) = image.section(SectionKind::PartitionMetadata) else {
        trace!("no partition metadata, skipping interface check");
        return Ok(());
    };
    let metadata = PartitionMetadata::parse(raw)?;
    let Some(baseline) = baseline else {
        return Err(SlotdError::IncompatibleInterface(
            "image requires an interface but the platform does not publish one".into(),
        ));
    };
    if !metadata.is_compatible_with(baseline) {
        return Err(SlotdError::IncompatibleInterface(format!(
            "platform interface {baseline} is not among {:?}",
            metadata.interfaces
        )));
    }
    Ok(())
}

fn check_signature(
    image: &ConfigImage<'_>,
    level: SecurityLevel,
    verifier: &dyn SignatureVerifier,
) -> Result<(), SlotdError> {
    let Some((payload, signature)) = image.signed_payload() else {
        if level > SecurityLevel::None {
            return Err(SlotdError::SignatureRejected(format!(
                "security level {level} requires a signed image"
            )));
        }
        return Ok(());
    };
    match verifier.verify(level, &payload, signature) {
        Ok(()) => Ok(()),
        Err(e) if level == SecurityLevel::None => {
            warn!("ignoring signature failure at security level {level}: {e}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
