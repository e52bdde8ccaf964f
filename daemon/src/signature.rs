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

//! Image signing policy and the ed25519 signature predicate.
//!
//! Verification itself is a black box to the programming flow: it hands over the signed bytes
//! and the trailing signature and gets back `Ok(())` or an error. Which key is used depends on
//! the configured [`SecurityLevel`]: the platform trust root for
//! [`SecurityLevel::PlatformTrustRoot`], the dedicated key otherwise.

use crate::config::SecurityConfig;
use crate::error::SlotdError;
use crate::system_io::fs_read;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::trace;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityLevel {
    /// Signatures are checked when present but a failure is only logged.
    None,
    /// Images must be signed by the dedicated image key.
    DedicatedKey,
    /// Images must be signed by the platform trust root.
    PlatformTrustRoot,
}

impl Display for SecurityLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityLevel::None => "none",
            SecurityLevel::DedicatedKey => "dedicated-key",
            SecurityLevel::PlatformTrustRoot => "platform-trust-root",
        };
        f.write_str(s)
    }
}

impl FromStr for SecurityLevel {
    type Err = SlotdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" | "0" => Ok(SecurityLevel::None),
            "dedicated-key" | "1" => Ok(SecurityLevel::DedicatedKey),
            "platform-trust-root" | "2" => Ok(SecurityLevel::PlatformTrustRoot),
            other => Err(SlotdError::Argument(format!(
                "'{other}' is not a security level. Expected none, dedicated-key or platform-trust-root"
            ))),
        }
    }
}

/// Predicate deciding whether `signature` is a valid signature over `data`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, level: SecurityLevel, data: &[u8], signature: &[u8])
    -> Result<(), SlotdError>;
}

/// Verifies ed25519 signatures against a dedicated key and a platform trust root.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    dedicated: Option<VerifyingKey>,
    platform: Option<VerifyingKey>,
}

impl Ed25519Verifier {
    pub fn new(dedicated: Option<VerifyingKey>, platform: Option<VerifyingKey>) -> Self {
        Ed25519Verifier {
            dedicated,
            platform,
        }
    }

    /// Load whichever keys the security configuration names.
    pub fn from_config(config: &SecurityConfig) -> Result<Self, SlotdError> {
        let dedicated = config
            .dedicated_key
            .as_deref()
            .map(read_verifying_key)
            .transpose()?;
        let platform = config
            .platform_key
            .as_deref()
            .map(read_verifying_key)
            .transpose()?;
        Ok(Ed25519Verifier::new(dedicated, platform))
    }

    fn key_for(&self, level: SecurityLevel) -> Option<&VerifyingKey> {
        match level {
            SecurityLevel::PlatformTrustRoot => self.platform.as_ref(),
            SecurityLevel::None | SecurityLevel::DedicatedKey => self.dedicated.as_ref(),
        }
    }
}

/// Parse a hex encoded 32 byte ed25519 public key.
pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, SlotdError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| SlotdError::Argument(format!("public key is not valid hex: {e}")))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        SlotdError::Argument(format!("public key must be 32 bytes, got {}", b.len()))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| SlotdError::Argument(format!("public key is not a valid ed25519 key: {e}")))
}

fn read_verifying_key(path: &Path) -> Result<VerifyingKey, SlotdError> {
    trace!("Loading public key from {path:?}");
    parse_verifying_key(&fs_read(path)?)
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        level: SecurityLevel,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SlotdError> {
        let key = self.key_for(level).ok_or_else(|| {
            SlotdError::SignatureRejected(format!("no key configured for security level {level}"))
        })?;
        let signature: [u8; 64] = signature.try_into().map_err(|_| {
            SlotdError::SignatureRejected(format!(
                "signature must be 64 bytes, got {}",
                signature.len()
            ))
        })?;
        let signature = Signature::from_bytes(&signature);
        key.verify(data, &signature)
            .map_err(|e| SlotdError::SignatureRejected(format!("verification failed: {e}")))
    }
}
