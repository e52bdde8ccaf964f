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

use log::error;
use std::path::PathBuf;
use zbus::fdo;

#[derive(Debug, thiserror::Error)]
pub enum SlotdError {
    #[error("SlotdError::InvalidImage: Configuration image rejected: {0}")]
    InvalidImage(String),
    #[error("SlotdError::IncompatibleInterface: Image does not match the platform interface: {0}")]
    IncompatibleInterface(String),
    #[error("SlotdError::SignatureRejected: {0}")]
    SignatureRejected(String),
    #[error("SlotdError::Busy: {0}")]
    Busy(String),
    #[error("SlotdError::Timeout: {0}")]
    Timeout(String),
    #[error("SlotdError::ResourceExhausted: {0}")]
    ResourceExhausted(String),
    #[error("SlotdError::NotSupported: {0}")]
    NotSupported(String),
    #[error("SlotdError::Interrupted: Wait was interrupted: {0}")]
    Interrupted(String),
    #[error("SlotdError::Layout: Unexpected register layout, refusing to drive this hardware: {0}")]
    Layout(String),
    #[error("SlotdError::Argument: {0}")]
    Argument(String),
    #[error("SlotdError::Peer: The privileged peer reported a failure: {0}")]
    Peer(String),
    #[error("SlotdError::Hardware: {0}")]
    Hardware(String),
    #[error("SlotdError::InvariantViolation: {0}")]
    InvariantViolation(String),
    #[error("SlotdError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("SlotdError::IOWrite: An IO error occurred when writing to {file:?}: {e}")]
    IOWrite { file: PathBuf, e: std::io::Error },
    #[error("SlotdError::TomlDe: Failed to parse config from {file:?}: {e}")]
    TomlDe { file: PathBuf, e: toml::de::Error },
    #[error("SlotdError::Internal: An Internal error occurred: {0}")]
    Internal(String),
}

impl SlotdError {
    /// Whether the error leaves the device context unusable.
    ///
    /// Everything else only fails the one attempt that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SlotdError::Layout(..) | SlotdError::InvariantViolation(..)
        )
    }

    /// Rebuild the error a peer daemon replied with from its D-Bus error `name` and `message`.
    ///
    /// The message starts with the rendering of the variant the peer failed with, which
    /// restores that variant. Otherwise the standard D-Bus error name decides, and anything
    /// unrecognised is a [`SlotdError::Peer`] failure.
    pub fn from_remote(name: &str, message: &str) -> SlotdError {
        for kind in REMOTE_KINDS {
            let prefix = kind(String::new()).to_string();
            if let Some(text) = message.strip_prefix(prefix.as_str()) {
                return kind(format!("peer: {text}"));
            }
        }
        let detail = format!("peer: {message}");
        match name.strip_prefix("org.freedesktop.DBus.Error.") {
            Some("TimedOut" | "Timeout" | "NoReply") => SlotdError::Timeout(detail),
            Some("LimitsExceeded") => SlotdError::Busy(detail),
            Some("InvalidArgs") => SlotdError::Argument(detail),
            Some("NotSupported") => SlotdError::NotSupported(detail),
            _ => SlotdError::Peer(format!("{name}: {message}")),
        }
    }
}

/// Variants a peer's failure keeps when it reaches a client. Fatal ones stay with the peer.
const REMOTE_KINDS: [fn(String) -> SlotdError; 10] = [
    SlotdError::InvalidImage,
    SlotdError::IncompatibleInterface,
    SlotdError::SignatureRejected,
    SlotdError::Busy,
    SlotdError::Timeout,
    SlotdError::ResourceExhausted,
    SlotdError::NotSupported,
    SlotdError::Interrupted,
    SlotdError::Argument,
    SlotdError::Hardware,
];

impl From<SlotdError> for fdo::Error {
    fn from(err: SlotdError) -> Self {
        error!("{err}");
        match err {
            SlotdError::Argument(..)
            | SlotdError::InvalidImage(..)
            | SlotdError::IncompatibleInterface(..)
            | SlotdError::SignatureRejected(..) => fdo::Error::InvalidArgs(err.to_string()),
            SlotdError::IORead { .. } => fdo::Error::IOError(err.to_string()),
            SlotdError::IOWrite { .. } => fdo::Error::IOError(err.to_string()),
            SlotdError::Busy(..) => fdo::Error::LimitsExceeded(err.to_string()),
            SlotdError::Timeout(..) => fdo::Error::TimedOut(err.to_string()),
            SlotdError::NotSupported(..) => fdo::Error::NotSupported(err.to_string()),
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}
