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

//! Error Wrapping File System I/O Helpers
//!
//! This module provides convenient wrappers around standard Rust file system operations,
//! with automatic conversion to `SlotdError` types. All functions include trace logging
//! for debugging and provide detailed error context including file paths.
//!
//! Includes: whole-file reads and opening a register resource for mapping.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use slotd::system_io::{fs_read, fs_read_bytes};
//! # use std::path::Path;
//!
//! # fn example() -> Result<(), slotd::error::SlotdError> {
//! let config = fs_read(Path::new("/etc/slotd/config.toml"))?;
//! let image = fs_read_bytes(Path::new("/lib/firmware/design.xclbin"))?;
//! # Ok(())
//! # }
//! ```

use crate::error::SlotdError;
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

/// Read the contents of a file to a String.
///
/// # Arguments
///
/// * `file_path` - Path to the file to read
///
/// # Returns: `Result<String, SlotdError>`
/// * `Ok(String)` - The complete contents of the file
/// * `Err(SlotdError::IORead)` - If the file cannot be read (doesn't exist, permissions, etc.)
pub fn fs_read(file_path: &Path) -> Result<String, SlotdError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf: String = String::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_string(&mut buf));

    match result {
        Ok(_) => {
            trace!("Reading done");
            Ok(buf)
        }
        Err(e) => Err(SlotdError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Read the contents of a file as raw bytes.
///
/// Used for configuration images and key material, which are binary.
///
/// # Returns: `Result<Vec<u8>, SlotdError>`
/// * `Ok(Vec<u8>)` - The complete contents of the file
/// * `Err(SlotdError::IORead)` - If the file cannot be read
pub fn fs_read_bytes(file_path: &Path) -> Result<Vec<u8>, SlotdError> {
    trace!("Attempting to read bytes from {file_path:?}");
    let mut buf = Vec::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_end(&mut buf));

    match result {
        Ok(n) => {
            trace!("Read {n} bytes");
            Ok(buf)
        }
        Err(e) => Err(SlotdError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Open a register resource (for example a PCI BAR exposed through sysfs) read-write, for mapping.
pub fn fs_open_registers(file_path: &Path) -> Result<File, SlotdError> {
    trace!("Opening register resource {file_path:?}");
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(file_path)
        .map_err(|e| SlotdError::IORead {
            file: file_path.into(),
            e,
        })
}
