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

//! Loading configuration images from the firmware search directory.

use crate::error::SlotdError;
use crate::hardware::FirmwareLoader;
use crate::system_io::fs_read_bytes;
use log::trace;
use std::path::{Component, Path, PathBuf};

/// Loads images named relative to a search directory, or by an absolute path inside it.
#[derive(Debug, Clone)]
pub struct FirmwareDir {
    search_dir: PathBuf,
}

impl FirmwareDir {
    pub fn new(search_dir: &Path) -> Self {
        FirmwareDir {
            search_dir: search_dir.to_path_buf(),
        }
    }
}

/// Resolve `source` against `search_dir`.
///
/// A relative `source` is joined onto `search_dir`. An absolute `source` must lie inside it.
/// Parent components are refused in both cases so that a name cannot escape the directory.
///
/// # Arguments
///
/// * `source`: the image name as given by the caller
/// * `search_dir`: the root directory all images are loaded from
///
/// returns: `Result<PathBuf, SlotdError>` the full path of the image
///
/// # Examples
///
/// ```
/// # use std::path::Path;
/// # use slotd::hardware::firmware::resolve_firmware_path;
/// let path = resolve_firmware_path(Path::new("designs/vadd.xclbin"), Path::new("/lib/firmware/"))?;
/// assert_eq!(path, Path::new("/lib/firmware/designs/vadd.xclbin"));
/// # Ok::<(), slotd::error::SlotdError>(())
/// ```
pub fn resolve_firmware_path(source: &Path, search_dir: &Path) -> Result<PathBuf, SlotdError> {
    if source
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(SlotdError::Argument(format!(
            "{source:?} must not contain '..'"
        )));
    }
    let suffix = if source.is_absolute() {
        let suffix = source.strip_prefix(search_dir).map_err(|_| {
            SlotdError::Argument(format!("Could not find {source:?} inside {search_dir:?}"))
        })?;
        // Remove leading '/' if present
        suffix
            .components()
            .skip_while(|c| matches!(c, Component::RootDir))
            .collect::<PathBuf>()
    } else {
        source.to_path_buf()
    };
    if suffix.as_os_str().is_empty() {
        return Err(SlotdError::Argument(format!(
            "The resulting filename from stripping {search_dir:?} from {source:?} was empty."
        )));
    }
    Ok(search_dir.join(suffix))
}

impl FirmwareLoader for FirmwareDir {
    fn load(&self, name: &Path) -> Result<Vec<u8>, SlotdError> {
        let path = resolve_firmware_path(name, &self.search_dir)?;
        trace!("loading image {path:?}");
        fs_read_bytes(&path)
    }
}
