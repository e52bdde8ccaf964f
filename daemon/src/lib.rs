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

//! slotd - programs reconfigurable accelerator slots and arbitrates access to them.
//!
//! The library holds every component of the daemon so that it can be exercised in process:
//!
//! - [`image`] parses configuration images and their metadata sections
//! - [`slot`] owns the per-slot state, [`access`] arbitrates readers, writers and consumers
//! - [`programming`] runs the bring-up state machine on top of the [`hardware`] traits or
//!   through a [`peer`]
//! - [`device`] ties everything into one context and picks the role at attach time
//! - [`comm`] exposes the device over D-Bus
//!
//! The `slotd` binary wires these to the system bus.

pub mod access;
pub mod cache;
pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod image;
pub mod peer;
pub mod poller;
pub mod programming;
pub mod signature;
pub mod slot;
pub mod system_io;
