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

//! slot daemon (slotd) - System service programming reconfigurable accelerator slots.
//!
//! The daemon attaches to the accelerator, decides whether it runs on the function that owns
//! the hardware (privileged role) or on one that has to go through that function (client
//! role), and serves the result on the system bus:
//!
//! - **Service Name**: `com.canonical.slotd`
//! - **Status Interface**: `/com/canonical/slotd/status` - Read-only operations
//! - **Control Interface**: `/com/canonical/slotd/control` - Programming and settings
//! - **Peer Interface** (privileged role only): `/com/canonical/slotd/peer`, also claimed under
//!   `com.canonical.slotd.peer`, used by client-role daemons
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`
//! - `SLOTD_CONFIG` - Path of the configuration file. Defaults to `/etc/slotd/config.toml`
//!
//! # Shutdown
//!
//! On SIGINT or SIGTERM writers still waiting for readers are interrupted, every slot is
//! drained and the device is detached before the process exits.

use log::info;
use slotd::comm::dbus::control_interface::ControlInterface;
use slotd::comm::dbus::peer_interface::PeerInterface;
use slotd::comm::dbus::peer_proxy::DbusPeer;
use slotd::comm::dbus::status_interface::StatusInterface;
use slotd::config::{
    DBUS_CONTROL_PATH, DBUS_PEER_PATH, DBUS_PEER_SERVICE_NAME, DBUS_SERVICE_NAME,
    DBUS_STATUS_PATH, config_path, load_config,
};
use slotd::device::{Collaborators, Device, Role};
use slotd::hardware::firmware::FirmwareDir;
use slotd::hardware::registers::RegisterFile;
use slotd::hardware::{ConsumerTable, RegisterAccess};
use slotd::peer::PeerChannel;
use slotd::signature::Ed25519Verifier;
use std::error::Error;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use zbus::Connection;

/// Completes on SIGINT or SIGTERM.
async fn termination() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

/// Main entry point for the slotd daemon.
///
/// 1. Sets up logging via `env_logger` (defaults to "info" level)
/// 2. Loads the configuration
/// 3. Opens the register resource, or connects to the privileged peer when there is none
/// 4. Attaches the device and serves it on the system bus
/// 5. Waits for a termination signal, then drains and detaches
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = load_config(&config_path());
    let connection = Connection::system().await?;

    let registers = match &config.device.register_file {
        Some(path) => Some(Arc::new(RegisterFile::open(path)?) as Arc<dyn RegisterAccess>),
        None => None,
    };
    let peer = if registers.is_some() {
        None
    } else {
        Some(
            Arc::new(DbusPeer::connect(&connection, &config.peer.service).await?)
                as Arc<dyn PeerChannel>,
        )
    };
    let firmware = Arc::new(FirmwareDir::new(&config.firmware_dir));
    let collaborators = Collaborators {
        registers,
        hardware: None,
        peer,
        consumers: Arc::new(ConsumerTable::default()),
        verifier: Arc::new(Ed25519Verifier::from_config(&config.security)?),
    };
    let device = Arc::new(Device::attach(config, collaborators)?);

    let server = connection.object_server();
    server
        .at(DBUS_STATUS_PATH, StatusInterface::new(device.clone()))
        .await?;
    server
        .at(
            DBUS_CONTROL_PATH,
            ControlInterface::new(device.clone(), firmware),
        )
        .await?;
    if device.role() == Role::Privileged {
        server
            .at(DBUS_PEER_PATH, PeerInterface::new(device.clone()))
            .await?;
        connection.request_name(DBUS_PEER_SERVICE_NAME).await?;
    }
    connection.request_name(DBUS_SERVICE_NAME).await?;
    info!(
        "Started {DBUS_SERVICE_NAME} dbus service as {} function",
        device.role()
    );

    termination().await?;
    device.shutdown();
    device.detach().await?;
    Ok(())
}
