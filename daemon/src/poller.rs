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

//! Bounded-retry register polling.

use crate::error::SlotdError;
use log::trace;
use std::time::Duration;

/// Poll `read` until `value & mask == expected`.
///
/// The register is sampled once per `interval`, for `timeout / interval` iterations (at least
/// one), followed by one last sample after the loop so that a condition which becomes true right
/// at the bound is not reported as a timeout.
///
/// # Arguments
///
/// * `read` - Reads the register. A read error aborts the poll and is returned as is.
/// * `mask` - Bits of the register that take part in the comparison
/// * `expected` - Value the masked bits must equal
/// * `interval` - Delay between two samples
/// * `timeout` - Total time budget
///
/// # Returns: `Result<u32, SlotdError>`
/// * `Ok(u32)` - The full register value that satisfied the condition
/// * `Err(SlotdError::Timeout)` - The condition did not hold within `timeout`
pub async fn poll_until<F>(
    read: F,
    mask: u32,
    expected: u32,
    interval: Duration,
    timeout: Duration,
) -> Result<u32, SlotdError>
where
    F: FnMut() -> Result<u32, SlotdError>,
{
    poll_for(read, |value| value & mask == expected, interval, timeout)
        .await
        .map_err(|e| match e {
            SlotdError::Timeout(last) => SlotdError::Timeout(format!(
                "{last}, wanted {expected:#010x} under mask {mask:#010x}"
            )),
            other => other,
        })
}

/// [`poll_until`] with an arbitrary acceptance test, e.g. "FIFO vacancy is non-zero".
pub async fn poll_for<F, P>(
    mut read: F,
    accept: P,
    interval: Duration,
    timeout: Duration,
) -> Result<u32, SlotdError>
where
    F: FnMut() -> Result<u32, SlotdError>,
    P: Fn(u32) -> bool,
{
    let iterations = if interval.is_zero() {
        1
    } else {
        (timeout.as_nanos() / interval.as_nanos()).max(1)
    };
    for _ in 0..iterations {
        let value = read()?;
        if accept(value) {
            return Ok(value);
        }
        tokio::time::sleep(interval).await;
    }
    let value = read()?;
    if accept(value) {
        return Ok(value);
    }
    trace!("poll gave up after {timeout:?} with {value:#010x}");
    Err(SlotdError::Timeout(format!(
        "register stayed at {value:#010x} for {timeout:?}"
    )))
}

/// One-time probe of a fixed register against its expected value.
///
/// Unlike [`poll_until`] this is not retried: a mismatch means the hardware is not the
/// generation this daemon was configured for, which is fatal rather than transient.
pub fn check_register_layout<F>(read: F, what: &str, expected: u32) -> Result<u32, SlotdError>
where
    F: FnOnce() -> Result<u32, SlotdError>,
{
    let value = read()?;
    trace!("{what} probe read {value:#010x}");
    if value != expected {
        return Err(SlotdError::Layout(format!(
            "{what} reads {value:#010x}, expected {expected:#010x}"
        )));
    }
    Ok(value)
}
