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

use crate::common::mocks::{IDCODE, client_rig, full_image, id};
use googletest::prelude::*;
use rstest::*;
use slotd::access::Requester;
use slotd::device::Role;
use slotd::slot::ConfigurationId;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn requester() -> Requester {
    Requester::from(":1.3")
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn images_are_programmed_through_the_peer() {
    let rig = client_rig(Duration::ZERO);
    expect_that!(rig.device.role(), eq(Role::Client));
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program");

    expect_that!(rig.peer.loads.load(Ordering::SeqCst), eq(1));
    expect_that!(
        rig.privileged.device.query_configuration_id(0),
        ok(eq(&id(1)))
    );
    expect_true!(rig.privileged.journal.contains("calibrate 2"));
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&id(1))));
    expect_that!(rig.device.max_host_mem_aperture(0), ok(eq(&268_435_456)));
    expect_that!(
        rig.consumers
            .registered(0)
            .into_iter()
            .map(|c| c.name)
            .collect::<Vec<_>>(),
        elements_are![eq("vadd:vadd_1")]
    );
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn hardware_values_come_from_the_peer() {
    let rig = client_rig(Duration::ZERO);
    rig.device
        .program(1, &full_image(2).build(), requester())
        .await
        .expect("program");
    rig.privileged
        .device
        .set_data_retention(true)
        .expect("enable retention");

    expect_that!(rig.device.idcode().await, ok(eq(&IDCODE)));
    expect_that!(rig.device.clock_frequencies(1).await, ok(eq(&vec![300u16, 500])));
    expect_that!(rig.device.query_clock(1, 0).await, ok(eq(&300)));
    expect_that!(
        rig.device.measured_frequencies(1).await,
        ok(eq(&vec![300_000u32, 500_000]))
    );
    expect_that!(rig.device.query_calibration_status(1).await, ok(eq(&1)));
    expect_that!(rig.device.data_retention().await, ok(eq(&true)));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn download_is_skipped_when_the_peer_already_holds_the_image() {
    let rig = client_rig(Duration::ZERO);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program");
    // Refresh the cache, which the download expired.
    rig.device.idcode().await.expect("idcode");

    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program again");
    expect_that!(rig.peer.loads.load(Ordering::SeqCst), eq(1));
    expect_that!(rig.consumers.registered(0).len(), eq(1));

    rig.device
        .program(0, &full_image(2).build(), requester())
        .await
        .expect("program another image");
    expect_that!(rig.peer.loads.load(Ordering::SeqCst), eq(2));
    expect_that!(rig.privileged.device.query_configuration_id(0), ok(eq(&id(2))));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn peer_values_are_cached_for_the_ttl() {
    let rig = client_rig(Duration::ZERO);
    rig.device.idcode().await.expect("first");
    rig.device.idcode().await.expect("second");
    expect_that!(rig.peer.queries.load(Ordering::SeqCst), eq(1));

    tokio::time::sleep(Duration::from_millis(1001)).await;
    rig.device.idcode().await.expect("after expiry");
    expect_that!(rig.peer.queries.load(Ordering::SeqCst), eq(2));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn a_zero_ttl_always_asks_the_peer() {
    let rig = client_rig(Duration::ZERO);
    rig.device.set_cache_ttl(0).expect("ttl");
    rig.device.idcode().await.expect("first");
    rig.device.idcode().await.expect("second");
    expect_that!(rig.peer.queries.load(Ordering::SeqCst), eq(2));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn a_peer_that_never_answers_times_out() {
    let rig = client_rig(Duration::from_secs(60));
    let result = rig
        .device
        .program(0, &full_image(1).build(), requester())
        .await;

    expect_that!(
        result,
        err(displays_as(contains_substring("no answer from peer within 50s")))
    );
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&ConfigurationId::nil())));
    expect_that!(rig.consumers.registered(0), is_empty());
    expect_that!(
        rig.privileged.device.query_configuration_id(0),
        ok(eq(&ConfigurationId::nil()))
    );
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn peer_failures_roll_the_client_back() {
    let rig = client_rig(Duration::ZERO);
    rig.privileged.port.vacancy.store(0, Ordering::SeqCst);

    let result = rig
        .device
        .program(0, &full_image(1).build(), requester())
        .await;
    expect_that!(
        result,
        err(all!(
            displays_as(contains_substring("SlotdError::Timeout")),
            displays_as(contains_substring("write FIFO never drained"))
        ))
    );
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&ConfigurationId::nil())));
    expect_that!(rig.consumers.registered(0), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn a_failed_reprogram_leaves_nothing_of_the_old_configuration() {
    let rig = client_rig(Duration::ZERO);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program A");
    // Cache the peer's view, which now names A for slot 0.
    rig.device.idcode().await.expect("idcode");
    expect_that!(rig.consumers.registered(0).len(), eq(1));

    rig.privileged.port.vacancy.store(0, Ordering::SeqCst);
    expect_that!(
        rig.device
            .program(0, &full_image(2).build(), requester())
            .await,
        err(displays_as(contains_substring("SlotdError::Timeout")))
    );
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&ConfigurationId::nil())));
    expect_that!(rig.consumers.registered(0), is_empty());
    expect_that!(
        rig.privileged.device.query_configuration_id(0),
        ok(eq(&ConfigurationId::nil()))
    );

    // The peer lost A as well, so reloading it must not trust the old cached view.
    rig.privileged.port.vacancy.store(16, Ordering::SeqCst);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program A again");
    expect_that!(rig.peer.loads.load(Ordering::SeqCst), eq(3));
    expect_that!(rig.privileged.device.query_configuration_id(0), ok(eq(&id(1))));
    expect_that!(rig.consumers.registered(0).len(), eq(1));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn a_busy_peer_is_reported_as_busy() {
    let rig = client_rig(Duration::ZERO);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program A");
    rig.privileged
        .device
        .mark_in_use(0, id(1))
        .expect("bind on the privileged side");

    let result = rig
        .device
        .program(0, &full_image(2).build(), requester())
        .await;
    expect_that!(
        result,
        err(all!(
            displays_as(contains_substring("SlotdError::Busy")),
            displays_as(contains_substring("in use by 1 consumers"))
        ))
    );
    expect_false!(result.is_err_and(|e| e.is_fatal()));
    expect_that!(rig.consumers.registered(0), is_empty());
    expect_that!(rig.privileged.device.query_configuration_id(0), ok(eq(&id(1))));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn detach_unregisters_local_consumers() {
    let rig = client_rig(Duration::ZERO);
    rig.device
        .program(1, &full_image(1).build(), requester())
        .await
        .expect("program");
    expect_that!(rig.consumers.registered(1).len(), eq(1));

    rig.device.detach().await.expect("detach");
    expect_that!(rig.consumers.registered(1), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
#[rstest]
#[case::zero(0)]
#[case::default(1)]
#[case::maximum(10)]
async fn cache_ttl_accepts_up_to_ten_seconds(#[case] secs: u64) {
    let rig = client_rig(Duration::ZERO);
    expect_that!(rig.device.set_cache_ttl(secs), ok(anything()));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn settings_owned_by_the_privileged_function_are_refused() {
    let rig = client_rig(Duration::ZERO);
    expect_that!(
        rig.device.set_cache_ttl(11),
        err(displays_as(contains_substring("at most 10s, got 11")))
    );
    expect_that!(
        rig.device.set_data_retention(true),
        err(displays_as(contains_substring("SlotdError::NotSupported")))
    );
    expect_that!(
        rig.device.peer_values(),
        err(displays_as(contains_substring("SlotdError::NotSupported")))
    );
}
