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

use crate::common::mocks::{bare_image, full_image, id, privileged_rig};
use googletest::prelude::*;
use rstest::*;
use slotd::access::Requester;
use slotd::error::SlotdError;
use slotd::slot::MetadataKind;
use std::sync::Arc;
use std::time::Duration;

/// Let spawned tasks run until they block.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn readers_fail_fast_while_a_writer_drains() {
    let rig = privileged_rig(2);
    let device = rig.device.clone();
    let views: Vec<_> = (0..3)
        .map(|_| device.acquire_read(0).expect("reader before any writer"))
        .collect();
    expect_that!(device.reader_count(0), ok(eq(&3)));

    let writer = tokio::spawn({
        let device = device.clone();
        let image = bare_image(1).build();
        async move { device.program(0, &image, Requester::from(":1.7")).await }
    });
    settle().await;
    expect_false!(writer.is_finished());

    expect_that!(
        device.acquire_read(0),
        err(displays_as(contains_substring("SlotdError::Busy")))
    );
    expect_that!(
        device
            .program(0, &bare_image(2).build(), Requester::from(":1.8"))
            .await,
        err(displays_as(contains_substring("being reprogrammed by :1.7")))
    );

    drop(views);
    expect_that!(writer.await.expect("writer task"), ok(anything()));
    expect_that!(device.query_configuration_id(0), ok(eq(&id(1))));
}

#[gtest]
#[tokio::test(start_paused = true)]
#[rstest]
#[case::in_order([0, 1, 2])]
#[case::reversed([2, 1, 0])]
#[case::middle_first([1, 0, 2])]
#[case::last_first([2, 0, 1])]
async fn writer_waits_for_every_reader(#[case] order: [usize; 3]) {
    let rig = privileged_rig(2);
    let device = rig.device.clone();
    let mut views: Vec<_> = (0..3)
        .map(|_| Some(device.acquire_read(1).expect("reader")))
        .collect();

    let writer = tokio::spawn({
        let device = device.clone();
        let image = bare_image(3).build();
        async move { device.program(1, &image, Requester::from(":1.9")).await }
    });
    for (released, index) in order.iter().enumerate() {
        settle().await;
        expect_false!(writer.is_finished());
        views[*index].take();
        expect_that!(device.reader_count(1), ok(eq(&(2 - released as u32))));
    }
    expect_that!(writer.await.expect("writer task"), ok(anything()));
    expect_that!(device.reader_count(1), ok(eq(&0)));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn bound_consumers_block_reprogramming() {
    let rig = privileged_rig(2);
    let device = &rig.device;
    device
        .program(0, &full_image(1).build(), Requester::from(":1.1"))
        .await
        .expect("program A");
    let before = device
        .acquire_read(0)
        .expect("read")
        .metadata(MetadataKind::IpLayout)
        .expect("ip layout");
    expect_that!(device.mark_in_use(0, id(1)), ok(eq(&1)));

    let freezes = rig.journal.events().len();
    expect_that!(
        device
            .program(0, &full_image(2).build(), Requester::from(":1.1"))
            .await,
        err(displays_as(contains_substring("in use by 1 consumers")))
    );
    expect_that!(rig.journal.events().len(), eq(freezes));
    expect_that!(device.query_configuration_id(0), ok(eq(&id(1))));
    let after = device
        .acquire_read(0)
        .expect("read")
        .metadata(MetadataKind::IpLayout)
        .expect("ip layout");
    expect_true!(Arc::ptr_eq(&before, &after));

    expect_that!(device.mark_unused(0, id(1)), ok(eq(&0)));
    expect_that!(
        device
            .program(0, &full_image(2).build(), Requester::from(":1.1"))
            .await,
        ok(anything())
    );
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn consumers_only_bind_to_the_committed_configuration() {
    let rig = privileged_rig(2);
    let device = &rig.device;
    expect_that!(
        device.mark_in_use(0, id(1)),
        err(displays_as(contains_substring("SlotdError::Busy")))
    );
    device
        .program(0, &bare_image(1).build(), Requester::from(":1.1"))
        .await
        .expect("program");
    expect_that!(
        device.mark_in_use(0, id(2)),
        err(displays_as(contains_substring("SlotdError::Busy")))
    );
    expect_that!(
        device.mark_unused(0, id(1)),
        err(displays_as(contains_substring("SlotdError::InvariantViolation")))
    );
    expect_that!(device.in_use_count(0), ok(eq(&0)));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn reprogramming_releases_the_previous_buffers() {
    let rig = privileged_rig(2);
    let device = &rig.device;
    device
        .program(0, &full_image(1).build(), Requester::from(":1.1"))
        .await
        .expect("program A");
    expect_that!(device.query_configuration_id(0), ok(eq(&id(1))));
    let old = Arc::downgrade(
        &device
            .acquire_read(0)
            .expect("read")
            .metadata(MetadataKind::MemTopology)
            .expect("memory topology"),
    );
    expect_true!(old.upgrade().is_some());

    device
        .program(0, &full_image(2).build(), Requester::from(":1.1"))
        .await
        .expect("program B");
    expect_that!(device.query_configuration_id(0), ok(eq(&id(2))));
    expect_true!(old.upgrade().is_none());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_a_draining_writer() {
    let rig = privileged_rig(2);
    let device = rig.device.clone();
    let reader = device.acquire_read(0).expect("reader");

    let writer = tokio::spawn({
        let device = device.clone();
        let image = bare_image(1).build();
        async move { device.program(0, &image, Requester::from(":1.4")).await }
    });
    settle().await;
    device.shutdown();
    let result = writer.await.expect("writer task");
    expect_that!(
        result,
        err(displays_as(contains_substring("SlotdError::Interrupted")))
    );
    expect_false!(result.as_ref().is_err_and(SlotdError::is_fatal));

    // The claim went away with the interrupted call.
    drop(reader);
    let again = device.acquire_read(0);
    expect_that!(again, ok(anything()));
    expect_that!(device.query_configuration_id(0).map(|id| id.is_nil()), ok(eq(&true)));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn detach_drains_and_releases_everything() {
    let rig = privileged_rig(2);
    let device = rig.device.clone();
    device
        .program(1, &full_image(1).build(), Requester::from(":1.1"))
        .await
        .expect("program");
    device.mark_in_use(1, id(1)).expect("bind");
    expect_that!(rig.resources.live().len(), eq(1));

    let reader = tokio::spawn({
        let device = device.clone();
        async move {
            let _view = device.acquire_read(1).expect("reader");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });
    settle().await;
    expect_that!(device.reader_count(1), ok(eq(&1)));

    device.detach().await.expect("detach");
    expect_true!(reader.is_finished());
    expect_that!(device.in_use_count(1), ok(eq(&0)));
    expect_that!(rig.resources.live(), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn a_detached_device_refuses_further_work() {
    let rig = privileged_rig(2);
    let device = &rig.device;
    device
        .program(0, &full_image(1).build(), Requester::from(":1.1"))
        .await
        .expect("program");
    device.detach().await.expect("detach");
    let events = rig.journal.events().len();

    expect_that!(
        device
            .program(0, &full_image(2).build(), Requester::from(":1.1"))
            .await,
        err(displays_as(contains_substring("device is detached")))
    );
    expect_that!(
        device.mark_in_use(0, id(1)),
        err(displays_as(contains_substring("SlotdError::Argument")))
    );
    expect_that!(device.acquire_read(0).map(|_| ()), err(anything()));
    expect_that!(rig.journal.events().len(), eq(events));
    expect_that!(rig.resources.live(), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn programming_after_a_draining_detach_is_refused() {
    let rig = privileged_rig(2);
    let device = rig.device.clone();
    let reader = device.acquire_read(0).expect("reader");

    let detach = tokio::spawn({
        let device = device.clone();
        async move { device.detach().await }
    });
    settle().await;
    expect_false!(detach.is_finished());
    drop(reader);
    expect_that!(detach.await.expect("detach task"), ok(anything()));
    expect_that!(
        device
            .program(0, &bare_image(1).build(), Requester::from(":1.2"))
            .await,
        err(displays_as(contains_substring("device is detached")))
    );
    expect_that!(rig.journal.events(), is_empty());
}
