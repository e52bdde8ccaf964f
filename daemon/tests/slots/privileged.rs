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

use crate::common::mocks::{IDCODE, bare_image, full_image, id, privileged_rig};
use googletest::prelude::*;
use rstest::*;
use slotd::access::Requester;
use slotd::hardware::{AuxResourceKind, ResourceRecord};
use slotd::image::{ImageBuilder, SectionKind};
use slotd::image::sections::encode;
use slotd::slot::{ConfigurationId, MetadataKind};
use std::sync::atomic::Ordering;

fn requester() -> Requester {
    Requester::from(":1.42")
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn bitstream_reaches_the_port_as_big_endian_words() {
    let rig = privileged_rig(2);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program");

    let words = rig.port.words();
    expect_that!(words.len(), eq(10));
    expect_that!(words.first(), some(eq(&0x0001_0203)));
    expect_that!(words.last(), some(eq(&0x2425_2627)));
    expect_that!(
        rig.journal.events(),
        elements_are![
            eq("freeze"),
            eq("write 10"),
            eq("unfreeze"),
            eq("clocks [300, 500]"),
            eq("calibrate 2")
        ]
    );
}

#[gtest]
#[tokio::test(start_paused = true)]
#[rstest]
#[case::roomy(16, &["write 10"])]
#[case::tight(4, &["write 4", "write 4", "write 2"])]
#[case::uneven(3, &["write 3", "write 3", "write 3", "write 1"])]
async fn bitstream_is_chunked_by_fifo_vacancy(#[case] vacancy: u32, #[case] writes: &[&str]) {
    let rig = privileged_rig(2);
    rig.port.vacancy.store(vacancy, Ordering::SeqCst);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program");

    let streamed: Vec<String> = rig
        .journal
        .events()
        .into_iter()
        .filter(|e| e.starts_with("write"))
        .collect();
    expect_that!(streamed, eq(&writes.iter().map(|w| w.to_string()).collect::<Vec<_>>()));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn flat_images_are_not_streamed() {
    let rig = privileged_rig(1);
    rig.device
        .program(0, &bare_image(1).mode(0).build(), requester())
        .await
        .expect("program");

    expect_that!(rig.journal.events(), elements_are![eq("freeze"), eq("unfreeze")]);
    expect_that!(rig.port.words(), is_empty());
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&id(1))));
}

#[gtest]
#[tokio::test(start_paused = true)]
#[rstest]
#[case::partitioned(2, true)]
#[case::flat(1, false)]
async fn clocks_follow_the_image_on_partitioned_hardware(
    #[case] version: u32,
    #[case] rescaled: bool,
) {
    let rig = privileged_rig(version);
    rig.device
        .program(1, &full_image(1).build(), requester())
        .await
        .expect("program");

    expect_that!(rig.journal.contains("clocks [300, 500]"), eq(rescaled));
    if rescaled {
        expect_that!(rig.device.clock_frequencies(1).await, ok(eq(&vec![300u16, 500])));
        expect_that!(rig.device.query_clock(1, 1).await, ok(eq(&500)));
        expect_that!(
            rig.device.measured_frequencies(1).await,
            ok(eq(&vec![300_000u32, 500_000]))
        );
    }
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn clock_index_out_of_range_is_an_argument_error() {
    let rig = privileged_rig(2);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program");
    expect_that!(
        rig.device.query_clock(0, 2).await,
        err(displays_as(contains_substring("clock 2 does not exist, there are 2")))
    );
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn aux_resources_follow_the_ip_and_debug_layouts() {
    let rig = privileged_rig(2);
    let image = full_image(1).section(
        SectionKind::DebugIpLayout,
        encode::debug_ip_layout(&[(3, 0, 0x1820000, "monitor_0")]),
    );
    rig.device
        .program(0, &image.build(), requester())
        .await
        .expect("program");

    expect_that!(
        rig.resources.live(),
        unordered_elements_are![
            eq(&ResourceRecord {
                kind: AuxResourceKind::MemoryController,
                base_address: 0x1810000,
                name: "ddr4_ctrl".into(),
            }),
            eq(&ResourceRecord {
                kind: AuxResourceKind::DebugMonitor(3),
                base_address: 0x1820000,
                name: "monitor_0".into(),
            }),
        ]
    );

    // Reprogramming replaces them rather than piling up.
    rig.device
        .program(0, &full_image(2).build(), requester())
        .await
        .expect("reprogram");
    expect_that!(rig.resources.live().len(), eq(1));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn used_memory_channels_are_calibrated() {
    let rig = privileged_rig(2);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program");
    expect_that!(rig.calibration.runs(), elements_are![eq(&(2, false))]);

    rig.device
        .program(1, &bare_image(2).build(), requester())
        .await
        .expect("program without topology");
    expect_that!(rig.calibration.runs().len(), eq(1));
}

#[gtest]
#[tokio::test(start_paused = true)]
#[rstest]
#[case::same_topology(false, true)]
#[case::changed_topology(true, false)]
async fn data_is_retained_only_across_an_unchanged_topology(
    #[case] change_topology: bool,
    #[case] retained: bool,
) {
    let rig = privileged_rig(2);
    rig.device.set_data_retention(true).expect("enable retention");
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program A");

    let next = if change_topology {
        ImageBuilder::new(id(2))
            .section(SectionKind::Bitstream, vec![0x11; 8])
            .section(
                SectionKind::MemTopology,
                encode::mem_topology(&[(1, true, 16 * 1024 * 1024, 0x40_0000_0000, "DDR[0]")]),
            )
    } else {
        full_image(2)
    };
    rig.device
        .program(0, &next.build(), requester())
        .await
        .expect("program B");

    let channels = if change_topology { 1 } else { 2 };
    let runs = rig.calibration.runs();
    expect_that!(runs.last(), some(eq(&(channels, retained))));
    expect_that!(rig.device.data_retention().await, ok(eq(&true)));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn calibration_that_never_finishes_rolls_the_slot_back() {
    let rig = privileged_rig(2);
    rig.calibration.completes.store(false, Ordering::SeqCst);

    let result = rig
        .device
        .program(0, &full_image(1).build(), requester())
        .await;
    expect_that!(
        result,
        err(displays_as(contains_substring(
            "calibration of 2 channels did not finish"
        )))
    );
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&ConfigurationId::nil())));
    expect_that!(rig.resources.live(), is_empty());
    expect_true!(rig.journal.contains("unfreeze"));
    expect_that!(rig.device.max_host_mem_aperture(0), ok(eq(&0)));
    expect_that!(
        rig.device.metadata_hex(0, MetadataKind::IpLayout),
        err(displays_as(contains_substring("slot 0 has no ip-layout")))
    );
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn stuck_fifo_times_out_and_unfreezes() {
    let rig = privileged_rig(2);
    rig.port.vacancy.store(0, Ordering::SeqCst);

    expect_that!(
        rig.device
            .program(0, &full_image(1).build(), requester())
            .await,
        err(displays_as(contains_substring("write FIFO never drained")))
    );
    expect_that!(rig.journal.events(), elements_are![eq("freeze"), eq("unfreeze")]);
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&ConfigurationId::nil())));
    expect_that!(rig.calibration.runs(), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn failure_after_a_commit_loses_the_previous_configuration() {
    let rig = privileged_rig(2);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program A");
    rig.calibration.completes.store(false, Ordering::SeqCst);

    expect_that!(
        rig.device
            .program(0, &full_image(2).build(), requester())
            .await,
        err(displays_as(contains_substring("SlotdError::Timeout")))
    );
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&ConfigurationId::nil())));
    expect_that!(rig.resources.live(), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn committed_metadata_is_queryable() {
    let rig = privileged_rig(2);
    rig.device
        .program(1, &full_image(4).build(), requester())
        .await
        .expect("program");

    expect_that!(rig.device.max_host_mem_aperture(1), ok(eq(&268_435_456)));
    expect_that!(
        rig.device.metadata_hex(1, MetadataKind::ClockFreqTopology),
        ok(eq(&hex::encode(encode::clock_topology(&[
            (300, 1, "DATA_CLK"),
            (500, 2, "KERNEL_CLK")
        ]))))
    );
    expect_that!(
        rig.device.metadata_hex(1, MetadataKind::Connectivity),
        err(displays_as(contains_substring("slot 1 has no connectivity")))
    );
    expect_that!(rig.device.query_calibration_status(1).await, ok(eq(&1)));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn the_same_configuration_is_not_loaded_twice() {
    let rig = privileged_rig(2);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program");
    let events = rig.journal.events().len();

    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program again");
    expect_that!(rig.journal.events().len(), eq(events));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn slots_beyond_the_table_are_exhausted() {
    let rig = privileged_rig(2);
    expect_that!(
        rig.device
            .program(2, &bare_image(1).build(), requester())
            .await,
        err(displays_as(contains_substring("SlotdError::ResourceExhausted")))
    );
    expect_that!(rig.journal.events(), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn peer_values_report_every_slot() {
    let rig = privileged_rig(2);
    rig.device
        .program(1, &full_image(5).build(), requester())
        .await
        .expect("program");

    let values = rig.device.peer_values().expect("peer values");
    expect_that!(
        values.configuration_ids,
        elements_are![eq(&ConfigurationId::nil()), eq(&id(5))]
    );
    expect_that!(values.idcode, eq(IDCODE));
    expect_that!(values.clock_freqs_mhz, elements_are![eq(&300), eq(&500)]);
    expect_that!(values.freq_counters_khz, elements_are![eq(&300_000), eq(&500_000)]);
    expect_that!(values.calibration_status, eq(1));
    expect_false!(values.data_retention);
    expect_that!(rig.device.idcode().await, ok(eq(&IDCODE)));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn client_only_settings_are_refused() {
    let rig = privileged_rig(2);
    expect_that!(
        rig.device.set_cache_ttl(5),
        err(displays_as(contains_substring("SlotdError::NotSupported")))
    );
}
