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

use crate::common::mocks::{bare_image, full_image, id, privileged_rig, privileged_rig_with, test_config};
use ed25519_dalek::{Signer, SigningKey};
use googletest::prelude::*;
use rstest::*;
use slotd::access::Requester;
use slotd::image::sections::encode;
use slotd::image::{HEADER_SIZE, SectionKind};
use slotd::signature::{Ed25519Verifier, SecurityLevel};
use slotd::slot::ConfigurationId;
use uuid::Uuid;

const PLATFORM: Uuid = Uuid::from_u128(0x6f2c_1a90_3b4d_4e5f_8a7b_0c1d_2e3f_4a5b);
const OTHER: Uuid = Uuid::from_u128(0x1111_2222_3333_4444_5555_6666_7777_8888);

fn requester() -> Requester {
    Requester::from(":1.5")
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[9; 32])
}

/// Corrupt `bytes` the way a damaged download would.
fn damage(mut bytes: Vec<u8>, how: &str) -> Vec<u8> {
    match how {
        "magic" => bytes[0] = b'X',
        "truncated" => bytes.truncate(HEADER_SIZE - 1),
        // size of the first section header
        "section" => bytes[HEADER_SIZE + 32..HEADER_SIZE + 40]
            .copy_from_slice(&u64::MAX.to_le_bytes()),
        _ => unreachable!("unknown damage {how}"),
    }
    bytes
}

#[gtest]
#[tokio::test(start_paused = true)]
#[rstest]
#[case::bad_magic("magic")]
#[case::truncated_header("truncated")]
#[case::section_past_the_end("section")]
async fn damaged_images_are_rejected_before_freezing(#[case] how: &str) {
    let rig = privileged_rig(2);
    let bytes = damage(full_image(1).build(), how);

    expect_that!(
        rig.device.program(0, &bytes, requester()).await,
        err(displays_as(contains_substring("SlotdError::InvalidImage")))
    );
    expect_that!(rig.journal.events(), is_empty());
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&ConfigurationId::nil())));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn malformed_metadata_is_rejected_before_freezing() {
    let rig = privileged_rig(2);
    let bytes = bare_image(1)
        .section(SectionKind::MemTopology, 5i32.to_le_bytes().to_vec())
        .build();

    expect_that!(
        rig.device.program(0, &bytes, requester()).await,
        err(displays_as(contains_substring("memory topology")))
    );
    expect_that!(rig.journal.events(), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn a_rejected_image_keeps_the_committed_one() {
    let rig = privileged_rig(2);
    rig.device
        .program(0, &full_image(1).build(), requester())
        .await
        .expect("program");
    let events = rig.journal.events().len();

    expect_that!(
        rig.device
            .program(0, &damage(full_image(2).build(), "section"), requester())
            .await,
        err(anything())
    );
    expect_that!(rig.journal.events().len(), eq(events));
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&id(1))));
    expect_that!(rig.resources.live().len(), eq(1));
}

#[gtest]
#[tokio::test(start_paused = true)]
#[rstest]
#[case::matching(Some(PLATFORM), &[OTHER, PLATFORM], true)]
#[case::mismatch(Some(PLATFORM), &[OTHER], false)]
#[case::platform_publishes_none(None, &[PLATFORM], false)]
async fn interface_must_match_the_platform(
    #[case] baseline: Option<Uuid>,
    #[case] interfaces: &[Uuid],
    #[case] accepted: bool,
) {
    let mut config = test_config();
    config.device.interface_uuid = baseline;
    let rig = privileged_rig_with(2, config, Ed25519Verifier::default());
    let bytes = bare_image(1)
        .section(
            SectionKind::PartitionMetadata,
            encode::partition_metadata(interfaces),
        )
        .build();

    let result = rig.device.program(0, &bytes, requester()).await;
    if accepted {
        expect_that!(result, ok(anything()));
    } else {
        expect_that!(
            result,
            err(displays_as(contains_substring("SlotdError::IncompatibleInterface")))
        );
        expect_that!(rig.journal.events(), is_empty());
    }
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn images_without_partition_metadata_skip_the_interface_check() {
    let mut config = test_config();
    config.device.interface_uuid = Some(PLATFORM);
    let rig = privileged_rig_with(2, config, Ed25519Verifier::default());
    expect_that!(
        rig.device
            .program(0, &bare_image(1).build(), requester())
            .await,
        ok(anything())
    );
}

#[gtest]
#[tokio::test(start_paused = true)]
#[rstest]
#[case::unsigned(None, "requires a signed image")]
#[case::wrong_key(Some([3u8; 32]), "verification failed")]
async fn signing_is_enforced_above_level_none(
    #[case] signer: Option<[u8; 32]>,
    #[case] message: &str,
) {
    let verifier = Ed25519Verifier::new(Some(signing_key().verifying_key()), None);
    let rig = privileged_rig_with(2, test_config(), verifier);
    rig.device
        .set_security_level(SecurityLevel::DedicatedKey)
        .expect("security level");

    let image = full_image(1);
    let bytes = match signer {
        Some(seed) => {
            let key = SigningKey::from_bytes(&seed);
            image.build_signed(|payload| key.sign(payload).to_bytes().to_vec())
        }
        None => image.build(),
    };
    expect_that!(
        rig.device.program(0, &bytes, requester()).await,
        err(all!(
            displays_as(contains_substring("SlotdError::SignatureRejected")),
            displays_as(contains_substring(message))
        ))
    );
    expect_that!(rig.journal.events(), is_empty());
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn signed_images_are_programmed() {
    let key = signing_key();
    let verifier = Ed25519Verifier::new(Some(key.verifying_key()), None);
    let rig = privileged_rig_with(2, test_config(), verifier);
    rig.device
        .set_security_level(SecurityLevel::DedicatedKey)
        .expect("security level");

    let bytes = full_image(7).build_signed(|payload| key.sign(payload).to_bytes().to_vec());
    expect_that!(rig.device.program(1, &bytes, requester()).await, ok(anything()));
    expect_that!(rig.device.query_configuration_id(1), ok(eq(&id(7))));
    expect_that!(rig.port.words().len(), eq(10));
}

#[gtest]
#[tokio::test(start_paused = true)]
async fn bad_signatures_are_only_logged_at_level_none() {
    let rig = privileged_rig(2);
    expect_that!(rig.device.security_level(), ok(eq(&SecurityLevel::None)));
    let bytes = full_image(1).build_signed(|_| vec![0; 64]);
    expect_that!(rig.device.program(0, &bytes, requester()).await, ok(anything()));
    expect_that!(rig.device.query_configuration_id(0), ok(eq(&id(1))));
}
