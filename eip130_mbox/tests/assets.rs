// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use eip130_mbox::sim::{SimConfig, SimEngine};
use eip130_mbox::{Config, Eip130, Error};
use eip130_regs::MailboxNumber;
use eip130_token::policy::PolicyV2;
use eip130_token::ResultCode;
use proptest::prelude::*;

fn linked() -> Eip130<SimEngine> {
    let mut eip = Eip130::new(SimEngine::new(SimConfig::running()), Config::default());
    eip.link(MailboxNumber::FIRST).unwrap();
    eip
}

#[test]
fn search_static_asset() {
    let mut eip = linked();
    let (id, len) = eip.asset_search(5).unwrap().unwrap();
    assert_eq!(id.get(), 0x1000);
    assert_eq!(len, 32);
    assert_eq!(eip.asset_search(7).unwrap(), None);
}

#[test]
fn create_load_delete() {
    let mut eip = linked();
    let policy = PolicyV2::SYM_BULK_AES | PolicyV2::TEMPORARY;
    let id = eip.asset_create(policy.bits(), 16).unwrap();
    assert_eq!(eip.io_mut().dynamic_assets(), 1);
    eip.asset_load_random(id).unwrap();
    eip.asset_delete(id.get()).unwrap();
    assert_eq!(eip.io_mut().dynamic_assets(), 0);

    match eip.asset_load_random(id) {
        Err(Error::Token(e)) => assert!(e.is(ResultCode::InvalidAsset)),
        other => panic!("unexpected {other:?}"),
    }
    match eip.asset_delete(id.get()) {
        Err(Error::Token(e)) => assert!(e.is(ResultCode::InvalidAsset)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn programmed_asset_is_found_by_search() {
    let mut eip = linked();
    assert_eq!(eip.asset_search(9).unwrap(), None);
    let data: Vec<u8> = (0..24).map(|i| i * 3).collect();
    eip.otp_data_write(9, 0, &data, b"").unwrap();

    let (id, len) = eip.asset_search(9).unwrap().unwrap();
    assert_eq!(len, 24);
    let mut back = [0u8; 24];
    assert_eq!(eip.public_data(id, &mut back).unwrap(), Some(24));
    assert_eq!(&back[..], &data[..]);

    // OTP is written once
    match eip.otp_data_write(9, 0, &data, b"") {
        Err(Error::Token(e)) => assert!(e.is(ResultCode::OtpWriteError)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(eip.io_mut().live_dma_buffers(), 0);
}

#[test]
fn delete_zero_stays_local() {
    let mut eip = linked();
    let before = eip.io_mut().stats().tokens_processed;
    assert!(matches!(eip.asset_delete(0), Err(Error::InvalidAsset)));
    assert_eq!(eip.io_mut().stats().tokens_processed, before);
}

#[test]
fn asset_store_fills_up() {
    let mut eip = linked();
    let policy = PolicyV2::SYM_BASE.bits();
    let ids: Vec<_> = (0..16)
        .map(|_| eip.asset_create(policy, 8).unwrap())
        .collect();
    match eip.asset_create(policy, 8) {
        Err(Error::Token(e)) => assert!(e.is(ResultCode::FullError)),
        other => panic!("unexpected {other:?}"),
    }
    eip.asset_delete(ids[3].get()).unwrap();
    eip.asset_create(policy, 8).unwrap();
}

proptest! {
    #[test]
    fn search_finds_what_was_programmed(
        index in (0u8..=126).prop_filter("taken", |i| *i != 5 && *i != 20),
        len in 1usize..=64,
    ) {
        let mut eip = linked();
        prop_assert_eq!(eip.asset_search(u32::from(index)).unwrap(), None);
        eip.otp_data_write(index, 0, &vec![0xA5; len], b"").unwrap();
        let (id, found) = eip.asset_search(u32::from(index)).unwrap().unwrap();
        prop_assert_eq!(found as usize, len);
        let mut back = vec![0u8; 64];
        prop_assert_eq!(eip.public_data(id, &mut back).unwrap(), Some(len));
        prop_assert!(back[..len].iter().all(|b| *b == 0xA5));
    }

    #[test]
    fn created_assets_get_distinct_ids(lengths in prop::collection::vec(1u32..=64, 1..10)) {
        let mut eip = linked();
        let policy = PolicyV2::SYM_BASE.bits();
        let mut ids = Vec::new();
        for len in &lengths {
            let id = eip.asset_create(policy, *len).unwrap();
            prop_assert!(!ids.contains(&id));
            ids.push(id);
        }
        for id in &ids {
            eip.asset_load_random(*id).unwrap();
            eip.asset_delete(id.get()).unwrap();
        }
        prop_assert_eq!(eip.io_mut().dynamic_assets(), 0);
    }
}
