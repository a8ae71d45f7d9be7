// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asset management tokens: search, create, load and delete.

use crate::policy::PolicyVersion;
use crate::{AssetId, AssetSubcode, CommandToken, DmaAddress, Opcode, ResultToken, COMMAND_WORDS};

const LENGTH_MASK: u32 = 0x3FF;

/// First word of the AAD region of an asset load.
pub const AAD_WORD: usize = 10;
/// Largest AAD an asset load token can carry.
pub const AAD_MAX: usize = (COMMAND_WORDS - AAD_WORD) * 4;
/// Shorter AAD is zero padded up to this length.
pub const AAD_MIN: usize = 16;

const CREATE_ALL_HOSTS: u32 = 1 << 25;
const CREATE_REMOVE_SECURE: u32 = 1 << 24;
const CREATE_LIFETIME_MASK: u32 = 0xF << 28;
const CREATE_LIFETIME_RELATIVE: u32 = 1 << 29;
const CREATE_LIFETIME_NO_LOAD: u32 = 1 << 28;

const LOAD_DERIVE: u32 = 1 << 24;
const LOAD_RANDOM: u32 = 1 << 25;
const LOAD_IMPORT: u32 = 1 << 26;
const LOAD_PLAINTEXT: u32 = 1 << 27;
const LOAD_UNWRAP: u32 = 1 << 28;
const LOAD_EXPORT: u32 = 1 << 31;
const DERIVE_COUNTER: u32 = 1 << 14;
const DERIVE_RFC5869: u32 = 1 << 15;
const AAD_LEN_SHIFT: u32 = 16;
const AAD_LEN_MASK: u32 = 0xFF << AAD_LEN_SHIFT;

fn asset(sub: AssetSubcode) -> CommandToken {
    CommandToken::new(Opcode::AssetManagement, sub as u8)
}

/// Look up the static asset at `index`. The index field is wider on V2
/// firmware.
pub fn search(index: u32, version: PolicyVersion) -> CommandToken {
    let mut t = asset(AssetSubcode::Search);
    t.w[4] = (index & version.search_index_mask()) << 16;
    t
}

/// Asset id and data length of a search result. `None` when the engine
/// reported id 0.
pub fn parse_search(r: &ResultToken) -> Option<(AssetId, u32)> {
    r.asset_id().map(|id| (id, r.word(2) & LENGTH_MASK))
}

pub fn create(policy: u64, length: u32) -> CommandToken {
    let mut t = asset(AssetSubcode::Create);
    t.w[2] = policy as u32;
    t.w[3] = (policy >> 32) as u32;
    t.w[4] = length & LENGTH_MASK;
    t.w[5] = 0;
    t.w[6] = 0;
    t
}

/// Let every host use the asset, not only the creator.
pub fn create_set_all_hosts(t: &mut CommandToken) {
    t.w[4] |= CREATE_ALL_HOSTS;
}

/// Allow the asset to be removed by the secure host only.
pub fn create_set_remove_secure(t: &mut CommandToken) {
    t.w[4] |= CREATE_REMOVE_SECURE;
}

/// How an asset's lifetime is counted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Lifetime {
    /// Two-bit lifetime use selector (seconds, uses, ...).
    pub usage: u8,
    pub relative: bool,
    /// `None` leaves the lifetime to be loaded later.
    pub value: Option<u32>,
}

pub fn create_set_lifetime(t: &mut CommandToken, lifetime: Lifetime) {
    t.w[4] &= !CREATE_LIFETIME_MASK;
    t.w[4] |= (u32::from(lifetime.usage) & 0x3) << 30;
    if lifetime.relative {
        t.w[4] |= CREATE_LIFETIME_RELATIVE;
    }
    match lifetime.value {
        Some(v) => t.w[5] = v,
        None => {
            t.w[4] |= CREATE_LIFETIME_NO_LOAD;
            t.w[5] = 0;
        }
    }
}

pub fn parse_create(r: &ResultToken) -> Option<AssetId> {
    r.asset_id()
}

fn load(id: AssetId, mode: u32) -> CommandToken {
    let mut t = asset(AssetSubcode::Load);
    t.w[2] = id.get();
    t.w[3] = mode;
    t
}

pub fn load_random(id: AssetId) -> CommandToken {
    load(id, LOAD_RANDOM)
}

/// Derive the asset from the key derivation key `kdk`. The label goes in the
/// AAD; firmware that wants an application id gets one through
/// [`insert_app_id`].
pub fn load_derive(id: AssetId, kdk: AssetId, counter: bool, rfc5869: bool) -> CommandToken {
    let mut mode = LOAD_DERIVE;
    if counter {
        mode |= DERIVE_COUNTER;
    }
    if rfc5869 {
        mode |= DERIVE_RFC5869;
    }
    let mut t = load(id, mode);
    t.w[9] = kdk.get();
    t
}

pub fn load_plaintext(id: AssetId) -> CommandToken {
    load(id, LOAD_PLAINTEXT)
}

/// Import a key blob previously exported under `kek`.
pub fn load_import(id: AssetId, kek: AssetId) -> CommandToken {
    let mut t = load(id, LOAD_IMPORT);
    t.w[9] = kek.get();
    t
}

pub fn load_unwrap(id: AssetId, kek: AssetId, algorithm: u8) -> CommandToken {
    let mut t = load(id, LOAD_UNWRAP);
    t.w[8] = u32::from(algorithm) << 16;
    t.w[9] = kek.get();
    t
}

/// Copy `aad` into the token, truncated to what fits and zero padded to
/// [`AAD_MIN`]. Returns the length recorded in the token.
pub fn load_set_aad(t: &mut CommandToken, aad: &[u8]) -> usize {
    let mut padded = [0u8; AAD_MAX];
    let n = aad.len().min(AAD_MAX);
    padded[..n].copy_from_slice(&aad[..n]);
    let n = t.write_bytes(AAD_WORD, &padded[..n.max(AAD_MIN)]);
    t.w[3] = (t.w[3] & !AAD_LEN_MASK) | (n as u32) << AAD_LEN_SHIFT;
    n
}

fn aad_len(t: &CommandToken) -> usize {
    ((t.w[3] & AAD_LEN_MASK) >> AAD_LEN_SHIFT) as usize
}

/// Only derivations mix an application id into their label.
pub fn needs_app_id(t: &CommandToken) -> bool {
    t.opcode() == Some(Opcode::AssetManagement)
        && t.subcode() == AssetSubcode::Load as u8
        && t.w[3] & LOAD_DERIVE != 0
}

/// Prepend `app_id` to the AAD of a derive token. The existing AAD moves up
/// and loses its tail if both no longer fit. Other tokens are left alone.
pub fn insert_app_id(t: &mut CommandToken, app_id: &[u8]) {
    if !needs_app_id(t) {
        return;
    }
    let id = &app_id[..app_id.len().min(AAD_MAX)];
    let keep = aad_len(t).min(AAD_MAX - id.len());

    let mut aad = vec![0u8; keep];
    t.read_bytes(AAD_WORD, &mut aad);
    let mut joined = Vec::with_capacity(id.len() + keep);
    joined.extend_from_slice(id);
    joined.extend_from_slice(&aad);
    load_set_aad(t, &joined);
}

/// Data read by a plaintext or import load.
pub fn load_set_input(t: &mut CommandToken, addr: DmaAddress, len: u32) {
    t.w[3] |= len & LENGTH_MASK;
    t.set_dma_address(4, addr);
}

/// Where a load writes its key blob, when it writes one.
pub fn load_set_output(t: &mut CommandToken, addr: DmaAddress, len: u32) {
    t.w[8] |= len & LENGTH_MASK;
    t.set_dma_address(6, addr);
}

/// Ask for the loaded asset back as a key blob wrapped with `kek`.
pub fn load_export(t: &mut CommandToken, kek: AssetId) {
    t.w[3] |= LOAD_EXPORT;
    t.w[9] = kek.get();
}

/// Size of the key blob written by an exporting load.
pub fn parse_load(r: &ResultToken) -> u32 {
    r.word(1) & LENGTH_MASK
}

pub fn delete(id: AssetId) -> CommandToken {
    let mut t = asset(AssetSubcode::Delete);
    t.w[2] = id.get();
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RESULT_WORDS;
    use proptest::prelude::*;

    fn id(raw: u32) -> AssetId {
        AssetId::new(raw).unwrap()
    }

    #[test]
    fn search_masks_by_version() {
        let t = search(0x1C5, PolicyVersion::V2);
        assert_eq!(t.word(0), 0x0700_0000);
        assert_eq!(t.word(4), 0xC5 << 16);
        let t = search(0x1C5, PolicyVersion::V1);
        assert_eq!(t.word(4), 0x05 << 16);
    }

    #[test]
    fn search_result() {
        let mut w = [0u32; RESULT_WORDS];
        w[1] = 0x1000;
        w[2] = 0xFC20;
        let (found, len) = parse_search(&ResultToken::from_words(w)).unwrap();
        assert_eq!(found.get(), 0x1000);
        assert_eq!(len, 0x20);

        w[1] = 0;
        assert!(parse_search(&ResultToken::from_words(w)).is_none());
    }

    #[test]
    fn create_layout() {
        let mut t = create(0x1234_5678_9ABC_DEF0, 0x7FF);
        assert_eq!(t.word(0), 0x1700_0000);
        assert_eq!(t.word(2), 0x9ABC_DEF0);
        assert_eq!(t.word(3), 0x1234_5678);
        assert_eq!(t.word(4), 0x3FF);

        create_set_all_hosts(&mut t);
        create_set_remove_secure(&mut t);
        assert_eq!(t.word(4), 0x0300_03FF);

        create_set_lifetime(
            &mut t,
            Lifetime {
                usage: 2,
                relative: true,
                value: Some(3600),
            },
        );
        assert_eq!(t.word(4), 0xA300_03FF);
        assert_eq!(t.word(5), 3600);

        create_set_lifetime(
            &mut t,
            Lifetime {
                usage: 1,
                relative: false,
                value: None,
            },
        );
        assert_eq!(t.word(4), 0x5300_03FF);
        assert_eq!(t.word(5), 0);
    }

    #[test]
    fn load_variants() {
        let t = load_random(id(5));
        assert_eq!(t.word(0), 0x2700_0000);
        assert_eq!(t.word(2), 5);
        assert_eq!(t.word(3), 1 << 25);

        let t = load_derive(id(5), id(9), true, true);
        assert_eq!(t.word(3), (1 << 24) | (1 << 14) | (1 << 15));
        assert_eq!(t.word(9), 9);

        assert_eq!(load_plaintext(id(5)).word(3), 1 << 27);

        let t = load_import(id(5), id(7));
        assert_eq!(t.word(3), 1 << 26);
        assert_eq!(t.word(9), 7);

        let t = load_unwrap(id(5), id(7), 3);
        assert_eq!(t.word(3), 1 << 28);
        assert_eq!(t.word(8), 3 << 16);
        assert_eq!(t.word(9), 7);
    }

    #[test]
    fn load_io_and_export() {
        let mut t = load_plaintext(id(5));
        load_set_input(&mut t, DmaAddress(0x2_0000_1000), 0x420);
        assert_eq!(t.word(3), (1 << 27) | 0x20);
        assert_eq!(t.word(4), 0x1000);
        assert_eq!(t.word(5), 2);

        let mut t = load_random(id(5));
        load_set_output(&mut t, DmaAddress(0x3000), 48);
        load_export(&mut t, id(0x44));
        assert_eq!(t.word(3), (1 << 25) | (1 << 31));
        assert_eq!(t.word(6), 0x3000);
        assert_eq!(t.word(8), 48);
        assert_eq!(t.word(9), 0x44);

        let mut w = [0u32; RESULT_WORDS];
        w[1] = 0xF430;
        assert_eq!(parse_load(&ResultToken::from_words(w)), 0x30);
    }

    #[test]
    fn aad_is_bounded() {
        let mut t = load_random(id(5));
        let big = vec![0x5Au8; 300];
        assert_eq!(load_set_aad(&mut t, &big), AAD_MAX);
        assert_eq!((t.word(3) >> 16) & 0xFF, AAD_MAX as u32);
        assert_eq!(t.word(COMMAND_WORDS - 1), 0x5A5A_5A5A);

        let mut t = load_random(id(5));
        assert_eq!(load_set_aad(&mut t, &[0x33; AAD_MIN + 1]), AAD_MIN + 1);
        assert_eq!((t.word(3) >> 16) & 0xFF, AAD_MIN as u32 + 1);
    }

    #[test]
    fn short_aad_is_zero_padded() {
        let mut t = load_random(id(5));
        t.w[13] = 0xDEAD_BEEF;
        assert_eq!(load_set_aad(&mut t, b"abc"), AAD_MIN);
        assert_eq!(t.word(3), (1 << 25) | (16 << 16));
        assert_eq!(t.word(10), 0x0063_6261);
        assert_eq!(t.word(11), 0);
        assert_eq!(t.word(13), 0);
        assert_eq!(t.word(14), 0);

        let mut t = load_random(id(5));
        assert_eq!(load_set_aad(&mut t, &[]), AAD_MIN);
        assert_eq!(t.word(3), (1 << 25) | (16 << 16));
    }

    #[test]
    fn app_id_goes_in_front() {
        let mut t = load_derive(id(5), id(9), false, false);
        load_set_aad(&mut t, b"label");
        assert!(needs_app_id(&t));
        insert_app_id(&mut t, b"ID");
        assert_eq!((t.word(3) >> 16) & 0xFF, AAD_MIN as u32 + 2);
        let mut aad = [0u8; AAD_MIN + 2];
        t.read_bytes(AAD_WORD, &mut aad);
        assert_eq!(&aad[..7], b"IDlabel");
        assert!(aad[7..].iter().all(|&b| b == 0));

        // Not a derivation, nothing changes
        let mut t = load_random(id(5));
        load_set_aad(&mut t, b"label");
        let before = t.clone();
        insert_app_id(&mut t, b"ID");
        assert_eq!(t, before);
    }

    #[test]
    fn app_id_truncates_existing_aad() {
        let mut t = load_derive(id(5), id(9), false, false);
        load_set_aad(&mut t, &[0x11u8; AAD_MAX]);
        insert_app_id(&mut t, &[0x22u8; 8]);
        assert_eq!((t.word(3) >> 16) & 0xFF, AAD_MAX as u32);
        assert_eq!(t.word(AAD_WORD), 0x2222_2222);
        assert_eq!(t.word(AAD_WORD + 1), 0x2222_2222);
        assert_eq!(t.word(AAD_WORD + 2), 0x1111_1111);
    }

    #[test]
    fn delete_layout() {
        let t = delete(id(0x5001));
        assert_eq!(t.word(0), 0x3700_0000);
        assert_eq!(t.word(2), 0x5001);
    }

    proptest! {
        #[test]
        fn create_then_search_round_trip(
            policy: u64,
            length in 1u32..=0x3FF,
            raw in 1u32..,
            high in 0u32..0x40,
        ) {
            let t = create(policy, length);
            prop_assert_eq!(u64::from(t.word(2)) | u64::from(t.word(3)) << 32, policy);
            prop_assert_eq!(t.word(4) & LENGTH_MASK, length);

            // The engine answers a create with the id, and a later search
            // for the same asset with the id and the length it was created
            // with, possibly with flags above the length field.
            let mut w = [0u32; RESULT_WORDS];
            w[1] = raw;
            let created = parse_create(&ResultToken::from_words(w));
            prop_assert_eq!(created.map(AssetId::get), Some(raw));

            w[2] = (t.word(4) & LENGTH_MASK) | high << 10;
            prop_assert_eq!(parse_search(&ResultToken::from_words(w)), Some((id(raw), length)));

            w[1] = 0;
            prop_assert_eq!(parse_search(&ResultToken::from_words(w)), None);
        }
    }
}
