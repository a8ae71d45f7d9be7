// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Token round trips, and the asset and system operations built on them.
//! The typed operations all use the configured mailbox, which must already
//! be linked.

use crate::{Eip130, Error};
use eip130_regs::{DmaAddress, DmaMap, MailboxNumber, RegisterIo};
use eip130_token::asset::{self, Lifetime};
use eip130_token::hash::{self, HashAlgorithm};
use eip130_token::system::{self, SystemInfo};
use eip130_token::{data, AssetId, CommandToken, ResultCode, ResultToken, TokenError};
use log::{debug, warn};

/// Search and public data reads report a missing object this way.
fn is_absent(e: &TokenError) -> bool {
    e.is(ResultCode::InvalidAsset) || e.is(ResultCode::AccessError)
}

impl<D: RegisterIo> Eip130<D> {
    /// Submit `token` with a fresh token id and wait for its result. The
    /// result code is not looked at.
    pub fn round_trip(
        &mut self,
        mailbox: MailboxNumber,
        mut token: CommandToken,
    ) -> Result<ResultToken, Error> {
        let id = self.next_token_id();
        token.set_token_id(id, true);
        self.submit(mailbox, &token, true)?;

        let clock = self.clock.clone();
        let budget = self.config.result_poll;
        budget.run(&*clock, "result token", || Ok(self.can_read(mailbox).then_some(())))?;
        let result = self.receive(mailbox)?;
        if result.token_id() != id {
            warn!(
                "mailbox {mailbox}: result for token {:#06x}, expected {id:#06x}",
                result.token_id()
            );
        }
        Ok(result)
    }

    /// Round trip with the configured identity. Negative result codes come
    /// back as [`Error::Token`]; warnings are logged and passed through.
    pub fn process_token(
        &mut self,
        mailbox: MailboxNumber,
        mut token: CommandToken,
    ) -> Result<ResultToken, Error> {
        token.set_identity(self.config.identity);
        let result = self.round_trip(mailbox, token)?;
        let code = result.check()?;
        if code > 0 {
            debug!("token warning {code}");
        }
        Ok(result)
    }

    fn process(&mut self, token: CommandToken) -> Result<ResultToken, Error> {
        let mailbox = self.config.mailbox;
        self.process_token(mailbox, token)
    }

    /// Asset id and length of the static asset at `index`, `None` when
    /// there is none.
    pub fn asset_search(&mut self, index: u32) -> Result<Option<(AssetId, u32)>, Error> {
        let version = self.config.policy_version;
        let max = version.max_search_index();
        if index > max {
            return Err(Error::InvalidIndex { index, max });
        }
        match self.process(asset::search(index, version)) {
            Ok(r) => Ok(asset::parse_search(&r)),
            Err(Error::Token(e)) if is_absent(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn asset_create(&mut self, policy: u64, length: u32) -> Result<AssetId, Error> {
        self.asset_create_token(asset::create(policy, length))
    }

    pub fn asset_create_with_lifetime(
        &mut self,
        policy: u64,
        length: u32,
        lifetime: Lifetime,
    ) -> Result<AssetId, Error> {
        let mut t = asset::create(policy, length);
        asset::create_set_lifetime(&mut t, lifetime);
        self.asset_create_token(t)
    }

    fn asset_create_token(&mut self, token: CommandToken) -> Result<AssetId, Error> {
        let r = self.process(token)?;
        let id = asset::parse_create(&r).ok_or(Error::InvalidAsset)?;
        debug!("created asset {id}");
        Ok(id)
    }

    pub fn asset_load_random(&mut self, id: AssetId) -> Result<(), Error> {
        self.process(asset::load_random(id))?;
        Ok(())
    }

    /// Derive `id` from `kdk`. `label` goes into the AAD, behind the
    /// application id when the firmware wants one.
    pub fn asset_load_derive(
        &mut self,
        id: AssetId,
        kdk: AssetId,
        label: &[u8],
        counter: bool,
        rfc5869: bool,
    ) -> Result<(), Error> {
        let mut t = asset::load_derive(id, kdk, counter, rfc5869);
        asset::load_set_aad(&mut t, label);
        self.process(t)?;
        Ok(())
    }

    /// Delete an asset. Id 0 is refused without bothering the engine.
    pub fn asset_delete(&mut self, id: u32) -> Result<(), Error> {
        let id = AssetId::new(id).ok_or(Error::InvalidAsset)?;
        self.process(asset::delete(id))?;
        debug!("deleted asset {id}");
        Ok(())
    }

    pub fn system_info(&mut self) -> Result<SystemInfo, Error> {
        let r = self.process(system::system_info())?;
        Ok(SystemInfo::parse(&r))
    }

    pub fn self_test(&mut self) -> Result<(), Error> {
        self.process(system::self_test())?;
        Ok(())
    }

    pub fn define_users(&mut self, users: [u32; 4]) -> Result<(), Error> {
        self.process(system::define_users(users))?;
        Ok(())
    }

    pub fn set_time(&mut self, seconds: u32) -> Result<(), Error> {
        self.process(system::set_time(seconds))?;
        Ok(())
    }

    pub fn monotonic_increment(&mut self, id: AssetId) -> Result<(), Error> {
        self.process(data::monotonic_increment(id))?;
        Ok(())
    }
}

impl<D: RegisterIo + DmaMap> Eip130<D> {
    /// Run a token that reads `len` bytes into a fresh DMA buffer and copy
    /// them into `out`. The buffer is released however the token ends.
    fn read_via_dma(
        &mut self,
        len: usize,
        out: &mut [u8],
        build: impl FnOnce(DmaAddress) -> CommandToken,
    ) -> Result<usize, Error> {
        let addr = self.io_mut().map_output(len)?;
        let result = self.process(build(addr)).and_then(|r| {
            let n = (data::parse_read_length(&r) as usize).min(out.len());
            self.io_mut().read_output(addr, &mut out[..n])?;
            Ok(n)
        });
        self.io_mut().unmap(addr);
        result
    }

    /// Run a token that takes `input` from a DMA buffer.
    fn write_via_dma(
        &mut self,
        input: &[u8],
        build: impl FnOnce(DmaAddress) -> CommandToken,
    ) -> Result<ResultToken, Error> {
        let addr = self.io_mut().map_input(input)?;
        let result = self.process(build(addr));
        self.io_mut().unmap(addr);
        result
    }

    /// Read public data object `id` into `out`. `None` when the object does
    /// not exist or may not be read by this host.
    pub fn public_data(&mut self, id: AssetId, out: &mut [u8]) -> Result<Option<usize>, Error> {
        let len = out.len();
        match self.read_via_dma(len, out, |addr| data::public_data_read(id, addr, len as u32)) {
            Ok(n) => Ok(Some(n)),
            Err(Error::Token(e)) if is_absent(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn monotonic_read(&mut self, id: AssetId, out: &mut [u8]) -> Result<usize, Error> {
        let len = out.len();
        self.read_via_dma(len, out, |addr| data::monotonic_read(id, addr, len as u32))
    }

    /// Hash `piece`, a whole number of blocks, into the SHA-256 state kept in
    /// `state`. The first piece of a message starts from the initial value.
    pub fn hash_update(&mut self, state: AssetId, piece: &[u8], first: bool) -> Result<(), Error> {
        let len = piece.len() as u32;
        self.write_via_dma(piece, |addr| {
            let mut t = hash::hash(HashAlgorithm::Sha256, first, false, addr, len);
            hash::set_state_asset(&mut t, state);
            t
        })?;
        Ok(())
    }

    /// Load `plaintext` as the value of `id`.
    pub fn asset_load_plaintext(&mut self, id: AssetId, plaintext: &[u8]) -> Result<(), Error> {
        let len = plaintext.len() as u32;
        self.write_via_dma(plaintext, |addr| {
            let mut t = asset::load_plaintext(id);
            asset::load_set_input(&mut t, addr, len);
            t
        })?;
        Ok(())
    }

    /// Import a key blob wrapped with `kek`, authenticated with `aad`.
    pub fn asset_load_import(
        &mut self,
        id: AssetId,
        kek: AssetId,
        blob: &[u8],
        aad: &[u8],
    ) -> Result<(), Error> {
        let len = blob.len() as u32;
        self.write_via_dma(blob, |addr| {
            let mut t = asset::load_import(id, kek);
            asset::load_set_input(&mut t, addr, len);
            asset::load_set_aad(&mut t, aad);
            t
        })?;
        Ok(())
    }

    /// Program `data` into OTP as static asset `asset_number`.
    pub fn otp_data_write(
        &mut self,
        asset_number: u8,
        policy: u32,
        data: &[u8],
        aad: &[u8],
    ) -> Result<(), Error> {
        let len = data.len() as u32;
        self.write_via_dma(data, |addr| {
            data::otp_data_write(asset_number, policy, addr, len, aad)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimEngine};
    use crate::Config;
    use eip130_token::policy::PolicyV2;

    fn linked() -> Eip130<SimEngine> {
        let mut eip = Eip130::new(SimEngine::new(SimConfig::running()), Config::default());
        eip.link(MailboxNumber::FIRST).unwrap();
        eip
    }

    #[test]
    fn token_ids_advance() {
        let mut eip = linked();
        let a = eip
            .round_trip(MailboxNumber::FIRST, system::system_info())
            .unwrap();
        let b = eip
            .round_trip(MailboxNumber::FIRST, system::system_info())
            .unwrap();
        assert_eq!(a.token_id() + 1, b.token_id());
    }

    #[test]
    fn errors_map_to_token_errors() {
        let mut eip = linked();
        let id = AssetId::new(0x9990).unwrap();
        match eip.asset_load_random(id) {
            Err(Error::Token(e)) => assert!(e.is(ResultCode::InvalidAsset)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hash_pieces_need_whole_blocks_and_a_state() {
        let mut eip = linked();
        let policy = eip.config().policy_version.temp_hash_state();
        let state = eip.asset_create(policy, 32).unwrap();
        eip.hash_update(state, &[7; 128], true).unwrap();
        eip.hash_update(state, &[8; 64], false).unwrap();
        assert_eq!(eip.io_mut().stats().hash_tokens, 2);

        match eip.hash_update(state, &[9; 100], false) {
            Err(Error::Token(e)) => assert!(e.is(ResultCode::InvalidLength)),
            other => panic!("unexpected {other:?}"),
        }
        let gone = AssetId::new(0x9990).unwrap();
        match eip.hash_update(gone, &[9; 64], true) {
            Err(Error::Token(e)) => assert!(e.is(ResultCode::InvalidAsset)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(eip.io_mut().live_dma_buffers(), 0);
    }

    #[test]
    fn search_index_range() {
        let mut eip = linked();
        assert!(matches!(
            eip.asset_search(127),
            Err(Error::InvalidIndex { index: 127, max: 126 })
        ));
        assert_eq!(eip.asset_search(6).unwrap(), None);
    }

    #[test]
    fn plaintext_load_and_public_data() {
        let mut eip = linked();
        let id = eip.asset_create(PolicyV2::SYM_BASE.bits(), 4).unwrap();
        eip.asset_load_plaintext(id, &[1, 2, 3, 4]).unwrap();
        match eip.asset_load_plaintext(id, &[1, 2, 3]) {
            Err(Error::Token(e)) => assert!(e.is(ResultCode::InvalidLength)),
            other => panic!("unexpected {other:?}"),
        }

        let mut buf = [0u8; 40];
        let n = eip
            .public_data(AssetId::new(0x1000).unwrap(), &mut buf)
            .unwrap();
        assert_eq!(n, Some(32));
        assert_eq!(buf[31], 31);
        assert_eq!(
            eip.public_data(AssetId::new(0x1234).unwrap(), &mut buf)
                .unwrap(),
            None
        );
        assert_eq!(eip.io_mut().live_dma_buffers(), 0);
    }

    #[test]
    fn otp_write_then_search() {
        let mut eip = linked();
        eip.otp_data_write(9, 0, b"serial-0042", b"").unwrap();
        let (id, len) = eip.asset_search(9).unwrap().unwrap();
        assert_eq!(len, 11);
        let mut buf = [0u8; 16];
        assert_eq!(eip.public_data(id, &mut buf).unwrap(), Some(11));
        assert_eq!(&buf[..11], b"serial-0042");
    }

    #[test]
    fn monotonic_counter() {
        let mut eip = linked();
        let id = AssetId::new(0x2000).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(eip.monotonic_read(id, &mut buf).unwrap(), 8);
        assert_eq!(buf[0], 0x1F);
        eip.monotonic_increment(id).unwrap();
        eip.monotonic_read(id, &mut buf).unwrap();
        assert_eq!(buf[0], 0x3F);
    }
}
