// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What a boot loader needs from the engine: public data, FIPS mode entry,
//! RSA signature checks and rollback counters.
//!
//! Each of these runs inside a [`Session`], which links the configured
//! mailbox when opened and unlinks it when dropped.

use crate::{Eip130, Error};
use eip130_regs::{DmaMap, MailboxNumber, RegisterIo};
use eip130_token::hash::{self, HashAlgorithm};
use eip130_token::pk::{self, PkAssetOp, RsaPadding, MAX_HASH_SIZE};
use eip130_token::AssetId;
use log::{debug, info, warn};
use std::ops::{Deref, DerefMut};

/// Largest piece of a long message hashed by one token.
const HASH_PIECE_MAX: usize = 16 * 1024;

/// A linked mailbox. Dereferences to the driver.
pub struct Session<'a, D: RegisterIo> {
    eip: &'a mut Eip130<D>,
    mailbox: MailboxNumber,
}

impl<D: RegisterIo> Eip130<D> {
    /// Link the configured mailbox and check the engine answers on it.
    pub fn open(&mut self) -> Result<Session<'_, D>, Error> {
        let mailbox = self.config.mailbox;
        self.link(mailbox)?;
        let mut session = Session { eip: self, mailbox };
        session.eip.verify_access(mailbox)?;
        Ok(session)
    }
}

impl<D: RegisterIo> Drop for Session<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.eip.unlink(self.mailbox) {
            warn!("closing session: {e}");
        }
    }
}

impl<D: RegisterIo> Deref for Session<'_, D> {
    type Target = Eip130<D>;

    fn deref(&self) -> &Eip130<D> {
        self.eip
    }
}

impl<D: RegisterIo> DerefMut for Session<'_, D> {
    fn deref_mut(&mut self) -> &mut Eip130<D> {
        self.eip
    }
}

/// An RSA public key as big-endian byte strings.
#[derive(Copy, Clone, Debug)]
pub struct RsaKey<'a> {
    pub modulus: &'a [u8],
    pub exponent: &'a [u8],
}

impl<D: RegisterIo> Session<'_, D> {
    pub fn mailbox(&self) -> MailboxNumber {
        self.mailbox
    }

    fn check_identity(&mut self) -> Result<(), Error> {
        let info = self.system_info()?;
        if info.non_secure {
            return Err(Error::NonSecureConnection);
        }
        let expected = self.config.coid;
        let found = self.config.identity;
        if found != expected {
            return Err(Error::IdentityMismatch { expected, found });
        }
        Ok(())
    }

    /// Put the engine in FIPS mode, defining `users` on the way, or check
    /// that it already is. Only the crypto officer may do this.
    pub fn set_fips_mode(&mut self, users: [u32; 4]) -> Result<(), Error> {
        let clock = self.clock.clone();
        let budget = self.config.status_poll;
        let fips = budget.run(&*clock, "firmware start", || {
            let status = self.module_status();
            if status.fatal_error() || status.crc24_error() {
                return Err(Error::HardwareError(status.raw()));
            }
            match (status.fips_bit(), status.non_fips()) {
                (false, true) => Ok(Some(false)),
                (true, false) => Ok(Some(true)),
                // Firmware still starting
                (false, false) if status.crc24_ok() || status.crc24_busy() => Ok(None),
                _ => Err(Error::FirmwareState(status.raw())),
            }
        })?;

        self.check_identity()?;
        if fips {
            debug!("already in FIPS mode");
            return Ok(());
        }

        self.define_users(users)?;
        self.self_test()?;
        let status = self.module_status();
        if status.fatal_error() || !status.fips_mode() {
            return Err(Error::FirmwareState(status.raw()));
        }
        info!("FIPS mode set");
        Ok(())
    }
}

impl<D: RegisterIo + DmaMap> Session<'_, D> {
    /// Number of set bits in the monotonic counter at static `index`, 0 when
    /// there is no counter there.
    pub fn rollback_counter(&mut self, index: u32) -> Result<u32, Error> {
        let Some((id, len)) = self.asset_search(index)? else {
            debug!("no rollback counter at {index}");
            return Ok(0);
        };
        let mut value = vec![0u8; len as usize];
        let n = self.monotonic_read(id, &mut value)?;
        Ok(value[..n].iter().map(|b| b.count_ones()).sum())
    }

    /// Read the public data object at static `index`. Without a buffer only
    /// its length is returned.
    pub fn public_data_read(&mut self, index: u32, out: Option<&mut [u8]>) -> Result<usize, Error> {
        let (id, len) = self.asset_search(index)?.ok_or(Error::NotFound(index))?;
        let Some(out) = out else {
            return Ok(len as usize);
        };
        self.public_data(id, out)?.ok_or(Error::NotFound(index))
    }

    /// Check `signature` over `message` with `key`, hashing with SHA-256
    /// inside the engine. The key lives in a temporary asset for the
    /// duration of the call. A message longer than one verify token takes
    /// is hashed in pieces first, through a temporary state asset.
    pub fn rsa_verify(
        &mut self,
        key: RsaKey<'_>,
        signature: &[u8],
        message: &[u8],
        padding: RsaPadding,
    ) -> Result<(), Error> {
        let modulus_len = key
            .modulus
            .iter()
            .position(|b| *b != 0)
            .map_or(0, |first| key.modulus.len() - first);
        let key_blob = pk::rsa_public_key_blob(key.modulus, key.exponent)?;
        let sig_blob = pk::rsa_signature_blob(signature, modulus_len)?;
        let (pieces, tail) = hash::split_message(message.len(), HASH_PIECE_MAX, MAX_HASH_SIZE);

        let policy = self
            .config
            .policy_version
            .rsa_verify_key(padding, self.config.non_secure);
        let key_id = self.asset_create(policy, key_blob.len() as u32)?;

        let mut state = None;
        let verified = self
            .asset_load_plaintext(key_id, &key_blob)
            .and_then(|()| self.hash_leading(message, &pieces, &mut state))
            .and_then(|()| {
                let last = Tail {
                    state,
                    data: &message[message.len() - tail..],
                    total: message.len() as u64,
                };
                self.verify_with(key_id, modulus_len, &sig_blob, last, padding)
            });

        for id in std::iter::once(key_id).chain(state) {
            if let Err(e) = self.asset_delete(id.get()) {
                warn!("deleting asset {id}: {e}");
            }
        }
        verified
    }

    /// Hash everything in front of the tail of `message` into a fresh state
    /// asset, recorded in `state` as soon as it exists.
    fn hash_leading(
        &mut self,
        message: &[u8],
        pieces: &[usize],
        state: &mut Option<AssetId>,
    ) -> Result<(), Error> {
        if pieces.is_empty() {
            return Ok(());
        }
        let policy = self.config.policy_version.temp_hash_state();
        let id = self.asset_create(policy, HashAlgorithm::Sha256.digest_len() as u32)?;
        *state = Some(id);

        let mut offset = 0;
        for (i, len) in pieces.iter().enumerate() {
            self.hash_update(id, &message[offset..offset + len], i == 0)?;
            offset += len;
        }
        debug!("hashed {offset} bytes in {} pieces into {id}", pieces.len());
        Ok(())
    }

    fn verify_with(
        &mut self,
        key: AssetId,
        modulus_len: usize,
        sig_blob: &[u8],
        tail: Tail<'_>,
        padding: RsaPadding,
    ) -> Result<(), Error> {
        let words = pk::words_for(modulus_len);
        let msg = self.io_mut().map_input(tail.data)?;
        let sig = match self.io_mut().map_input(sig_blob) {
            Ok(sig) => sig,
            Err(e) => {
                self.io_mut().unmap(msg);
                return Err(e.into());
            }
        };

        let op = PkAssetOp {
            n_words: words,
            m_words: words,
            other_len: 32,
            key: Some(key),
            io: tail.state,
            input: msg,
            input_len: tail.data.len() as u32,
            output: sig,
            output_len: sig_blob.len() as u32,
            ..Default::default()
        };
        let mut t = pk::with_assets(padding.verify_command(), &op);
        pk::set_additional_length(&mut t, tail.total);
        let mailbox = self.mailbox;
        let result = self.process_token(mailbox, t);

        self.io_mut().unmap(sig);
        self.io_mut().unmap(msg);
        match result {
            Ok(_) => Ok(()),
            Err(Error::Token(e)) => Err(Error::VerificationFailed(e)),
            Err(e) => Err(e),
        }
    }
}

/// Last part of a message handed to the verify token.
struct Tail<'a> {
    /// Holds the hash of everything before `data`.
    state: Option<AssetId>,
    data: &'a [u8],
    total: u64,
}

/// Asset length used by [`Session::rsa_verify`] for a key, for callers
/// that size things up front.
pub fn rsa_key_asset_len(key: RsaKey<'_>) -> Result<usize, Error> {
    Ok(pk::rsa_public_key_blob(key.modulus, key.exponent)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimEngine};
    use crate::Config;

    fn driver(sim: SimConfig) -> Eip130<SimEngine> {
        Eip130::new(SimEngine::new(sim), Config::default())
    }

    #[test]
    fn session_unlinks_on_drop() {
        let mut eip = driver(SimConfig::running());
        {
            let mut s = eip.open().unwrap();
            assert!(s.link_id(MailboxNumber::FIRST).is_ok());
        }
        assert!(eip.link_id(MailboxNumber::FIRST).is_err());
    }

    #[test]
    fn open_checks_mailbox_count() {
        let mut eip = Eip130::new(
            SimEngine::new(SimConfig {
                mailboxes: 1,
                ..SimConfig::running()
            }),
            Config {
                mailbox: MailboxNumber::new(2).unwrap(),
                ..Config::default()
            },
        );
        assert!(eip.open().is_err());
    }

    #[test]
    fn public_data_by_index() {
        let mut eip = driver(SimConfig::running());
        let mut s = eip.open().unwrap();
        assert_eq!(s.public_data_read(5, None).unwrap(), 32);
        let mut buf = [0u8; 32];
        assert_eq!(s.public_data_read(5, Some(&mut buf)).unwrap(), 32);
        assert_eq!(buf[7], 7);
        assert!(matches!(s.public_data_read(6, None), Err(Error::NotFound(6))));
        assert!(matches!(
            s.public_data_read(200, None),
            Err(Error::InvalidIndex { .. })
        ));
    }

    #[test]
    fn rollback_counts_bits() {
        let mut eip = driver(SimConfig::running());
        let mut s = eip.open().unwrap();
        assert_eq!(s.rollback_counter(20).unwrap(), 5);
        assert_eq!(s.rollback_counter(21).unwrap(), 0);
    }

    #[test]
    fn fips_mode_with_crypto_officer() {
        let mut eip = Eip130::new(
            SimEngine::new(SimConfig::running()),
            Config {
                identity: 0x4F5A_3647,
                ..Config::default()
            },
        );
        eip.open().unwrap().set_fips_mode([1, 2, 3, 4]).unwrap();
        assert!(eip.io_mut().fips());
        assert_eq!(eip.io_mut().users(), Some([1, 2, 3, 4]));
        // Second time round only the identity is checked
        eip.open().unwrap().set_fips_mode([5, 6, 7, 8]).unwrap();
        assert_eq!(eip.io_mut().users(), Some([1, 2, 3, 4]));
    }

    #[test]
    fn fips_mode_refused() {
        let mut eip = driver(SimConfig::running());
        assert!(matches!(
            eip.open().unwrap().set_fips_mode([1, 2, 3, 4]),
            Err(Error::IdentityMismatch { .. })
        ));
        assert!(!eip.io_mut().fips());

        let mut eip = Eip130::new(
            SimEngine::new(SimConfig {
                non_secure: true,
                ..SimConfig::running()
            }),
            Config {
                identity: 0x4F5A_3647,
                ..Config::default()
            },
        );
        assert!(matches!(
            eip.open().unwrap().set_fips_mode([1, 2, 3, 4]),
            Err(Error::NonSecureConnection)
        ));
    }

    fn key() -> (Vec<u8>, Vec<u8>) {
        let mut modulus = vec![0xC5u8; 256];
        modulus[255] = 0x01;
        (modulus, vec![0x01, 0x00, 0x01])
    }

    #[test]
    fn rsa_verify_plumbing() {
        let (modulus, exponent) = key();
        let rsa = RsaKey {
            modulus: &modulus,
            exponent: &exponent,
        };
        let mut eip = driver(SimConfig::running());
        let mut s = eip.open().unwrap();
        s.rsa_verify(rsa, &[0x42; 256], b"boot image", RsaPadding::Pkcs1v15)
            .unwrap();
        drop(s);

        let sim = eip.io_mut();
        assert_eq!(sim.dynamic_assets(), 0);
        assert_eq!(sim.live_dma_buffers(), 0);
        let v = &sim.verifies()[0];
        assert_eq!(v.command, pk::PkAssetCommand::RsaPkcsVerify as u8);
        assert_eq!(v.message, b"boot image");
        assert_eq!(v.total_length, 10);
        assert_eq!(v.key.len(), rsa_key_asset_len(rsa).unwrap());
        assert_eq!(v.signature.len(), 4 + 256);
    }

    #[test]
    fn rsa_verify_failure_still_deletes_key() {
        let (modulus, exponent) = key();
        let rsa = RsaKey {
            modulus: &modulus,
            exponent: &exponent,
        };
        let mut eip = driver(SimConfig {
            signatures_valid: false,
            ..SimConfig::running()
        });
        let r = eip
            .open()
            .unwrap()
            .rsa_verify(rsa, &[0x42; 256], b"boot image", RsaPadding::Pss);
        assert!(matches!(r, Err(Error::VerificationFailed(_))));
        assert_eq!(eip.io_mut().dynamic_assets(), 0);
        assert_eq!(eip.io_mut().live_dma_buffers(), 0);
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    #[test]
    fn rsa_verify_hashes_long_messages_in_pieces() {
        let (modulus, exponent) = key();
        let rsa = RsaKey {
            modulus: &modulus,
            exponent: &exponent,
        };
        let mut eip = driver(SimConfig::running());
        let message = image(40_000);
        eip.open()
            .unwrap()
            .rsa_verify(rsa, &[0x42; 256], &message, RsaPadding::Pkcs1v15)
            .unwrap();

        let sim = eip.io_mut();
        assert_eq!(sim.stats().hash_tokens, 3);
        assert_eq!(sim.dynamic_assets(), 0);
        assert_eq!(sim.live_dma_buffers(), 0);
        let v = &sim.verifies()[0];
        assert!(v.hash_state.is_some());
        assert_eq!(v.total_length, 40_000);
        assert_eq!(v.message, message);
    }

    #[test]
    fn rsa_verify_just_over_one_token() {
        let (modulus, exponent) = key();
        let rsa = RsaKey {
            modulus: &modulus,
            exponent: &exponent,
        };
        let mut eip = driver(SimConfig::running());
        let mut s = eip.open().unwrap();
        s.rsa_verify(rsa, &[1; 256], &image(MAX_HASH_SIZE), RsaPadding::Pss)
            .unwrap();
        s.rsa_verify(rsa, &[1; 256], &image(MAX_HASH_SIZE + 1), RsaPadding::Pss)
            .unwrap();
        drop(s);

        let sim = eip.io_mut();
        assert_eq!(sim.stats().hash_tokens, 1);
        assert_eq!(sim.verifies()[0].hash_state, None);
        assert_eq!(sim.verifies()[1].message.len(), MAX_HASH_SIZE + 1);
        assert_eq!(sim.dynamic_assets(), 0);
    }

    #[test]
    fn failed_long_verify_deletes_both_assets() {
        let (modulus, exponent) = key();
        let rsa = RsaKey {
            modulus: &modulus,
            exponent: &exponent,
        };
        let mut eip = driver(SimConfig {
            signatures_valid: false,
            ..SimConfig::running()
        });
        let r = eip
            .open()
            .unwrap()
            .rsa_verify(rsa, &[0x42; 256], &image(10_000), RsaPadding::Pss);
        assert!(matches!(r, Err(Error::VerificationFailed(_))));
        assert_eq!(eip.io_mut().stats().hash_tokens, 1);
        assert_eq!(eip.io_mut().dynamic_assets(), 0);
        assert_eq!(eip.io_mut().live_dma_buffers(), 0);
    }

    #[test]
    fn hashing_error_still_cleans_up() {
        let (modulus, exponent) = key();
        let rsa = RsaKey {
            modulus: &modulus,
            exponent: &exponent,
        };
        // Too little DMA space for a whole piece
        let mut eip = driver(SimConfig {
            dma_size: 8 * 1024,
            ..SimConfig::running()
        });
        let r = eip
            .open()
            .unwrap()
            .rsa_verify(rsa, &[0x42; 256], &image(40_000), RsaPadding::Pkcs1v15);
        assert!(matches!(r, Err(Error::Dma(_))));
        assert!(eip.io_mut().verifies().is_empty());
        assert_eq!(eip.io_mut().dynamic_assets(), 0);
        assert_eq!(eip.io_mut().live_dma_buffers(), 0);
    }
}
