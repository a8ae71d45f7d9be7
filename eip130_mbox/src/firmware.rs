// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware download and login.
//!
//! An engine with firmware RAM comes out of reset waiting for the
//! authenticated 256 byte header of a firmware image in a mailbox. Once the
//! boot ROM takes it, the rest of the image goes into the firmware RAM
//! window and the engine checks it. Only the master host (or a host with
//! matching protection) may do this.

use crate::{Eip130, Error};
use byteorder::{ByteOrder, LittleEndian};
use eip130_regs::{MailboxNumber, ModuleStatus, RegisterIo};
use eip130_token::{system, CommandToken, ResultCode, COMMAND_WORDS};
use log::{debug, trace, warn};

/// Where the firmware download stands, as far as the module status tells.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FirmwareState {
    /// Waiting for the image header token.
    NeedsHeader,
    /// Header taken, waiting for the image body.
    NeedsBody,
    /// The body is written and being checked.
    ChecksBusy,
    /// Running, either from ROM or an accepted image.
    Accepted,
}

/// A firmware image split into its header token and body.
#[derive(Clone, Debug)]
pub struct FirmwareImage {
    pub header: CommandToken,
    pub body: Vec<u32>,
}

impl FirmwareImage {
    pub const HEADER_BYTES: usize = COMMAND_WORDS * 4;

    pub fn parse(image: &[u8]) -> Result<FirmwareImage, Error> {
        if image.len() < Self::HEADER_BYTES || image.len() % 4 != 0 {
            return Err(Error::InvalidImage { len: image.len() });
        }
        let mut words = image.chunks_exact(4).map(LittleEndian::read_u32);
        let mut header = [0u32; COMMAND_WORDS];
        for (slot, w) in header.iter_mut().zip(&mut words) {
            *slot = w;
        }
        Ok(FirmwareImage {
            header: CommandToken::from_words(header),
            body: words.collect(),
        })
    }
}

impl<D: RegisterIo> Eip130<D> {
    fn may_load_firmware(&mut self) -> bool {
        let options = self.regs.options();
        if options.my_host_id() == options.master_id() {
            return true;
        }
        !self.config.allow_nonsecure_master
            && options.my_protection() == options.protection_available()
    }

    pub fn firmware_check(&mut self) -> Result<FirmwareState, Error> {
        let version = self.regs.version();
        if !version.is_supported() {
            return Err(Error::UnsupportedHardware(version.signature()));
        }
        if !self.regs.options2().firmware_ram() {
            trace!("ROM firmware only");
            return Ok(FirmwareState::Accepted);
        }

        let clock = self.clock.clone();
        let status = self
            .config
            .status_poll
            .run(&*clock, "CRC24 check", || {
                let status = self.regs.module_status();
                Ok((!status.crc24_busy()).then_some(status))
            })?;
        if status.is_faulted() {
            return Err(Error::HardwareError(status.raw()));
        }

        const W: u32 = ModuleStatus::FIRMWARE_WRITTEN;
        const CB: u32 = ModuleStatus::FIRMWARE_CHECKS_BUSY;
        const A: u32 = ModuleStatus::FIRMWARE_ACCEPTED;
        let state = match status.firmware_bits() {
            W => FirmwareState::NeedsHeader,
            CB => FirmwareState::NeedsBody,
            x if x == W | CB => FirmwareState::ChecksBusy,
            x if x == W | A => FirmwareState::Accepted,
            _ => return Err(Error::FirmwareState(status.raw())),
        };

        if matches!(state, FirmwareState::NeedsHeader | FirmwareState::NeedsBody)
            && !self.may_load_firmware()
        {
            return Err(Error::NotAuthorized);
        }
        debug!("firmware state {state:?}");
        Ok(state)
    }

    /// Download firmware unless it is already running. Returns the number of
    /// attempts used, 0 when nothing had to be done.
    ///
    /// `header` is the first 256 bytes of the image as a token, `body` the
    /// rest. Each attempt starts from the state the module reports. A
    /// rejected image, or one whose checks never finish, is retried up to
    /// `load_retries` times. Hardware errors are not retried.
    pub fn firmware_load(
        &mut self,
        mailbox: MailboxNumber,
        header: &CommandToken,
        body: &[u32],
    ) -> Result<u32, Error> {
        let mut known = match self.firmware_check() {
            Ok(FirmwareState::Accepted) => return Ok(0),
            Ok(state) => Some(state),
            Err(e @ Error::Timeout { .. }) => {
                warn!("firmware check: {e}");
                None
            }
            Err(e) => return Err(e),
        };

        let attempts = self.config.load_retries.max(1);
        for attempt in 1..=attempts {
            let state = match known.take() {
                Some(state) => Ok(state),
                None => self.firmware_check(),
            };
            match state.and_then(|state| self.firmware_attempt(mailbox, header, body, state)) {
                Ok(true) => {
                    debug!("firmware accepted on attempt {attempt}");
                    return Ok(attempt);
                }
                Ok(false) => warn!("firmware rejected on attempt {attempt}"),
                Err(e @ (Error::HardwareError(_) | Error::NotAuthorized)) => return Err(e),
                Err(e) => warn!("firmware load attempt {attempt} failed: {e}"),
            }
        }
        Err(Error::FirmwareLoadFailed { attempts })
    }

    /// One pass through the download. `Ok(false)` when the engine rejected
    /// the image.
    fn firmware_attempt(
        &mut self,
        mailbox: MailboxNumber,
        header: &CommandToken,
        body: &[u32],
        state: FirmwareState,
    ) -> Result<bool, Error> {
        match state {
            FirmwareState::Accepted => return Ok(true),
            FirmwareState::NeedsHeader => self.submit_firmware_header(mailbox, header)?,
            FirmwareState::NeedsBody | FirmwareState::ChecksBusy => {}
        }
        if state != FirmwareState::ChecksBusy {
            self.write_firmware_body(body)?;
        }
        self.await_firmware_verdict()
    }

    fn submit_firmware_header(
        &mut self,
        mailbox: MailboxNumber,
        header: &CommandToken,
    ) -> Result<(), Error> {
        self.link(mailbox)?;
        let submitted = if self.in_mailbox_free(mailbox) {
            self.submit(mailbox, header, false)
        } else {
            Err(Error::MailboxBusy(mailbox))
        };
        if let Err(e) = self.unlink(mailbox) {
            warn!("after firmware header: {e}");
        }
        submitted
    }

    fn write_firmware_body(&mut self, body: &[u32]) -> Result<(), Error> {
        let clock = self.clock.clone();
        self.config
            .status_poll
            .run(&*clock, "firmware header acceptance", || {
                let status = self.regs.module_status();
                if status.is_faulted() {
                    return Err(Error::HardwareError(status.raw()));
                }
                Ok((!status.firmware_written()).then_some(()))
            })?;
        trace!("writing {} firmware words", body.len());
        self.regs.write_firmware_ram(body);
        self.regs.mark_firmware_written();
        Ok(())
    }

    fn await_firmware_verdict(&mut self) -> Result<bool, Error> {
        let clock = self.clock.clone();
        self.config
            .status_poll
            .run(&*clock, "firmware checks", || {
                let status = self.regs.module_status();
                if status.is_faulted() {
                    return Err(Error::HardwareError(status.raw()));
                }
                if status.firmware_accepted() {
                    return Ok(Some(true));
                }
                Ok((!status.firmware_checks_busy()).then_some(false))
            })
    }

    /// Log `identity` in to the firmware on `mailbox`. Firmware without
    /// login support answers "invalid token", which counts as success.
    pub fn firmware_login(
        &mut self,
        mailbox: MailboxNumber,
        identity: u32,
        unlink_after: bool,
    ) -> Result<(), Error> {
        self.link(mailbox)?;
        let mut token = system::login();
        token.set_identity(identity);
        let result = self.round_trip(mailbox, token).and_then(|r| match r.check() {
            Ok(_) => Ok(()),
            Err(e) if e.is(ResultCode::InvalidToken) => {
                debug!("firmware has no login, continuing");
                Ok(())
            }
            Err(e) => Err(e.into()),
        });
        if unlink_after {
            if let Err(e) = self.unlink(mailbox) {
                warn!("after login: {e}");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimEngine};
    use crate::{Config, PollBudget};

    fn driver(sim: SimConfig) -> Eip130<SimEngine> {
        let config = Config {
            status_poll: PollBudget::attempts(100),
            result_poll: PollBudget::attempts(100),
            ..Config::default()
        };
        Eip130::new(SimEngine::new(sim), config)
    }

    #[test]
    fn image_split() {
        let mut image = vec![0u8; 264];
        image[0] = 0x01;
        image[256..260].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        let fw = FirmwareImage::parse(&image).unwrap();
        assert_eq!(fw.header.word(0), 1);
        assert_eq!(fw.body, vec![0x1234_5678, 0]);

        let fw = FirmwareImage::parse(&[0u8; 256]).unwrap();
        assert!(fw.body.is_empty());

        assert!(matches!(
            FirmwareImage::parse(&[0u8; 255]),
            Err(Error::InvalidImage { len: 255 })
        ));
        assert!(matches!(
            FirmwareImage::parse(&[0u8; 258]),
            Err(Error::InvalidImage { len: 258 })
        ));
    }

    #[test]
    fn check_states() {
        assert_eq!(
            driver(SimConfig::running()).firmware_check().unwrap(),
            FirmwareState::Accepted
        );
        assert_eq!(
            driver(SimConfig::fresh()).firmware_check().unwrap(),
            FirmwareState::NeedsHeader
        );
        let rom = SimConfig {
            firmware_ram: false,
            firmware_loaded: false,
            ..SimConfig::fresh()
        };
        assert_eq!(driver(rom).firmware_check().unwrap(), FirmwareState::Accepted);
    }

    #[test]
    fn check_faults() {
        let crc = SimConfig {
            crc_error: true,
            ..SimConfig::fresh()
        };
        assert!(matches!(
            driver(crc).firmware_check(),
            Err(Error::HardwareError(_))
        ));

        let stuck = SimConfig {
            crc_busy_polls: 1000,
            ..SimConfig::fresh()
        };
        assert!(matches!(
            driver(stuck).firmware_check(),
            Err(Error::Timeout { attempts: 100, .. })
        ));
    }

    #[test]
    fn only_master_or_protected_host_loads() {
        let other = SimConfig {
            host_id: 2,
            master_id: 0,
            my_protection: false,
            protection_available: true,
            ..SimConfig::fresh()
        };
        assert!(matches!(
            driver(other.clone()).firmware_check(),
            Err(Error::NotAuthorized)
        ));

        let protected = SimConfig {
            my_protection: true,
            ..other
        };
        assert_eq!(
            driver(protected.clone()).firmware_check().unwrap(),
            FirmwareState::NeedsHeader
        );

        let mut eip = driver(protected);
        eip.config.allow_nonsecure_master = true;
        assert!(matches!(eip.firmware_check(), Err(Error::NotAuthorized)));
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let mut eip = driver(SimConfig {
            fatal_on_body: true,
            ..SimConfig::fresh()
        });
        let r = eip.firmware_load(MailboxNumber::FIRST, &CommandToken::default(), &[0; 4]);
        assert!(matches!(r, Err(Error::HardwareError(_))));
        assert_eq!(eip.io_mut().stats().header_submissions, 1);
    }

    #[test]
    fn login_with_and_without_support() {
        let mut eip = driver(SimConfig::running());
        eip.firmware_login(MailboxNumber::FIRST, 0x1234, true).unwrap();
        assert!(eip.link_id(MailboxNumber::FIRST).is_err());

        let mut eip = driver(SimConfig {
            login_supported: false,
            ..SimConfig::running()
        });
        eip.firmware_login(MailboxNumber::FIRST, 0x1234, false).unwrap();
        assert!(eip.link_id(MailboxNumber::FIRST).is_ok());
    }
}
