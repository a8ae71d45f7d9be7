// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host side of the EIP-130 security module mailbox protocol.
//!
//! [`Eip130`] owns the register interface of one engine. On top of the raw
//! mailbox transport it provides the firmware download and login sequence,
//! token round trips with typed asset and system operations, and the
//! secure-boot helpers in [`secure_boot`].

use eip130_regs::{DmaError, MailboxNumber, RegisterIo, Registers};
use eip130_token::pk::KeyBlobError;
use eip130_token::TokenError;
use std::sync::Arc;
use thiserror::Error;

mod cmd;
mod config;
pub mod firmware;
mod mailbox;
mod poll;
pub mod secure_boot;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use config::Config;
pub use firmware::{FirmwareImage, FirmwareState};
pub use poll::{Clock, PollBudget, StdClock};
pub use secure_boot::Session;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported hardware, version signature {0:#06x}")]
    UnsupportedHardware(u16),

    #[error("mailbox {mailbox} does not exist, the engine has {available}")]
    InvalidMailbox {
        mailbox: MailboxNumber,
        available: u8,
    },

    #[error("host id {0} is outside 0..=7")]
    InvalidHost(u8),

    #[error("mailbox {0} did not acknowledge the link request")]
    LinkFailed(MailboxNumber),

    #[error("mailbox {0} did not acknowledge the unlink request")]
    UnlinkFailed(MailboxNumber),

    #[error("mailbox {0} is still linked after a link reset")]
    LinkResetFailed(MailboxNumber),

    #[error("mailbox {0} is not linked")]
    NotLinked(MailboxNumber),

    /// The IN mailbox is occupied, an unread result is pending, or the
    /// module is not in a state to take tokens.
    #[error("mailbox {0} cannot take a token")]
    MailboxBusy(MailboxNumber),

    #[error("no result token in mailbox {0}")]
    NoResult(MailboxNumber),

    #[error("mailbox {0} did not take ownership of the submitted token")]
    HandoverFailed(MailboxNumber),

    /// Only the master host, or a host with the same protection, may
    /// download firmware.
    #[error("this host is not allowed to load firmware")]
    NotAuthorized,

    #[error("engine reports a hardware error (module status {0:#010x})")]
    HardwareError(u32),

    #[error("unexpected firmware state (module status {0:#010x})")]
    FirmwareState(u32),

    #[error("firmware not accepted after {attempts} attempts")]
    FirmwareLoadFailed { attempts: u32 },

    #[error("gave up waiting for {what} after {attempts} polls")]
    Timeout { what: &'static str, attempts: u32 },

    #[error("a {len} byte firmware image needs at least 256 bytes in whole words")]
    InvalidImage { len: usize },

    #[error("invalid asset id")]
    InvalidAsset,

    #[error("static asset index {index} out of range, max {max}")]
    InvalidIndex { index: u32, max: u32 },

    #[error("no asset at static index {0}")]
    NotFound(u32),

    #[error("signature verification failed")]
    VerificationFailed(#[source] TokenError),

    #[error("token identity {found:#010x} is not the crypto officer {expected:#010x}")]
    IdentityMismatch { expected: u32, found: u32 },

    #[error("expected a secure connection to the engine")]
    NonSecureConnection,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Dma(#[from] DmaError),

    #[error(transparent)]
    KeyBlob(#[from] KeyBlobError),
}

/// One engine instance.
///
/// All operations take `&mut self`; the mailbox ownership bits are the only
/// synchronization with the engine, and sharing a driver between threads
/// needs a lock around it.
pub struct Eip130<D> {
    regs: Registers<D>,
    config: Config,
    clock: Arc<dyn Clock + Send + Sync>,
    token_id: u16,
}

impl<D: RegisterIo> Eip130<D> {
    pub fn new(io: D, config: Config) -> Eip130<D> {
        Eip130 {
            regs: Registers::new(io),
            config,
            clock: Arc::new(StdClock::default()),
            token_id: 0,
        }
    }

    /// Measure poll time limits with `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Eip130<D> {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registers(&mut self) -> &mut Registers<D> {
        &mut self.regs
    }

    pub fn io_mut(&mut self) -> &mut D {
        self.regs.io_mut()
    }

    pub fn into_inner(self) -> D {
        self.regs.into_inner()
    }

    fn next_token_id(&mut self) -> u16 {
        self.token_id = self.token_id.wrapping_add(1);
        self.token_id
    }
}
