// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mailbox transport: link management and moving one token each way.
//!
//! A mailbox goes Unlinked -> Linked, then alternates between accepting a
//! command token and holding its result until the host reads it, and is
//! unlinked again when the host is done. Nothing here expires on a timer.

use crate::{Eip130, Error};
use eip130_regs::{
    LinkOwner, Lockout, MailboxNumber, MailboxRequest, MailboxStatus, ModuleStatus, Options,
    Options2, RegisterIo, Version, SIGNATURE_EIP130, SIGNATURE_EIP140,
};
use eip130_token::{CommandToken, ResultToken, RESULT_WORDS};
use log::{debug, trace};

impl<D: RegisterIo> Eip130<D> {
    /// Check that this is an engine we can talk to and that `mailbox`
    /// exists on it.
    pub fn verify_access(&mut self, mailbox: MailboxNumber) -> Result<(), Error> {
        let version = self.regs.version();
        if !version.is_supported() {
            return Err(Error::UnsupportedHardware(version.signature()));
        }
        let available = self.regs.options().nr_of_mailboxes();
        if mailbox.get() > available {
            return Err(Error::InvalidMailbox { mailbox, available });
        }
        Ok(())
    }

    /// Read the mailbox status up to `link_ack_checks` times until `done`
    /// holds.
    fn acknowledged(&mut self, done: impl Fn(MailboxStatus) -> bool) -> bool {
        let checks = self.config.link_ack_checks.max(1);
        (0..checks).any(|_| done(self.regs.mailbox_status()))
    }

    pub fn link(&mut self, mailbox: MailboxNumber) -> Result<(), Error> {
        self.regs
            .write_mailbox_control(MailboxRequest::Link.mask(mailbox));
        if self.acknowledged(|s| s.linked(mailbox)) {
            trace!("mailbox {mailbox} linked");
            Ok(())
        } else {
            Err(Error::LinkFailed(mailbox))
        }
    }

    pub fn unlink(&mut self, mailbox: MailboxNumber) -> Result<(), Error> {
        self.regs
            .write_mailbox_control(MailboxRequest::Unlink.mask(mailbox));
        if self.acknowledged(|s| !s.linked(mailbox)) {
            trace!("mailbox {mailbox} unlinked");
            Ok(())
        } else {
            Err(Error::UnlinkFailed(mailbox))
        }
    }

    /// Break a link held by any host. Only works from the master host.
    pub fn link_reset(&mut self, mailbox: MailboxNumber) -> Result<(), Error> {
        self.regs
            .write_mailbox_reset(MailboxRequest::Unlink.mask(mailbox));
        if self.acknowledged(|s| s.available(mailbox)) {
            debug!("mailbox {mailbox} link reset");
            Ok(())
        } else {
            Err(Error::LinkResetFailed(mailbox))
        }
    }

    /// The host holding the link on `mailbox`.
    pub fn link_id(&mut self, mailbox: MailboxNumber) -> Result<LinkOwner, Error> {
        if !self.regs.mailbox_status().linked(mailbox) {
            return Err(Error::NotLinked(mailbox));
        }
        Ok(self.regs.link_ids().owner(mailbox))
    }

    /// Allow or lock out `host` on `mailbox`.
    pub fn access_control(
        &mut self,
        mailbox: MailboxNumber,
        host: u8,
        allow: bool,
    ) -> Result<(), Error> {
        if host > 7 {
            return Err(Error::InvalidHost(host));
        }
        if !Lockout::covers(mailbox) {
            return Err(Error::InvalidMailbox {
                mailbox,
                available: Lockout::MAILBOXES,
            });
        }
        let mut lockout = self.regs.lockout();
        if allow {
            lockout.allow(mailbox, host);
        } else {
            lockout.deny(mailbox, host);
        }
        self.regs.write_lockout(lockout);
        Ok(())
    }

    /// IN is free and OUT holds no unread result. Says nothing about the
    /// module being ready for tokens.
    pub fn in_mailbox_free(&mut self, mailbox: MailboxNumber) -> bool {
        let status = self.regs.mailbox_status();
        !status.in_full(mailbox) && !status.out_full(mailbox)
    }

    /// The module is healthy and running firmware, and `mailbox` can take a
    /// command token.
    pub fn can_write(&mut self, mailbox: MailboxNumber) -> bool {
        let status = self.regs.module_status();
        if status.is_faulted() {
            return false;
        }
        if self.regs.options2().firmware_ram() && !status.firmware_accepted() {
            return false;
        }
        self.in_mailbox_free(mailbox)
    }

    pub fn can_read(&mut self, mailbox: MailboxNumber) -> bool {
        self.regs.mailbox_status().out_full(mailbox)
    }

    /// Copy `token` into the IN mailbox and hand it to the engine.
    pub fn submit(
        &mut self,
        mailbox: MailboxNumber,
        token: &CommandToken,
        check_first: bool,
    ) -> Result<(), Error> {
        if check_first && !self.can_write(mailbox) {
            return Err(Error::MailboxBusy(mailbox));
        }
        trace!("mailbox {mailbox} <- {token:?}");
        self.regs.write_mailbox(mailbox, token.words());
        self.regs
            .write_mailbox_control(MailboxRequest::Submit.mask(mailbox));

        if !self.regs.mailbox_status().in_full(mailbox) {
            // Hardware race workaround: a fast engine can take the token
            // before we look. Trust that only on parts known to do so.
            let signature = self.regs.version().signature();
            if signature != SIGNATURE_EIP130 && signature != SIGNATURE_EIP140 {
                return Err(Error::HandoverFailed(mailbox));
            }
            debug!("mailbox {mailbox}: token already consumed at submit (hardware race workaround)");
        }
        Ok(())
    }

    /// Copy the result token out of the OUT mailbox and give the mailbox
    /// back to the engine.
    pub fn receive(&mut self, mailbox: MailboxNumber) -> Result<ResultToken, Error> {
        if !self.can_read(mailbox) {
            return Err(Error::NoResult(mailbox));
        }
        let mut words = [0u32; RESULT_WORDS];
        self.regs.read_mailbox(mailbox, &mut words);
        self.regs
            .write_mailbox_control(MailboxRequest::ReturnOut.mask(mailbox));
        let result = ResultToken::from_words(words);
        trace!("mailbox {mailbox} -> {result:?}");
        Ok(result)
    }

    pub fn module_status(&mut self) -> ModuleStatus {
        self.regs.module_status()
    }

    pub fn version(&mut self) -> Version {
        self.regs.version()
    }

    pub fn options(&mut self) -> Options {
        self.regs.options()
    }

    pub fn options2(&mut self) -> Options2 {
        self.regs.options2()
    }
}
