// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register map of the EIP-130 family of security modules (EIP-130, EIP-133
//! and EIP-140) along with the two capabilities the driver needs from the
//! platform: 32-bit register access and DMA address translation.
//!
//! Everything in here is a plain load or store. Sequencing is the caller's
//! problem.

use bitfield::bitfield;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const MAILBOX_IN_BASE: u32 = 0x0000;
// The OUT window aliases the IN window of the same mailbox
pub const MAILBOX_OUT_BASE: u32 = 0x0000;
pub const MAILBOX_SPACING_BYTES: u32 = 0x400;

pub const MAILBOX_STAT: u32 = 0x3F00;
pub const MAILBOX_CTRL: u32 = 0x3F00;
pub const MAILBOX_RAWSTAT: u32 = 0x3F04;
pub const MAILBOX_RESET: u32 = 0x3F04;
pub const MAILBOX_LINKID: u32 = 0x3F08;
pub const MAILBOX_OUTID: u32 = 0x3F0C;
pub const MAILBOX_LOCKOUT: u32 = 0x3F10;

pub const MODULE_STATUS: u32 = 0x3FE0;
pub const EIP_OPTIONS2: u32 = 0x3FF4;
pub const EIP_OPTIONS: u32 = 0x3FF8;
pub const EIP_VERSION: u32 = 0x3FFC;

pub const FIRMWARE_RAM_BASE: u32 = 0x4000;

/// Low 16 bits of the version register: EIP number and its complement.
pub const SIGNATURE_EIP130: u16 = 0x7D82;
pub const SIGNATURE_EIP133: u16 = 0x7A85;
pub const SIGNATURE_EIP140: u16 = 0x738C;

/// Raw 32-bit access to one engine instance.
///
/// Reads take `&mut self` because status reads on real hardware (and in the
/// simulator) are allowed to have side effects.
pub trait RegisterIo {
    fn read32(&mut self, offset: u32) -> u32;

    fn write32(&mut self, offset: u32, value: u32);

    fn read32_array(&mut self, offset: u32, words: &mut [u32]) {
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.read32(offset + 4 * i as u32);
        }
    }

    fn write32_array(&mut self, offset: u32, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.write32(offset + 4 * i as u32, *w);
        }
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for &mut T {
    fn read32(&mut self, offset: u32) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&mut self, offset: u32, value: u32) {
        (**self).write32(offset, value)
    }

    fn read32_array(&mut self, offset: u32, words: &mut [u32]) {
        (**self).read32_array(offset, words)
    }

    fn write32_array(&mut self, offset: u32, words: &[u32]) {
        (**self).write32_array(offset, words)
    }
}

/// A device-visible bus address. Tokens always carry it as two words so the
/// layout does not depend on the host word size.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DmaAddress(pub u64);

impl DmaAddress {
    pub fn low(self) -> u32 {
        self.0 as u32
    }

    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn from_words(low: u32, high: u32) -> DmaAddress {
        DmaAddress(u64::from(high) << 32 | u64::from(low))
    }
}

impl fmt::Display for DmaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Translation of host buffers into addresses the engine can reach.
///
/// Buffers are bounce buffers owned by the implementation: `map_input`
/// copies the data in, `map_output` reserves space the engine writes to and
/// `read_output` copies it back once the result token has been read. A
/// mapping stays valid until `unmap`.
pub trait DmaMap {
    fn map_input(&mut self, data: &[u8]) -> Result<DmaAddress, DmaError>;

    fn map_output(&mut self, len: usize) -> Result<DmaAddress, DmaError>;

    fn read_output(&mut self, addr: DmaAddress, out: &mut [u8]) -> Result<(), DmaError>;

    fn unmap(&mut self, addr: DmaAddress);
}

impl<T: DmaMap + ?Sized> DmaMap for &mut T {
    fn map_input(&mut self, data: &[u8]) -> Result<DmaAddress, DmaError> {
        (**self).map_input(data)
    }

    fn map_output(&mut self, len: usize) -> Result<DmaAddress, DmaError> {
        (**self).map_output(len)
    }

    fn read_output(&mut self, addr: DmaAddress, out: &mut [u8]) -> Result<(), DmaError> {
        (**self).read_output(addr, out)
    }

    fn unmap(&mut self, addr: DmaAddress) {
        (**self).unmap(addr)
    }
}

#[derive(Debug, Error)]
pub enum DmaError {
    /// No room left for another mapping of this size.
    #[error("no DMA memory left for a {0} byte buffer")]
    Exhausted(usize),

    #[error("DMA address {0} is not mapped")]
    NotMapped(DmaAddress),

    /// Asked to copy back more than was mapped.
    #[error("DMA mapping holds {mapped} bytes, {requested} requested")]
    Length { mapped: usize, requested: usize },
}

/// Mailbox number, 1-based. The options register says how many a given
/// instance actually has; 8 is the architectural maximum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct MailboxNumber(u8);

#[derive(Debug, Error)]
#[error("mailbox number {0} is outside 1..=8")]
pub struct MailboxOutOfRange(pub u8);

impl MailboxNumber {
    pub const MAX: u8 = 8;
    pub const FIRST: MailboxNumber = MailboxNumber(1);

    pub const fn new(nr: u8) -> Option<MailboxNumber> {
        if nr >= 1 && nr <= Self::MAX {
            Some(MailboxNumber(nr))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Shift of this mailbox's nibble in the status, control, reset and
    /// link-id registers.
    pub const fn shift(self) -> u32 {
        (self.0 as u32 - 1) * 4
    }

    /// Byte offset of the IN (and OUT) window.
    pub const fn window(self) -> u32 {
        MAILBOX_IN_BASE + MAILBOX_SPACING_BYTES * (self.0 as u32 - 1)
    }
}

impl TryFrom<u8> for MailboxNumber {
    type Error = MailboxOutOfRange;

    fn try_from(nr: u8) -> Result<Self, Self::Error> {
        MailboxNumber::new(nr).ok_or(MailboxOutOfRange(nr))
    }
}

impl From<MailboxNumber> for u8 {
    fn from(nr: MailboxNumber) -> u8 {
        nr.0
    }
}

impl fmt::Display for MailboxNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bits in a mailbox's status nibble.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MailboxFlag {
    InFull = 1 << 0,
    OutFull = 1 << 1,
    Linked = 1 << 2,
    Available = 1 << 3,
}

/// Bits in a mailbox's control nibble. `Unlink` doubles as the link-reset
/// request when written to the reset register.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MailboxRequest {
    Submit = 1 << 0,
    ReturnOut = 1 << 1,
    Link = 1 << 2,
    Unlink = 1 << 3,
}

impl MailboxRequest {
    pub fn mask(self, mailbox: MailboxNumber) -> u32 {
        (self as u32) << mailbox.shift()
    }
}

/// Snapshot of MAILBOX_STAT (or MAILBOX_RAWSTAT).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MailboxStatus(pub u32);

impl MailboxStatus {
    pub fn is_set(self, mailbox: MailboxNumber, flag: MailboxFlag) -> bool {
        self.0 & ((flag as u32) << mailbox.shift()) != 0
    }

    pub fn in_full(self, mailbox: MailboxNumber) -> bool {
        self.is_set(mailbox, MailboxFlag::InFull)
    }

    pub fn out_full(self, mailbox: MailboxNumber) -> bool {
        self.is_set(mailbox, MailboxFlag::OutFull)
    }

    pub fn linked(self, mailbox: MailboxNumber) -> bool {
        self.is_set(mailbox, MailboxFlag::Linked)
    }

    pub fn available(self, mailbox: MailboxNumber) -> bool {
        self.is_set(mailbox, MailboxFlag::Available)
    }
}

/// Host currently owning a mailbox link, as reported by MAILBOX_LINKID and
/// MAILBOX_OUTID.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkOwner {
    pub host_id: u8,
    pub secure: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkIds(pub u32);

impl LinkIds {
    pub fn owner(self, mailbox: MailboxNumber) -> LinkOwner {
        let nibble = (self.0 >> mailbox.shift()) & 0xF;
        LinkOwner {
            host_id: (nibble & 0x7) as u8,
            secure: nibble & 0x8 != 0,
        }
    }
}

/// MAILBOX_LOCKOUT: one byte per mailbox, one bit per host. A set bit locks
/// that host out. Only the first [`Lockout::MAILBOXES`] mailboxes have a
/// byte; the others can never be locked.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Lockout(pub u32);

impl Lockout {
    pub const MAILBOXES: u8 = 4;

    fn bit(mailbox: MailboxNumber, host: u8) -> Option<u32> {
        let shift = (u32::from(mailbox.get()) - 1) * 8 + u32::from(host & 0x7);
        1u32.checked_shl(shift)
    }

    pub fn covers(mailbox: MailboxNumber) -> bool {
        mailbox.get() <= Self::MAILBOXES
    }

    pub fn is_locked(self, mailbox: MailboxNumber, host: u8) -> bool {
        Self::bit(mailbox, host).map_or(false, |b| self.0 & b != 0)
    }

    pub fn allow(&mut self, mailbox: MailboxNumber, host: u8) {
        if let Some(b) = Self::bit(mailbox, host) {
            self.0 &= !b;
        }
    }

    pub fn deny(&mut self, mailbox: MailboxNumber, host: u8) {
        if let Some(b) = Self::bit(mailbox, host) {
            self.0 |= b;
        }
    }
}

bitfield! {
    /// MODULE_STATUS
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct ModuleStatus(u32);
    impl Debug;
    pub fips_bit, _: 0;
    pub non_fips, _: 1;
    pub crc24_busy, _: 8;
    pub crc24_ok, _: 9;
    pub crc24_error, _: 10;
    pub firmware_written, set_firmware_written: 20;
    pub firmware_checks_busy, _: 22;
    pub firmware_accepted, _: 23;
    pub fatal_error, _: 31;
}

impl ModuleStatus {
    pub const FIPS_MODE: u32 = 1 << 0;
    pub const NON_FIPS: u32 = 1 << 1;
    pub const CRC24_BUSY: u32 = 1 << 8;
    pub const CRC24_OK: u32 = 1 << 9;
    pub const CRC24_ERROR: u32 = 1 << 10;
    pub const FIRMWARE_WRITTEN: u32 = 1 << 20;
    pub const FIRMWARE_CHECKS_BUSY: u32 = 1 << 22;
    pub const FIRMWARE_ACCEPTED: u32 = 1 << 23;
    pub const FATAL_ERROR: u32 = 1 << 31;

    pub fn from_raw(raw: u32) -> ModuleStatus {
        ModuleStatus(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// The FIPS bit only means something while the non-FIPS bit is clear.
    pub fn fips_mode(self) -> bool {
        !self.non_fips() && self.fips_bit()
    }

    /// CRC24 failed or the engine hit a fatal error.
    pub fn is_faulted(self) -> bool {
        !self.crc24_ok() || self.fatal_error()
    }

    /// The written/checks-busy/accepted triple, everything else masked off.
    pub fn firmware_bits(self) -> u32 {
        self.0 & (Self::FIRMWARE_WRITTEN | Self::FIRMWARE_CHECKS_BUSY | Self::FIRMWARE_ACCEPTED)
    }
}

bitfield! {
    /// EIP_VERSION
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Version(u32);
    impl Debug;
    pub u8, eip_number, _: 7, 0;
    pub u8, eip_number_complement, _: 15, 8;
    pub u8, patch_level, _: 19, 16;
    pub u8, minor_version, _: 23, 20;
    pub u8, major_version, _: 27, 24;
}

impl Version {
    pub fn from_raw(raw: u32) -> Version {
        Version(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn signature(self) -> u16 {
        self.0 as u16
    }

    pub fn is_supported(self) -> bool {
        matches!(
            self.signature(),
            SIGNATURE_EIP130 | SIGNATURE_EIP133 | SIGNATURE_EIP140
        )
    }
}

bitfield! {
    /// EIP_OPTIONS
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Options(u32);
    impl Debug;
    pub u8, nr_of_mailboxes, _: 3, 0;
    pub u8, mailbox_size_sel, _: 5, 4;
    pub u8, host_ids, _: 15, 8;
    pub u8, master_id, _: 18, 16;
    pub protection_available, _: 19;
    pub u8, my_host_id, _: 22, 20;
    pub my_protection, _: 23;
    pub u8, secure_host_ids, _: 31, 24;
}

impl Options {
    pub fn from_raw(raw: u32) -> Options {
        Options(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Mailbox window size in bytes.
    pub fn mailbox_size(self) -> u16 {
        0x80 << self.mailbox_size_sel()
    }
}

bitfield! {
    /// EIP_OPTIONS2
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Options2(u32);
    impl Debug;
    pub u8, engines, _: 5, 0;
    pub firmware_ram, _: 9;
    pub bus_interface, _: 12;
    pub u16, custom_engines_sel, _: 25, 16;
}

impl Options2 {
    pub fn from_raw(raw: u32) -> Options2 {
        Options2(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn custom_engines(self) -> u32 {
        128u32
            .checked_shl(u32::from(self.custom_engines_sel()))
            .unwrap_or(0)
    }
}

/// Typed view over a `RegisterIo`.
pub struct Registers<D> {
    io: D,
}

impl<D: RegisterIo> Registers<D> {
    pub fn new(io: D) -> Registers<D> {
        Registers { io }
    }

    pub fn io(&self) -> &D {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut D {
        &mut self.io
    }

    pub fn into_inner(self) -> D {
        self.io
    }

    pub fn mailbox_status(&mut self) -> MailboxStatus {
        MailboxStatus(self.io.read32(MAILBOX_STAT))
    }

    pub fn mailbox_raw_status(&mut self) -> MailboxStatus {
        MailboxStatus(self.io.read32(MAILBOX_RAWSTAT))
    }

    pub fn write_mailbox_control(&mut self, value: u32) {
        self.io.write32(MAILBOX_CTRL, value);
    }

    pub fn write_mailbox_reset(&mut self, value: u32) {
        self.io.write32(MAILBOX_RESET, value);
    }

    pub fn link_ids(&mut self) -> LinkIds {
        LinkIds(self.io.read32(MAILBOX_LINKID))
    }

    pub fn out_ids(&mut self) -> LinkIds {
        LinkIds(self.io.read32(MAILBOX_OUTID))
    }

    pub fn lockout(&mut self) -> Lockout {
        Lockout(self.io.read32(MAILBOX_LOCKOUT))
    }

    pub fn write_lockout(&mut self, lockout: Lockout) {
        self.io.write32(MAILBOX_LOCKOUT, lockout.0);
    }

    pub fn module_status(&mut self) -> ModuleStatus {
        ModuleStatus(self.io.read32(MODULE_STATUS))
    }

    /// Tell the engine the firmware body is in place.
    pub fn mark_firmware_written(&mut self) {
        self.io
            .write32(MODULE_STATUS, ModuleStatus::FIRMWARE_WRITTEN);
    }

    pub fn version(&mut self) -> Version {
        Version(self.io.read32(EIP_VERSION))
    }

    pub fn options(&mut self) -> Options {
        Options(self.io.read32(EIP_OPTIONS))
    }

    pub fn options2(&mut self) -> Options2 {
        Options2(self.io.read32(EIP_OPTIONS2))
    }

    pub fn write_mailbox(&mut self, mailbox: MailboxNumber, words: &[u32]) {
        self.io.write32_array(mailbox.window(), words);
    }

    pub fn read_mailbox(&mut self, mailbox: MailboxNumber, words: &mut [u32]) {
        self.io
            .read32_array(MAILBOX_OUT_BASE + (mailbox.window() - MAILBOX_IN_BASE), words);
    }

    pub fn write_firmware_ram(&mut self, words: &[u32]) {
        self.io.write32_array(FIRMWARE_RAM_BASE, words);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Flat(BTreeMap<u32, u32>);

    impl RegisterIo for Flat {
        fn read32(&mut self, offset: u32) -> u32 {
            self.0.get(&offset).copied().unwrap_or(0)
        }

        fn write32(&mut self, offset: u32, value: u32) {
            self.0.insert(offset, value);
        }
    }

    fn mbx(nr: u8) -> MailboxNumber {
        MailboxNumber::new(nr).unwrap()
    }

    #[test]
    fn mailbox_number_range() {
        assert!(MailboxNumber::new(0).is_none());
        assert!(MailboxNumber::new(9).is_none());
        assert_eq!(mbx(3).shift(), 8);
        assert_eq!(mbx(3).window(), 0x800);
        assert!(MailboxNumber::try_from(12u8).is_err());
    }

    #[test]
    fn per_mailbox_nibbles() {
        assert_eq!(MailboxRequest::Link.mask(mbx(1)), 0x4);
        assert_eq!(MailboxRequest::Unlink.mask(mbx(2)), 0x80);
        assert_eq!(MailboxRequest::Submit.mask(mbx(4)), 0x1000);

        let status = MailboxStatus(0x0000_0640);
        assert!(status.linked(mbx(2)));
        assert!(!status.in_full(mbx(2)));
        assert!(status.out_full(mbx(3)));
        assert!(status.linked(mbx(3)));
        assert!(!status.linked(mbx(1)));
    }

    #[test]
    fn link_owner_decode() {
        let ids = LinkIds(0x0000_00B0);
        assert_eq!(
            ids.owner(mbx(2)),
            LinkOwner {
                host_id: 3,
                secure: true
            }
        );
        assert_eq!(
            ids.owner(mbx(1)),
            LinkOwner {
                host_id: 0,
                secure: false
            }
        );
    }

    #[test]
    fn lockout_bits() {
        let mut l = Lockout::default();
        l.deny(mbx(2), 5);
        assert_eq!(l.0, 1 << 13);
        assert!(l.is_locked(mbx(2), 5));
        assert!(!l.is_locked(mbx(1), 5));
        l.allow(mbx(2), 5);
        assert_eq!(l, Lockout(0));
    }

    #[test]
    fn lockout_beyond_fourth_mailbox() {
        let mut l = Lockout::default();
        l.deny(mbx(4), 7);
        assert_eq!(l.0, 1 << 31);
        assert!(Lockout::covers(mbx(4)));
        for nr in 5..=MailboxNumber::MAX {
            assert!(!Lockout::covers(mbx(nr)));
            l.deny(mbx(nr), 0);
            assert!(!l.is_locked(mbx(nr), 0));
            l.allow(mbx(nr), 7);
        }
        assert_eq!(l.0, 1 << 31);
    }

    #[test]
    fn version_and_options_decode() {
        let v = Version::from_raw(0x0230_7D82);
        assert!(v.is_supported());
        assert_eq!(v.eip_number(), 130);
        assert_eq!(v.major_version(), 2);
        assert_eq!(v.minor_version(), 3);
        assert_eq!(v.patch_level(), 0);
        assert!(!Version::from_raw(0x0000_1234).is_supported());

        // 4 mailboxes of 256 bytes, master 1, my host 1, protection on
        let o = Options::from_raw(0x0099_0314);
        assert_eq!(o.nr_of_mailboxes(), 4);
        assert_eq!(o.mailbox_size(), 0x100);
        assert_eq!(o.host_ids(), 3);
        assert_eq!(o.master_id(), 1);
        assert!(o.protection_available());
        assert_eq!(o.my_host_id(), 1);
        assert!(o.my_protection());

        let o2 = Options2::from_raw(0x0001_0203);
        assert!(o2.firmware_ram());
        assert!(!o2.bus_interface());
        assert_eq!(o2.engines(), 3);
        assert_eq!(o2.custom_engines(), 256);
    }

    #[test]
    fn module_status_fips_needs_non_fips_clear() {
        let s = ModuleStatus::from_raw(ModuleStatus::FIPS_MODE | ModuleStatus::NON_FIPS);
        assert!(!s.fips_mode());
        let s = ModuleStatus::from_raw(ModuleStatus::FIPS_MODE | ModuleStatus::CRC24_OK);
        assert!(s.fips_mode());
        assert!(!s.is_faulted());
        let s = ModuleStatus::from_raw(ModuleStatus::CRC24_OK | ModuleStatus::FATAL_ERROR);
        assert!(s.is_faulted());
    }

    #[test]
    fn typed_accessors_hit_the_right_offsets() {
        let mut regs = Registers::new(Flat::default());
        regs.write_mailbox(mbx(2), &[1, 2, 3]);
        regs.mark_firmware_written();
        regs.write_firmware_ram(&[0xAA, 0xBB]);
        let mut back = [0u32; 3];
        regs.read_mailbox(mbx(2), &mut back);
        assert_eq!(back, [1, 2, 3]);

        let flat = regs.into_inner();
        assert_eq!(flat.0[&0x408], 3);
        assert_eq!(flat.0[&MODULE_STATUS], ModuleStatus::FIRMWARE_WRITTEN);
        assert_eq!(flat.0[&(FIRMWARE_RAM_BASE + 4)], 0xBB);
    }

    #[test]
    fn dma_address_split() {
        let a = DmaAddress(0x1_2345_6789);
        assert_eq!(a.low(), 0x2345_6789);
        assert_eq!(a.high(), 1);
        assert_eq!(DmaAddress::from_words(a.low(), a.high()), a);
    }
}
