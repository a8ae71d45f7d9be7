// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A register-level model of an EIP-130 good enough to run the driver
//! against: mailboxes with link and lockout state, the firmware download
//! handshake, a small asset store and a DMA window.
//!
//! It does no cryptography. Signature checks pass or fail as configured and
//! are recorded for inspection. Hash tokens only collect the bytes they are
//! given in their state asset, and a finalized digest is a simple fold of
//! those bytes.

use byteorder::{ByteOrder, LittleEndian};
use eip130_regs::{
    DmaAddress, DmaError, DmaMap, Lockout, MailboxNumber, MailboxRequest, ModuleStatus,
    RegisterIo, EIP_OPTIONS, EIP_OPTIONS2, EIP_VERSION, FIRMWARE_RAM_BASE, MAILBOX_CTRL,
    MAILBOX_LINKID, MAILBOX_LOCKOUT, MAILBOX_OUTID, MAILBOX_RAWSTAT, MAILBOX_RESET,
    MAILBOX_SPACING_BYTES, MAILBOX_STAT, MODULE_STATUS, Version,
};
use eip130_token::hash::{self, HashAlgorithm};
use eip130_token::pk::PkAssetCommand;
use eip130_token::{
    AssetSubcode, CommandToken, Opcode, PkSubcode, ResultCode, SystemSubcode, COMMAND_WORDS,
    RESULT_WORDS,
};
use log::trace;
use num_traits::FromPrimitive;
use serde::Deserialize;
use std::collections::BTreeMap;

const WINDOW_WORDS: usize = (MAILBOX_SPACING_BYTES / 4) as usize;
const DMA_BASE: u64 = 0x8000_0000;
const FIRST_DYNAMIC_ID: u32 = 0x4000;
const WRITE_TOKEN_ID: u32 = 1 << 18;

/// An asset programmed at manufacturing time, found by `search`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StaticAsset {
    pub index: u32,
    pub id: u32,
    pub data: Vec<u8>,
    /// A monotonic counter rather than public data.
    #[serde(default)]
    pub counter: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SimConfig {
    pub version: u32,
    pub mailboxes: u8,
    pub host_id: u8,
    pub master_id: u8,
    pub my_protection: bool,
    pub protection_available: bool,
    /// The connection to the engine is non-secure.
    pub non_secure: bool,
    pub firmware_ram: bool,
    /// Firmware is already running, as after a warm boot.
    pub firmware_loaded: bool,
    /// Module status reads showing CRC24 busy after reset.
    pub crc_busy_polls: u32,
    pub crc_error: bool,
    /// Module status reads showing the firmware checks busy after a body
    /// write, before the verdict.
    pub checks_busy_polls: u32,
    /// Number of firmware loads to reject before accepting one.
    pub reject_loads: u32,
    /// Raise a fatal error as soon as a firmware body is written.
    pub fatal_on_body: bool,
    /// Register reads between a submit and the result showing up.
    pub latency: u32,
    pub login_supported: bool,
    pub fips: bool,
    pub signatures_valid: bool,
    pub firmware_version: u32,
    pub memory_size: u16,
    pub dma_size: usize,
    pub assets: Vec<StaticAsset>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig::running()
    }
}

impl SimConfig {
    /// A warm engine with firmware accepted and a few static assets.
    pub fn running() -> SimConfig {
        SimConfig {
            version: 0x0220_7D82,
            mailboxes: 4,
            host_id: 0,
            master_id: 0,
            my_protection: true,
            protection_available: true,
            non_secure: false,
            firmware_ram: true,
            firmware_loaded: true,
            crc_busy_polls: 0,
            crc_error: false,
            checks_busy_polls: 2,
            reject_loads: 0,
            fatal_on_body: false,
            latency: 3,
            login_supported: true,
            fips: false,
            signatures_valid: true,
            firmware_version: 0x0003_0201,
            memory_size: 0x4000,
            dma_size: 64 * 1024,
            assets: vec![
                StaticAsset {
                    index: 5,
                    id: 0x1000,
                    data: (0u8..32).collect(),
                    counter: false,
                },
                StaticAsset {
                    index: 20,
                    id: 0x2000,
                    data: vec![0x1F, 0, 0, 0, 0, 0, 0, 0],
                    counter: true,
                },
            ],
        }
    }

    /// Straight out of reset with the firmware RAM still empty.
    pub fn fresh() -> SimConfig {
        SimConfig {
            firmware_loaded: false,
            crc_busy_polls: 2,
            ..SimConfig::running()
        }
    }
}

/// What the engine has seen, for tests to check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub header_submissions: u32,
    pub body_loads: u32,
    pub body_words_written: u32,
    pub tokens_processed: u32,
    pub hash_tokens: u32,
    pub module_status_reads: u32,
}

/// One RSA verification request as the engine saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyRequest {
    pub command: u8,
    pub key: Vec<u8>,
    /// Everything hashed, including what came in earlier hash tokens.
    pub message: Vec<u8>,
    /// State asset the earlier part of the message was hashed into.
    pub hash_state: Option<u32>,
    pub signature: Vec<u8>,
    pub total_length: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Firmware {
    Rom,
    AwaitingHeader,
    AwaitingBody,
    Checking(u32),
    Accepted,
}

struct Slot {
    linked: bool,
    owner: u8,
    in_full: bool,
    out_full: bool,
    pending: Option<u32>,
    inbox: Vec<u32>,
    outbox: Vec<u32>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            linked: false,
            owner: 0,
            in_full: false,
            out_full: false,
            pending: None,
            inbox: vec![0; WINDOW_WORDS],
            outbox: vec![0; WINDOW_WORDS],
        }
    }
}

struct Asset {
    policy: u64,
    len: u32,
    data: Option<Vec<u8>>,
}

pub struct SimEngine {
    cfg: SimConfig,
    slots: Vec<Slot>,
    lockout: Lockout,
    firmware: Firmware,
    crc_busy: u32,
    rejected: u32,
    fatal: bool,
    fips: bool,
    users: Option<[u32; 4]>,
    assets: BTreeMap<u32, Asset>,
    hash_states: BTreeMap<u32, Vec<u8>>,
    statics: Vec<StaticAsset>,
    next_id: u32,
    dma: BTreeMap<u64, Vec<u8>>,
    next_dma: u64,
    stats: SimStats,
    verifies: Vec<VerifyRequest>,
}

type Outcome = Result<(), ResultCode>;

impl SimEngine {
    pub fn new(cfg: SimConfig) -> SimEngine {
        let firmware = match (cfg.firmware_ram, cfg.firmware_loaded) {
            (false, _) => Firmware::Rom,
            (true, true) => Firmware::Accepted,
            (true, false) => Firmware::AwaitingHeader,
        };
        SimEngine {
            slots: (0..cfg.mailboxes).map(|_| Slot::new()).collect(),
            lockout: Lockout::default(),
            firmware,
            crc_busy: cfg.crc_busy_polls,
            rejected: 0,
            fatal: false,
            fips: cfg.fips,
            users: None,
            assets: BTreeMap::new(),
            hash_states: BTreeMap::new(),
            statics: cfg.assets.clone(),
            next_id: FIRST_DYNAMIC_ID,
            dma: BTreeMap::new(),
            next_dma: DMA_BASE,
            stats: SimStats::default(),
            verifies: Vec::new(),
            cfg,
        }
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn verifies(&self) -> &[VerifyRequest] {
        &self.verifies
    }

    pub fn fips(&self) -> bool {
        self.fips
    }

    pub fn users(&self) -> Option<[u32; 4]> {
        self.users
    }

    pub fn firmware_accepted(&self) -> bool {
        matches!(self.firmware, Firmware::Rom | Firmware::Accepted)
    }

    /// Assets created through tokens and not yet deleted.
    pub fn dynamic_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn live_dma_buffers(&self) -> usize {
        self.dma.len()
    }

    fn running(&self) -> bool {
        self.firmware_accepted() && !self.fatal
    }

    fn mailbox_status(&self) -> u32 {
        self.slots.iter().enumerate().fold(0, |acc, (i, s)| {
            let nibble = u32::from(s.in_full)
                | u32::from(s.out_full) << 1
                | u32::from(s.linked) << 2
                | u32::from(!s.linked) << 3;
            acc | nibble << (i * 4)
        })
    }

    fn link_ids(&self) -> u32 {
        self.slots.iter().enumerate().fold(0, |acc, (i, s)| {
            if !s.linked {
                return acc;
            }
            let nibble = u32::from(s.owner & 0x7) | u32::from(!self.cfg.non_secure) << 3;
            acc | nibble << (i * 4)
        })
    }

    fn module_status(&mut self) -> u32 {
        self.stats.module_status_reads += 1;
        let mut v = 0;
        if self.cfg.crc_error {
            v |= ModuleStatus::CRC24_ERROR;
        } else if self.crc_busy > 0 {
            self.crc_busy -= 1;
            v |= ModuleStatus::CRC24_BUSY;
        } else {
            v |= ModuleStatus::CRC24_OK;
        }
        if self.fatal {
            v |= ModuleStatus::FATAL_ERROR;
        }
        v |= match self.firmware {
            Firmware::Rom => 0,
            Firmware::AwaitingHeader => ModuleStatus::FIRMWARE_WRITTEN,
            Firmware::AwaitingBody => ModuleStatus::FIRMWARE_CHECKS_BUSY,
            Firmware::Checking(0) => {
                self.firmware_verdict();
                return self.module_status_after_verdict(v);
            }
            Firmware::Checking(n) => {
                self.firmware = Firmware::Checking(n - 1);
                ModuleStatus::FIRMWARE_WRITTEN | ModuleStatus::FIRMWARE_CHECKS_BUSY
            }
            Firmware::Accepted => ModuleStatus::FIRMWARE_WRITTEN | ModuleStatus::FIRMWARE_ACCEPTED,
        };
        v | self.fips_bits()
    }

    fn module_status_after_verdict(&self, v: u32) -> u32 {
        let fw = match self.firmware {
            Firmware::Accepted => ModuleStatus::FIRMWARE_WRITTEN | ModuleStatus::FIRMWARE_ACCEPTED,
            _ => ModuleStatus::FIRMWARE_WRITTEN,
        };
        v | fw | self.fips_bits()
    }

    fn fips_bits(&self) -> u32 {
        if !self.firmware_accepted() {
            0
        } else if self.fips {
            ModuleStatus::FIPS_MODE
        } else {
            ModuleStatus::NON_FIPS
        }
    }

    fn firmware_verdict(&mut self) {
        if self.rejected < self.cfg.reject_loads {
            self.rejected += 1;
            trace!("sim: firmware rejected ({} so far)", self.rejected);
            self.firmware = Firmware::AwaitingHeader;
        } else {
            trace!("sim: firmware accepted");
            self.firmware = Firmware::Accepted;
        }
    }

    fn control(&mut self, value: u32) {
        let host = self.cfg.host_id;
        for i in 0..self.slots.len() {
            let Some(mailbox) = MailboxNumber::new(i as u8 + 1) else {
                continue;
            };
            let request = |r: MailboxRequest| value & r.mask(mailbox) != 0;
            if request(MailboxRequest::Link)
                && !self.slots[i].linked
                && !self.lockout.is_locked(mailbox, host)
            {
                self.slots[i].linked = true;
                self.slots[i].owner = host;
            }
            if request(MailboxRequest::Unlink) {
                self.slots[i].linked = false;
            }
            if request(MailboxRequest::ReturnOut) {
                self.slots[i].out_full = false;
            }
            if request(MailboxRequest::Submit) && self.slots[i].linked && !self.slots[i].in_full {
                self.slots[i].in_full = true;
                if self.cfg.latency == 0 {
                    self.process(i);
                } else {
                    self.slots[i].pending = Some(self.cfg.latency);
                }
            }
        }
    }

    fn link_reset(&mut self, value: u32) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if value & (MailboxRequest::Unlink as u32) << (i * 4) != 0 {
                slot.linked = false;
            }
        }
    }

    fn tick(&mut self) {
        for i in 0..self.slots.len() {
            match self.slots[i].pending {
                Some(n) if n <= 1 => self.process(i),
                Some(n) => self.slots[i].pending = Some(n - 1),
                None => {}
            }
        }
    }

    /// Consume the token in slot `i`'s IN window.
    fn process(&mut self, i: usize) {
        if self.slots[i].out_full {
            self.slots[i].pending = Some(1);
            return;
        }
        let mut words = [0u32; COMMAND_WORDS];
        words.copy_from_slice(&self.slots[i].inbox[..COMMAND_WORDS]);
        self.slots[i].in_full = false;
        self.slots[i].pending = None;

        if self.firmware == Firmware::AwaitingHeader {
            // The firmware header goes to the boot ROM and has no result
            self.stats.header_submissions += 1;
            self.firmware = Firmware::AwaitingBody;
            return;
        }

        self.stats.tokens_processed += 1;
        let cmd = CommandToken::from_words(words);
        let mut res = [0u32; RESULT_WORDS];
        let outcome = if self.running() {
            self.execute(&cmd, &mut res)
        } else {
            Err(ResultCode::InvalidState)
        };
        let code = match outcome {
            Ok(()) => 0,
            Err(e) => {
                res = [0; RESULT_WORDS];
                e as i32
            }
        };
        res[0] = (code as u32) << 24;
        if cmd.word(0) & WRITE_TOKEN_ID != 0 {
            res[0] |= u32::from(cmd.token_id());
        }
        trace!("sim: {cmd:?} -> {code}");
        self.slots[i].outbox[..RESULT_WORDS].copy_from_slice(&res);
        self.slots[i].out_full = true;
    }

    fn execute(&mut self, cmd: &CommandToken, res: &mut [u32; RESULT_WORDS]) -> Outcome {
        match cmd.opcode() {
            Some(Opcode::System) => match SystemSubcode::from_u8(cmd.subcode()) {
                Some(sub) => self.system(sub, cmd, res),
                None => Err(ResultCode::InvalidToken),
            },
            Some(Opcode::AssetManagement) => match AssetSubcode::from_u8(cmd.subcode()) {
                Some(sub) => self.asset(sub, cmd, res),
                None => Err(ResultCode::InvalidToken),
            },
            Some(Opcode::PublicKey) if cmd.subcode() == PkSubcode::WithAssets as u8 => {
                self.pk_with_assets(cmd)
            }
            Some(Opcode::Hash) => self.hash(cmd, res),
            Some(Opcode::Nop) => Ok(()),
            _ => Err(ResultCode::InvalidToken),
        }
    }

    fn system(
        &mut self,
        sub: SystemSubcode,
        cmd: &CommandToken,
        res: &mut [u32; RESULT_WORDS],
    ) -> Outcome {
        match sub {
            SystemSubcode::SystemInfo => {
                res[1] = self.cfg.firmware_version;
                let hw = Version::from_raw(self.cfg.version);
                res[2] = u32::from(hw.major_version()) << 16
                    | u32::from(hw.minor_version()) << 8
                    | u32::from(hw.patch_level());
                res[3] = u32::from(self.cfg.memory_size)
                    | u32::from(self.cfg.host_id & 0x7) << 16
                    | u32::from(self.cfg.non_secure) << 19;
                res[4] = cmd.identity();
                Ok(())
            }
            SystemSubcode::DefineUsers => {
                if self.fips {
                    return Err(ResultCode::InvalidState);
                }
                let mut users = [0u32; 4];
                users.copy_from_slice(&cmd.words()[2..6]);
                self.users = Some(users);
                Ok(())
            }
            SystemSubcode::SelfTest => {
                if self.users.is_some() {
                    self.fips = true;
                }
                Ok(())
            }
            SystemSubcode::Login if !self.cfg.login_supported => Err(ResultCode::InvalidToken),
            _ => Ok(()),
        }
    }

    fn asset(
        &mut self,
        sub: AssetSubcode,
        cmd: &CommandToken,
        res: &mut [u32; RESULT_WORDS],
    ) -> Outcome {
        let w = cmd.words();
        match sub {
            AssetSubcode::Search => {
                let index = (w[4] >> 16) & 0xFF;
                let found = self
                    .statics
                    .iter()
                    .find(|a| a.index == index)
                    .ok_or(ResultCode::InvalidAsset)?;
                res[1] = found.id;
                res[2] = found.data.len() as u32;
                Ok(())
            }
            AssetSubcode::Create => {
                let len = w[4] & 0x3FF;
                if len == 0 {
                    return Err(ResultCode::InvalidLength);
                }
                if self.assets.len() >= 16 {
                    return Err(ResultCode::FullError);
                }
                let id = self.next_id;
                self.next_id += 0x10;
                self.assets.insert(
                    id,
                    Asset {
                        policy: u64::from(w[2]) | u64::from(w[3]) << 32,
                        len,
                        data: None,
                    },
                );
                res[1] = id;
                Ok(())
            }
            AssetSubcode::Load => self.asset_load(cmd),
            AssetSubcode::Delete => {
                self.hash_states.remove(&w[2]);
                self.assets
                    .remove(&w[2])
                    .map(|_| ())
                    .ok_or(ResultCode::InvalidAsset)
            }
            AssetSubcode::PublicData | AssetSubcode::MonotonicRead => {
                let counter = sub == AssetSubcode::MonotonicRead;
                let data = self
                    .statics
                    .iter()
                    .find(|a| a.id == w[2] && a.counter == counter)
                    .map(|a| a.data.clone())
                    .ok_or(ResultCode::InvalidAsset)?;
                if (w[3] as usize) < data.len() {
                    return Err(ResultCode::InvalidLength);
                }
                self.dma_write(cmd.dma_address(4), &data)?;
                res[1] = data.len() as u32;
                Ok(())
            }
            AssetSubcode::MonotonicIncrement => {
                let counter = self
                    .statics
                    .iter_mut()
                    .find(|a| a.id == w[2] && a.counter)
                    .ok_or(ResultCode::InvalidAsset)?;
                let byte = counter
                    .data
                    .iter_mut()
                    .find(|b| **b != 0xFF)
                    .ok_or(ResultCode::DataOverrun)?;
                let next = *byte | byte.wrapping_add(1);
                *byte = next;
                Ok(())
            }
            AssetSubcode::OtpDataWrite => {
                let index = (w[2] >> 1) & 0x7F;
                if self.statics.iter().any(|a| a.index == index) {
                    return Err(ResultCode::OtpWriteError);
                }
                let data = self.dma_read(cmd.dma_address(4), (w[3] & 0x3FF) as usize)?;
                self.statics.push(StaticAsset {
                    index,
                    id: 0x3000 + index,
                    data,
                    counter: false,
                });
                Ok(())
            }
        }
    }

    fn asset_load(&mut self, cmd: &CommandToken) -> Outcome {
        let w = cmd.words();
        let mode = w[3];
        let input_len = (w[3] & 0x3FF) as usize;
        let input = if mode & (1 << 27 | 1 << 26) != 0 {
            Some(self.dma_read(cmd.dma_address(4), input_len)?)
        } else {
            None
        };
        if mode & (1 << 24 | 1 << 26) != 0 && !self.assets.contains_key(&w[9]) {
            return Err(ResultCode::InvalidAsset);
        }
        let asset = self.assets.get_mut(&w[2]).ok_or(ResultCode::InvalidAsset)?;
        let len = asset.len as usize;
        let data = match input {
            Some(plain) if mode & (1 << 27) != 0 => {
                if plain.len() != len {
                    return Err(ResultCode::InvalidLength);
                }
                plain
            }
            // Imported blobs carry a wrapping overhead the model ignores
            Some(blob) => blob.into_iter().cycle().take(len).collect(),
            None => (0..len).map(|i| (i as u8).wrapping_mul(0x9D) ^ 0x5A).collect(),
        };
        asset.data = Some(data);
        Ok(())
    }

    fn hash(&mut self, cmd: &CommandToken, res: &mut [u32; RESULT_WORDS]) -> Outcome {
        let w = cmd.words();
        let algorithm =
            HashAlgorithm::from_u32(w[6] & 0xF).ok_or(ResultCode::InvalidParameter)?;
        let init = w[6] & (1 << 4) == 0;
        let finalize = w[6] & (1 << 5) == 0;
        let len = w[2] as usize;
        if !finalize && len % hash::BLOCK_SIZE != 0 {
            return Err(ResultCode::InvalidLength);
        }
        let data = self.dma_read(cmd.dma_address(3), len)?;
        self.stats.hash_tokens += 1;

        let state = w[7];
        let mut collected = if init {
            Vec::new()
        } else {
            self.hash_states
                .get(&state)
                .cloned()
                .ok_or(ResultCode::InvalidAsset)?
        };
        collected.extend_from_slice(&data);

        if !finalize {
            if !self.assets.contains_key(&state) {
                return Err(ResultCode::InvalidAsset);
            }
            self.hash_states.insert(state, collected);
            return Ok(());
        }
        let total = u64::from(w[24]) | u64::from(w[25]) << 32;
        if !init && total != collected.len() as u64 {
            return Err(ResultCode::InvalidLength);
        }
        let mut digest = vec![0u8; algorithm.digest_len()];
        for (i, b) in collected.iter().enumerate() {
            let d = &mut digest[i % algorithm.digest_len()];
            *d = d.rotate_left(1) ^ b;
        }
        for (word, chunk) in res[2..].iter_mut().zip(digest.chunks(4)) {
            *word = LittleEndian::read_u32(chunk);
        }
        Ok(())
    }

    fn pk_with_assets(&mut self, cmd: &CommandToken) -> Outcome {
        let w = cmd.words();
        let command = (w[2] & 0xFF) as u8;
        let verify = [PkAssetCommand::RsaPkcsVerify, PkAssetCommand::RsaPssVerify]
            .iter()
            .any(|c| *c as u8 == command);
        if !verify {
            return Err(ResultCode::InvalidToken);
        }
        let key = self
            .assets
            .get(&w[4])
            .and_then(|a| a.data.clone().map(|d| (a.policy, d)))
            .ok_or(ResultCode::InvalidAsset)?;
        let tail = self.dma_read(cmd.dma_address(8), (w[7] & 0xFFF) as usize)?;
        let signature = self.dma_read(cmd.dma_address(10), ((w[7] >> 16) & 0xFFF) as usize)?;
        let total_length = u64::from(w[12]) | u64::from(w[13]) << 32;
        let hash_state = (w[6] != 0).then_some(w[6]);
        let mut message = match hash_state {
            Some(state) => self
                .hash_states
                .get(&state)
                .cloned()
                .ok_or(ResultCode::InvalidAsset)?,
            None => Vec::new(),
        };
        message.extend_from_slice(&tail);
        if hash_state.is_some() && total_length != message.len() as u64 {
            return Err(ResultCode::InvalidLength);
        }
        trace!("sim: verify with key policy {:#x}", key.0);
        self.verifies.push(VerifyRequest {
            command,
            key: key.1,
            message,
            hash_state,
            signature,
            total_length,
        });
        if self.cfg.signatures_valid {
            Ok(())
        } else {
            Err(ResultCode::VerifyError)
        }
    }

    /// Mapping containing `addr`, with the offset of `addr` inside it.
    fn dma_find(&self, addr: DmaAddress) -> Option<(u64, usize)> {
        let (base, buf) = self.dma.range(..=addr.0).next_back()?;
        let offset = (addr.0 - base) as usize;
        (offset <= buf.len()).then_some((*base, offset))
    }

    fn dma_read(&self, addr: DmaAddress, len: usize) -> Result<Vec<u8>, ResultCode> {
        let (base, offset) = self.dma_find(addr).ok_or(ResultCode::InvalidAddress)?;
        self.dma[&base]
            .get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .ok_or(ResultCode::InvalidLength)
    }

    fn dma_write(&mut self, addr: DmaAddress, data: &[u8]) -> Outcome {
        let (base, offset) = self.dma_find(addr).ok_or(ResultCode::InvalidAddress)?;
        let buf = self.dma.get_mut(&base).ok_or(ResultCode::InvalidAddress)?;
        buf.get_mut(offset..offset + data.len())
            .ok_or(ResultCode::InvalidLength)?
            .copy_from_slice(data);
        Ok(())
    }

    fn dma_alloc(&mut self, buf: Vec<u8>) -> Result<DmaAddress, DmaError> {
        let used: usize = self.dma.values().map(Vec::len).sum();
        if used + buf.len() > self.cfg.dma_size {
            return Err(DmaError::Exhausted(buf.len()));
        }
        let addr = self.next_dma;
        self.next_dma += (buf.len() as u64 + 15) & !15;
        self.dma.insert(addr, buf);
        Ok(DmaAddress(addr))
    }

    fn window_word(&self, offset: u32) -> Option<(usize, usize)> {
        let slot = (offset / MAILBOX_SPACING_BYTES) as usize;
        let word = ((offset % MAILBOX_SPACING_BYTES) / 4) as usize;
        (slot < self.slots.len()).then_some((slot, word))
    }
}

impl RegisterIo for SimEngine {
    fn read32(&mut self, offset: u32) -> u32 {
        let value = match offset {
            MAILBOX_STAT | MAILBOX_RAWSTAT => self.mailbox_status(),
            MAILBOX_LINKID | MAILBOX_OUTID => self.link_ids(),
            MAILBOX_LOCKOUT => self.lockout.0,
            MODULE_STATUS => self.module_status(),
            EIP_OPTIONS2 => 0x1F | u32::from(self.cfg.firmware_ram) << 9,
            EIP_OPTIONS => {
                u32::from(self.cfg.mailboxes & 0xF)
                    | 1 << 4
                    | 0xFF << 8
                    | u32::from(self.cfg.master_id & 0x7) << 16
                    | u32::from(self.cfg.protection_available) << 19
                    | u32::from(self.cfg.host_id & 0x7) << 20
                    | u32::from(self.cfg.my_protection) << 23
            }
            EIP_VERSION => self.cfg.version,
            o => match self.window_word(o) {
                Some((slot, word)) => self.slots[slot].outbox[word],
                None => 0,
            },
        };
        self.tick();
        value
    }

    fn write32(&mut self, offset: u32, value: u32) {
        match offset {
            MAILBOX_CTRL => self.control(value),
            MAILBOX_RESET => self.link_reset(value),
            MAILBOX_LOCKOUT => self.lockout = Lockout(value),
            MODULE_STATUS => {
                if value & ModuleStatus::FIRMWARE_WRITTEN != 0
                    && self.firmware == Firmware::AwaitingBody
                {
                    self.stats.body_loads += 1;
                    self.firmware = Firmware::Checking(self.cfg.checks_busy_polls);
                    self.fatal |= self.cfg.fatal_on_body;
                }
            }
            o if o >= FIRMWARE_RAM_BASE => self.stats.body_words_written += 1,
            o => {
                if let Some((slot, word)) = self.window_word(o) {
                    self.slots[slot].inbox[word] = value;
                }
            }
        }
    }
}

impl DmaMap for SimEngine {
    fn map_input(&mut self, data: &[u8]) -> Result<DmaAddress, DmaError> {
        self.dma_alloc(data.to_vec())
    }

    fn map_output(&mut self, len: usize) -> Result<DmaAddress, DmaError> {
        self.dma_alloc(vec![0; len])
    }

    fn read_output(&mut self, addr: DmaAddress, out: &mut [u8]) -> Result<(), DmaError> {
        let buf = self.dma.get(&addr.0).ok_or(DmaError::NotMapped(addr))?;
        let src = buf.get(..out.len()).ok_or(DmaError::Length {
            mapped: buf.len(),
            requested: out.len(),
        })?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn unmap(&mut self, addr: DmaAddress) {
        self.dma.remove(&addr.0);
    }
}
