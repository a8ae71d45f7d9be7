// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command and result tokens exchanged with an EIP-130 through its mailbox.
//!
//! A token is a fixed array of little-endian 32-bit words. Word 0 carries
//! the opcode, subcode and token id, word 1 the identity of the caller. The
//! builders in the submodules fill in the remaining words for one kind of
//! request each; none of them validate their inputs beyond masking fields to
//! their width.

use byteorder::{ByteOrder, LittleEndian};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::Serialize;
use std::fmt;
use std::num::NonZeroU32;

pub use eip130_regs::DmaAddress;

pub mod asset;
pub mod data;
pub mod hash;
pub mod pk;
pub mod policy;
pub mod result;
pub mod system;

pub use result::{ResultCode, TokenError, WARNING_Z1_USED};

pub const COMMAND_WORDS: usize = 64;
pub const RESULT_WORDS: usize = 64;

const TOKEN_ID_MASK: u32 = 0xFFFF;
const WRITE_TOKEN_ID: u32 = 1 << 18;
const OPCODE_SHIFT: u32 = 24;
const SUBCODE_SHIFT: u32 = 28;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Opcode {
    Nop = 0,
    Crypto = 1,
    Hash = 2,
    Mac = 3,
    Trng = 4,
    Special = 5,
    AesWrap = 6,
    AssetManagement = 7,
    AuthUnlock = 8,
    PublicKey = 9,
    Emmc = 10,
    ExtService = 11,
    Service = 14,
    System = 15,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum AssetSubcode {
    Search = 0,
    Create = 1,
    Load = 2,
    Delete = 3,
    PublicData = 4,
    MonotonicRead = 5,
    MonotonicIncrement = 6,
    OtpDataWrite = 7,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum SystemSubcode {
    SystemInfo = 0,
    SelfTest = 1,
    Reset = 2,
    DefineUsers = 3,
    Sleep = 4,
    ResumeFromSleep = 5,
    SetTime = 8,
    Login = 9,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum PkSubcode {
    NoAssets = 0,
    WithAssets = 1,
}

/// Reference to an asset held by the engine. The engine uses 0 for "no
/// asset", which is never a valid `AssetId`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "u32")]
pub struct AssetId(NonZeroU32);

impl AssetId {
    pub fn new(raw: u32) -> Option<AssetId> {
        NonZeroU32::new(raw).map(AssetId)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl From<AssetId> for u32 {
    fn from(id: AssetId) -> u32 {
        id.get()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.get())
    }
}

/// Pack `data` least significant byte first into consecutive words starting
/// at `start`, stopping at the end of `words`. Returns the number of bytes
/// that fit.
fn pack_bytes(words: &mut [u32], start: usize, data: &[u8]) -> usize {
    let room = words.len().saturating_sub(start) * 4;
    let n = data.len().min(room);
    for (i, chunk) in data[..n].chunks(4).enumerate() {
        let mut buf = [0u8; 4];
        buf[..chunk.len()].copy_from_slice(chunk);
        words[start + i] = LittleEndian::read_u32(&buf);
    }
    n
}

fn unpack_bytes(words: &[u32], start: usize, out: &mut [u8]) -> usize {
    let room = words.len().saturating_sub(start) * 4;
    let n = out.len().min(room);
    for (i, chunk) in out[..n].chunks_mut(4).enumerate() {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, words[start + i]);
        chunk.copy_from_slice(&buf[..chunk.len()]);
    }
    n
}

fn trimmed(words: &[u32]) -> &[u32] {
    let used = words.iter().rposition(|w| *w != 0).map_or(1, |i| i + 1);
    &words[..used]
}

#[derive(Clone, PartialEq, Eq)]
pub struct CommandToken {
    pub(crate) w: [u32; COMMAND_WORDS],
}

impl Default for CommandToken {
    fn default() -> Self {
        CommandToken {
            w: [0; COMMAND_WORDS],
        }
    }
}

impl fmt::Debug for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandToken")
            .field("opcode", &self.opcode())
            .field("subcode", &self.subcode())
            .field("words", &format_args!("{:08x?}", trimmed(&self.w)))
            .finish()
    }
}

impl CommandToken {
    /// An otherwise empty token for `opcode`/`subcode`.
    pub fn new(opcode: Opcode, subcode: u8) -> CommandToken {
        let mut t = CommandToken::default();
        t.w[0] = (opcode as u32 & 0xF) << OPCODE_SHIFT | (u32::from(subcode) & 0xF) << SUBCODE_SHIFT;
        t
    }

    /// Wrap words that were produced elsewhere, e.g. the authenticated
    /// header at the start of a firmware image.
    pub fn from_words(w: [u32; COMMAND_WORDS]) -> CommandToken {
        CommandToken { w }
    }

    pub fn words(&self) -> &[u32; COMMAND_WORDS] {
        &self.w
    }

    pub fn word(&self, index: usize) -> u32 {
        self.w[index]
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u32((self.w[0] >> OPCODE_SHIFT) & 0xF)
    }

    pub fn subcode(&self) -> u8 {
        ((self.w[0] >> SUBCODE_SHIFT) & 0xF) as u8
    }

    /// Set the token id, optionally asking the engine to echo it in the
    /// result token.
    pub fn set_token_id(&mut self, id: u16, write_id: bool) {
        self.w[0] &= !(TOKEN_ID_MASK | WRITE_TOKEN_ID);
        self.w[0] |= u32::from(id);
        if write_id {
            self.w[0] |= WRITE_TOKEN_ID;
        }
    }

    pub fn token_id(&self) -> u16 {
        (self.w[0] & TOKEN_ID_MASK) as u16
    }

    pub fn set_identity(&mut self, identity: u32) {
        self.w[1] = identity;
    }

    pub fn identity(&self) -> u32 {
        self.w[1]
    }

    /// Store `addr` in words `index` (low) and `index + 1` (high).
    pub fn set_dma_address(&mut self, index: usize, addr: DmaAddress) {
        self.w[index] = addr.low();
        self.w[index + 1] = addr.high();
    }

    pub fn dma_address(&self, index: usize) -> DmaAddress {
        DmaAddress::from_words(self.w[index], self.w[index + 1])
    }

    /// Write `data` least significant byte first starting at word `start`.
    /// Data that would run past the end of the token is dropped; the return
    /// value is the number of bytes written.
    pub fn write_bytes(&mut self, start: usize, data: &[u8]) -> usize {
        pack_bytes(&mut self.w, start, data)
    }

    pub fn read_bytes(&self, start: usize, out: &mut [u8]) -> usize {
        unpack_bytes(&self.w, start, out)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ResultToken {
    w: [u32; RESULT_WORDS],
}

impl Default for ResultToken {
    fn default() -> Self {
        ResultToken {
            w: [0; RESULT_WORDS],
        }
    }
}

impl fmt::Debug for ResultToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultToken")
            .field("code", &self.result_code())
            .field("words", &format_args!("{:08x?}", trimmed(&self.w)))
            .finish()
    }
}

impl ResultToken {
    pub fn from_words(w: [u32; RESULT_WORDS]) -> ResultToken {
        ResultToken { w }
    }

    pub fn words(&self) -> &[u32; RESULT_WORDS] {
        &self.w
    }

    pub fn word(&self, index: usize) -> u32 {
        self.w[index]
    }

    pub fn token_id(&self) -> u16 {
        (self.w[0] & TOKEN_ID_MASK) as u16
    }

    /// Sign-extended result code from the top byte of word 0. Zero is
    /// success, positive values are warnings, negative values errors.
    pub fn result_code(&self) -> i32 {
        (self.w[0] as i32) >> 24
    }

    /// Turn a negative result code into an error. Warnings pass through as
    /// the `Ok` value.
    pub fn check(&self) -> Result<i32, TokenError> {
        let code = self.result_code();
        if code < 0 {
            Err(TokenError::from_code(code))
        } else {
            Ok(code)
        }
    }

    /// The asset id most asset management results carry in word 1.
    pub fn asset_id(&self) -> Option<AssetId> {
        AssetId::new(self.w[1])
    }

    pub fn read_bytes(&self, start: usize, out: &mut [u8]) -> usize {
        unpack_bytes(&self.w, start, out)
    }
}
