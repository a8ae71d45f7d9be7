// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Public key tokens and the sub-vector format the PKA expects its big
//! numbers in.

use crate::{AssetId, CommandToken, DmaAddress, Opcode, PkSubcode, ResultToken};
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest message the engine hashes on its own in a single verify.
pub const MAX_HASH_SIZE: usize = 4095;

const LENGTH_MASK: u32 = 0xFFF;
const TRAILER_WORD: usize = 12;
const TRAILER_LEN_MASK: u32 = 0xFF;
const SAVE_SHARED_SECRET: u32 = 1 << 31;
const EXPLICIT_DIGEST: u32 = 1 << 30;

/// Operations on assets.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PkAssetCommand {
    EcdhEcdsaKeyCheck = 0x01,
    DhDsaKeyCheck = 0x02,
    EcdsaSign = 0x06,
    EcdsaVerify = 0x07,
    RsaPkcsSign = 0x08,
    RsaPkcsVerify = 0x09,
    RsaPkcsSignCrt = 0x0A,
    RsaPssSign = 0x0C,
    RsaPssVerify = 0x0D,
    RsaPssSignCrt = 0x0E,
    DhGenPubKey = 0x10,
    DhGenPrivPubKey = 0x11,
    DhGenSingleSharedSecret = 0x12,
    DhGenDualSharedSecret = 0x13,
    EcdhEcdsaGenPubKey = 0x14,
    EcdhEcdsaGenPrivPubKey = 0x15,
    EcdhGenSingleSharedSecret = 0x16,
    EcdhGenDualSharedSecret = 0x17,
    RsaOaepWrapString = 0x18,
    RsaOaepWrapHashed = 0x19,
    RsaOaepUnwrapString = 0x1A,
    RsaOaepUnwrapHashed = 0x1B,
}

/// Raw PKA operations on numbers loaded with [`num_load`].
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PkCommand {
    NumLoad = 0x01,
    NumSetN = 0x03,
    ModExpE = 0x04,
    ModExpD = 0x05,
    ModExpCrt = 0x06,
    EcMontMul = 0x0A,
    EccMul = 0x0B,
    EccAdd = 0x0C,
    DsaSign = 0x0D,
    DsaVerify = 0x0E,
    EcdsaSign = 0x0F,
    EcdsaVerify = 0x10,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum RsaPadding {
    #[default]
    Pkcs1v15,
    Pss,
}

impl RsaPadding {
    pub fn verify_command(self) -> PkAssetCommand {
        match self {
            RsaPadding::Pkcs1v15 => PkAssetCommand::RsaPkcsVerify,
            RsaPadding::Pss => PkAssetCommand::RsaPssVerify,
        }
    }
}

/// Everything a PK-with-assets token carries before its trailer.
#[derive(Copy, Clone, Debug, Default)]
pub struct PkAssetOp {
    pub n_words: u8,
    pub m_words: u8,
    /// Length of the extra input (digest, shared info...) in bytes.
    pub other_len: u8,
    pub key: Option<AssetId>,
    pub param: Option<AssetId>,
    pub io: Option<AssetId>,
    pub input: DmaAddress,
    pub input_len: u32,
    pub output: DmaAddress,
    pub output_len: u32,
}

fn raw(id: Option<AssetId>) -> u32 {
    id.map_or(0, AssetId::get)
}

pub fn with_assets(command: PkAssetCommand, op: &PkAssetOp) -> CommandToken {
    let mut t = CommandToken::new(Opcode::PublicKey, PkSubcode::WithAssets as u8);
    t.w[2] = command as u32 | u32::from(op.n_words) << 16 | u32::from(op.m_words) << 24;
    t.w[3] = u32::from(op.other_len) << 8;
    t.w[4] = raw(op.key);
    t.w[5] = raw(op.param);
    t.w[6] = raw(op.io);
    t.w[7] = (op.output_len & LENGTH_MASK) << 16 | (op.input_len & LENGTH_MASK);
    t.set_dma_address(8, op.input);
    t.set_dma_address(10, op.output);
    t
}

const TRAILER_ROOM: u32 = ((crate::COMMAND_WORDS - TRAILER_WORD) * 4) as u32;

/// Reserve up to `len` trailer bytes at the next word boundary. Returns the
/// word they start at and how many bytes fit before the end of the token.
fn trailer_slot(t: &mut CommandToken, len: u32) -> (usize, u32) {
    let offset = (((t.w[3] & TRAILER_LEN_MASK) + 3) & !3).min(TRAILER_ROOM);
    let len = len.min(TRAILER_ROOM - offset);
    t.w[3] &= !TRAILER_LEN_MASK;
    t.w[3] |= (offset + len) & TRAILER_LEN_MASK;
    (TRAILER_WORD + (offset / 4) as usize, len)
}

/// Returns the number of bytes that made it into the token.
pub fn set_additional_data(t: &mut CommandToken, data: &[u8]) -> usize {
    let (start, room) = trailer_slot(t, data.len() as u32);
    t.write_bytes(start, &data[..room as usize])
}

/// False when the trailer is already full; the token is left as it was.
pub fn set_additional_asset_id(t: &mut CommandToken, id: AssetId) -> bool {
    let saved = t.w[3];
    match trailer_slot(t, 4) {
        (start, 4) => {
            t.w[start] = id.get();
            true
        }
        _ => {
            t.w[3] = saved;
            false
        }
    }
}

/// Total length of a message hashed across several tokens. False when the
/// trailer is already full.
pub fn set_additional_length(t: &mut CommandToken, len: u64) -> bool {
    let saved = t.w[3];
    match trailer_slot(t, 8) {
        (start, 8) => {
            t.w[start] = len as u32;
            t.w[start + 1] = (len >> 32) as u32;
            true
        }
        _ => {
            t.w[3] = saved;
            false
        }
    }
}

pub fn set_additional_output(t: &mut CommandToken, addr: DmaAddress, len: u32) {
    t.w[12] = len;
    t.set_dma_address(13, addr);
}

pub fn addlen_correction(t: &mut CommandToken, correction: u8) {
    t.w[3] = t.w[3].wrapping_sub(u32::from(correction));
}

pub fn save_shared_secret(t: &mut CommandToken) {
    t.w[3] |= SAVE_SHARED_SECRET;
}

/// Verify against a digest computed by the caller instead of hashing the
/// input.
pub fn set_explicit_digest(t: &mut CommandToken, digest: &[u8]) {
    let digest = &digest[..digest.len().min(TRAILER_LEN_MASK as usize)];
    t.w[3] &= !TRAILER_LEN_MASK;
    t.w[3] |= EXPLICIT_DIGEST | digest.len() as u32;
    t.w[6] = 0;
    t.write_bytes(TRAILER_WORD, digest);
}

pub fn parse_output_length(r: &ResultToken) -> u32 {
    r.word(1) & LENGTH_MASK
}

fn no_assets(command: PkCommand) -> CommandToken {
    let mut t = CommandToken::new(Opcode::PublicKey, PkSubcode::NoAssets as u8);
    t.w[2] = command as u32;
    t
}

/// Claim the PKA for a sequence of raw operations.
pub fn claim(n_words: u8, m_words: u8, m_mask: u8) -> CommandToken {
    let mut t = no_assets(PkCommand::NumSetN);
    t.w[2] |= u32::from(m_mask) << 8 | u32::from(n_words) << 16 | u32::from(m_words) << 24;
    t
}

pub fn num_load(index: u8, input: DmaAddress, len: u32) -> CommandToken {
    let mut t = no_assets(PkCommand::NumLoad);
    t.w[2] |= (u32::from(index) & 0xF) << 24;
    t.w[5] = len & LENGTH_MASK;
    t.set_dma_address(6, input);
    t
}

pub fn operation(
    command: PkCommand,
    public_exponent: u32,
    input: DmaAddress,
    input_len: u32,
    output: DmaAddress,
    output_len: u32,
) -> CommandToken {
    let mut t = no_assets(command);
    t.w[2] &= 0x1F;
    t.w[3] = public_exponent;
    t.w[5] = (output_len & LENGTH_MASK) << 16 | (input_len & LENGTH_MASK);
    t.set_dma_address(6, input);
    t.set_dma_address(8, output);
    t
}

/// Give the PKA back after [`claim`].
pub fn release() -> CommandToken {
    no_assets(PkCommand::NumSetN)
}

/// Header in front of every big number handed to the PKA.
#[derive(Debug, PackedStruct, Copy, Clone, PartialEq, Eq)]
#[packed_struct(size_bytes = "4", bit_numbering = "msb0", endian = "lsb")]
pub struct SubVectorHeader {
    #[packed_field(bytes = "0..=1")]
    pub length_bits: u16,
    #[packed_field(bytes = "2")]
    pub index: u8,
    #[packed_field(bytes = "3")]
    pub count: u8,
}

#[derive(Debug, Error)]
pub enum KeyBlobError {
    #[error("a {0} bit number does not fit a sub-vector")]
    TooLarge(usize),

    #[error("empty modulus")]
    Empty,

    #[error("packing a sub-vector header failed")]
    Pack(#[source] PackingError),
}

fn push_subvector(
    blob: &mut Vec<u8>,
    index: u8,
    count: u8,
    big_endian: &[u8],
    width: usize,
) -> Result<(), KeyBlobError> {
    let bits = width * 8;
    let header = SubVectorHeader {
        length_bits: u16::try_from(bits).map_err(|_| KeyBlobError::TooLarge(bits))?,
        index,
        count,
    };
    blob.extend_from_slice(&header.pack().map_err(KeyBlobError::Pack)?);
    // The PKA wants little-endian numbers, zero extended to the full width
    let start = blob.len();
    blob.extend(big_endian.iter().rev());
    blob.resize(start + width, 0);
    Ok(())
}

fn strip_leading_zeros(n: &[u8]) -> &[u8] {
    let first = n.iter().position(|b| *b != 0).unwrap_or(n.len());
    &n[first..]
}

/// Sub-vector blob of an RSA public key from its big-endian modulus and
/// public exponent. The exponent is padded to a whole word.
pub fn rsa_public_key_blob(modulus: &[u8], exponent: &[u8]) -> Result<Vec<u8>, KeyBlobError> {
    let modulus = strip_leading_zeros(modulus);
    if modulus.is_empty() {
        return Err(KeyBlobError::Empty);
    }
    let exponent = strip_leading_zeros(exponent);
    let exp_width = ((exponent.len() + 3) & !3).max(4);

    let mut blob = Vec::with_capacity(8 + modulus.len() + exp_width);
    push_subvector(&mut blob, 0, 2, modulus, modulus.len())?;
    push_subvector(&mut blob, 1, 2, exponent, exp_width)?;
    Ok(blob)
}

/// Sub-vector blob of an RSA signature. `width` is the modulus size in
/// bytes; shorter signatures are zero extended.
pub fn rsa_signature_blob(signature: &[u8], width: usize) -> Result<Vec<u8>, KeyBlobError> {
    let signature = strip_leading_zeros(signature);
    if signature.len() > width {
        return Err(KeyBlobError::TooLarge(signature.len() * 8));
    }
    let mut blob = Vec::with_capacity(4 + width);
    push_subvector(&mut blob, 0, 1, signature, width)?;
    Ok(blob)
}

/// Number of 32-bit words in a `bytes` long operand, the unit N and M are
/// given in.
pub fn words_for(bytes: usize) -> u8 {
    u8::try_from((bytes + 3) / 4).unwrap_or(u8::MAX)
}
