// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hash tokens. A message too long for one token is hashed in pieces, the
//! intermediate state living in an asset between tokens.

use crate::{AssetId, CommandToken, DmaAddress, Opcode, ResultToken};
use num_derive::{FromPrimitive, ToPrimitive};

/// Every piece but the last must be a whole number of blocks.
pub const BLOCK_SIZE: usize = 64;

const ALGORITHM_MASK: u32 = 0xF;
const CONTINUE: u32 = 1 << 4;
const NO_FINALIZE: u32 = 1 << 5;
const STATE_WORD: usize = 7;
const TOTAL_LENGTH_WORD: usize = 24;
const DIGEST_WORD: usize = 2;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum HashAlgorithm {
    Sha1 = 1,
    Sha224 = 2,
    Sha256 = 3,
    Sha384 = 4,
    Sha512 = 5,
}

impl HashAlgorithm {
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

/// Hash `len` bytes at `addr`. `init` starts from the standard initial
/// value instead of a saved state; without `finalize` the state is kept for
/// the next piece.
pub fn hash(
    algorithm: HashAlgorithm,
    init: bool,
    finalize: bool,
    addr: DmaAddress,
    len: u32,
) -> CommandToken {
    let mut t = CommandToken::new(Opcode::Hash, 0);
    t.w[2] = len;
    t.set_dma_address(3, addr);
    t.w[5] = len;
    t.w[6] = algorithm as u32 & ALGORITHM_MASK;
    if !init {
        t.w[6] |= CONTINUE;
    }
    if !finalize {
        t.w[6] |= NO_FINALIZE;
    }
    t
}

/// Asset holding the intermediate state between pieces.
pub fn set_state_asset(t: &mut CommandToken, id: AssetId) {
    t.w[STATE_WORD] = id.get();
}

/// Length of the whole message, needed on the final piece.
pub fn set_total_length(t: &mut CommandToken, len: u64) {
    t.w[TOTAL_LENGTH_WORD] = len as u32;
    t.w[TOTAL_LENGTH_WORD + 1] = (len >> 32) as u32;
}

/// Digest returned by a finalizing hash token.
pub fn parse_digest(r: &ResultToken, out: &mut [u8]) -> usize {
    r.read_bytes(DIGEST_WORD, out)
}

/// Split a `len` byte message into the pieces streamed through a state
/// asset and the tail handed over last, at most `last_max` bytes long.
/// Each streamed piece is a whole number of blocks no longer than
/// `piece_max`. The tail only exceeds `last_max` when no whole block can be
/// taken off it.
pub fn split_message(len: usize, piece_max: usize, last_max: usize) -> (Vec<usize>, usize) {
    let piece_max = piece_max - piece_max % BLOCK_SIZE;
    let mut pieces = Vec::new();
    let mut left = len;
    while left > last_max {
        // Stream whole blocks, leaving at least one byte for the tail
        let take = piece_max.min((left - 1) / BLOCK_SIZE * BLOCK_SIZE);
        if take == 0 {
            break;
        }
        pieces.push(take);
        left -= take;
    }
    (pieces, left)
}
