// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Public data, monotonic counters and OTP programming. All of these move
//! their payload through a DMA buffer.

use crate::{AssetId, AssetSubcode, CommandToken, DmaAddress, Opcode, ResultToken};

const LENGTH_MASK: u32 = 0x3FF;
const OTP_AAD_WORD: usize = 6;

fn read_into(sub: AssetSubcode, id: AssetId, addr: DmaAddress, len: u32) -> CommandToken {
    let mut t = CommandToken::new(Opcode::AssetManagement, sub as u8);
    t.w[2] = id.get();
    t.w[3] = len;
    t.set_dma_address(4, addr);
    t
}

/// Read a public data object into the buffer at `addr`.
pub fn public_data_read(id: AssetId, addr: DmaAddress, len: u32) -> CommandToken {
    read_into(AssetSubcode::PublicData, id, addr, len)
}

/// Number of bytes written by a public data or counter read.
pub fn parse_read_length(r: &ResultToken) -> u32 {
    r.word(1) & LENGTH_MASK
}

pub fn monotonic_read(id: AssetId, addr: DmaAddress, len: u32) -> CommandToken {
    read_into(AssetSubcode::MonotonicRead, id, addr, len)
}

pub fn monotonic_increment(id: AssetId) -> CommandToken {
    let mut t = CommandToken::new(Opcode::AssetManagement, AssetSubcode::MonotonicIncrement as u8);
    t.w[2] = id.get();
    t
}

/// Program a static asset into OTP. `policy` carries the V2 policy flags
/// that fit in one word, the asset number goes into bits 1..=7 next to
/// them. The AAD is copied into the token and truncated to what fits.
pub fn otp_data_write(
    asset_number: u8,
    policy: u32,
    input: DmaAddress,
    len: u32,
    aad: &[u8],
) -> CommandToken {
    let mut t = CommandToken::new(Opcode::AssetManagement, AssetSubcode::OtpDataWrite as u8);
    t.w[2] = policy | (u32::from(asset_number) & 0x7F) << 1;
    t.set_dma_address(4, input);
    let n = t.write_bytes(OTP_AAD_WORD, aad) as u32;
    t.w[3] = (len & LENGTH_MASK) | (n & LENGTH_MASK) << 16;
    t
}
