// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! System tokens: information, self-test, login, reset and friends.

use crate::{CommandToken, Opcode, ResultToken, SystemSubcode};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::Serialize;

fn system(sub: SystemSubcode) -> CommandToken {
    CommandToken::new(Opcode::System, sub as u8)
}

pub fn system_info() -> CommandToken {
    system(SystemSubcode::SystemInfo)
}

pub fn self_test() -> CommandToken {
    system(SystemSubcode::SelfTest)
}

/// Log the identity in word 1 in to the firmware. Older firmware answers
/// this with "invalid token".
pub fn login() -> CommandToken {
    system(SystemSubcode::Login)
}

pub fn reset() -> CommandToken {
    system(SystemSubcode::Reset)
}

pub fn sleep() -> CommandToken {
    system(SystemSubcode::Sleep)
}

pub fn resume_from_sleep() -> CommandToken {
    system(SystemSubcode::ResumeFromSleep)
}

/// Set the engine's notion of time, in seconds, used for asset lifetimes.
pub fn set_time(seconds: u32) -> CommandToken {
    let mut t = system(SystemSubcode::SetTime);
    t.w[2] = seconds;
    t
}

/// Define the four user identities allowed to use the engine in FIPS mode.
pub fn define_users(users: [u32; 4]) -> CommandToken {
    let mut t = system(SystemSubcode::DefineUsers);
    t.w[2..6].copy_from_slice(&users);
    t
}

/// State of the OTP scan reported by system info.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize)]
pub enum OtpState {
    Ok = 0,
    ProtectedAssetReplaced = 1,
    ProtectedAssetRemoved = 2,
    PrematureEnd = 3,
    ProgrammedBitMismatch = 4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl VersionInfo {
    fn from_word(w: u32) -> VersionInfo {
        VersionInfo {
            major: (w >> 16) as u8,
            minor: (w >> 8) as u8,
            patch: w as u8,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub firmware: VersionInfo,
    pub test_firmware: bool,
    pub hardware: VersionInfo,
    pub memory_size: u16,
    pub host_id: u8,
    /// The token arrived over a non-secure bus connection.
    pub non_secure: bool,
    pub identity: u32,
    /// Raw OTP error code, see [`SystemInfo::otp_state`].
    pub otp_error_code: u8,
    pub otp_error_location: u16,
}

impl SystemInfo {
    pub fn parse(r: &ResultToken) -> SystemInfo {
        let w3 = r.word(3);
        let w5 = r.word(5);
        SystemInfo {
            firmware: VersionInfo::from_word(r.word(1)),
            test_firmware: r.word(1) & (1 << 31) != 0,
            hardware: VersionInfo::from_word(r.word(2)),
            memory_size: w3 as u16,
            host_id: ((w3 >> 16) & 0x7) as u8,
            non_secure: w3 & (1 << 19) != 0,
            identity: r.word(4),
            otp_error_code: ((w5 >> 12) & 0xF) as u8,
            otp_error_location: (w5 & 0xFFF) as u16,
        }
    }

    /// `None` for codes newer than this crate.
    pub fn otp_state(&self) -> Option<OtpState> {
        OtpState::from_u8(self.otp_error_code)
    }
}
