// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use thiserror::Error;

/// The one warning the firmware is documented to return.
pub const WARNING_Z1_USED: i32 = 16;

/// An error returned by the engine in a result token.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Codes we have names for.
    #[error(transparent)]
    Known(#[from] ResultCode),

    /// Anything else, kept as the raw (negative) value. Bus errors land here
    /// (-32 ..= -63) as do TRNG failures we have not named.
    #[error("engine returned error {0}")]
    Unknown(i32),
}

impl TokenError {
    pub fn from_code(code: i32) -> TokenError {
        match ResultCode::from_i32(code) {
            Some(e) => TokenError::Known(e),
            None => TokenError::Unknown(code),
        }
    }

    /// The raw result code, whether or not we know its name.
    pub fn code(&self) -> i32 {
        match self {
            TokenError::Known(e) => *e as i32,
            TokenError::Unknown(c) => *c,
        }
    }

    pub fn is(&self, code: ResultCode) -> bool {
        matches!(self, TokenError::Known(e) if *e == code)
    }
}

/// Error codes of the firmware, in its own numbering.
#[repr(i32)]
#[derive(Debug, FromPrimitive, Copy, Clone, Eq, PartialEq, ToPrimitive, Error)]
pub enum ResultCode {
    #[error("Invalid token (err -1)")]
    InvalidToken = -1,
    #[error("Invalid parameter (err -2)")]
    InvalidParameter = -2,
    #[error("Invalid key size (err -3)")]
    InvalidKeysize = -3,
    #[error("Invalid length (err -4)")]
    InvalidLength = -4,
    #[error("Invalid location (err -5)")]
    InvalidLocation = -5,
    #[error("Clock error (err -6)")]
    ClockError = -6,
    #[error("Access error (err -7)")]
    AccessError = -7,
    #[error("Unwrap error (err -10)")]
    UnwrapError = -10,
    #[error("Data overrun (err -11)")]
    DataOverrun = -11,
    #[error("Asset checksum error (err -12)")]
    AssetChecksum = -12,
    #[error("Invalid asset (err -13)")]
    InvalidAsset = -13,
    #[error("Asset store full (err -14)")]
    FullError = -14,
    #[error("Invalid address (err -15)")]
    InvalidAddress = -15,
    #[error("Invalid modulus (err -17)")]
    InvalidModulus = -17,
    #[error("Verification failed (err -18)")]
    VerifyError = -18,
    #[error("Invalid state (err -19)")]
    InvalidState = -19,
    #[error("OTP write error (err -20)")]
    OtpWriteError = -20,
    #[error("Asset lifetime expired (err -21)")]
    AssetExpired = -21,
    #[error("Coprocessor interface error (err -22)")]
    CoprocessorIfError = -22,
    #[error("Firmware panic (err -31)")]
    Panic = -31,
    #[error("Too many FROs shut down (err -65)")]
    TrngShutdown = -65,
    #[error("DRBG stuck (err -66)")]
    DrbgStuck = -66,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_codes() {
        assert_eq!(
            TokenError::from_code(-18),
            TokenError::Known(ResultCode::VerifyError)
        );
        assert_eq!(TokenError::from_code(-40), TokenError::Unknown(-40));
        assert_eq!(TokenError::from_code(-66).code(), -66);
        assert!(TokenError::from_code(-13).is(ResultCode::InvalidAsset));
        assert!(!TokenError::from_code(-40).is(ResultCode::InvalidAsset));
    }

    #[test]
    fn messages_carry_the_number() {
        let e = TokenError::from_code(-7);
        assert_eq!(e.to_string(), "Access error (err -7)");
        assert_eq!(
            TokenError::from_code(-99).to_string(),
            "engine returned error -99"
        );
    }
}
