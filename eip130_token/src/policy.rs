// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asset policies.
//!
//! Firmware before the 2.x asset store used a flat bitmask where every bit
//! is one permission (`PolicyV1`). Newer firmware packs a family, a usage
//! field and algorithm fields into the same 64 bits (`PolicyV2`). Which one
//! a device speaks is a property of its firmware and is picked by
//! configuration.

use crate::pk::RsaPadding;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use strum::IntoEnumIterator;
use strum_macros::{EnumIter, IntoStaticStr};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum PolicyVersion {
    V1,
    #[default]
    V2,
}

impl PolicyVersion {
    /// Highest static asset index `search` accepts.
    pub fn max_search_index(self) -> u32 {
        match self {
            PolicyVersion::V1 => 62,
            PolicyVersion::V2 => 126,
        }
    }

    pub fn search_index_mask(self) -> u32 {
        match self {
            PolicyVersion::V1 => 0x3F,
            PolicyVersion::V2 => 0xFF,
        }
    }

    pub fn decode(self, bits: u64) -> Box<dyn AssetPolicy> {
        match self {
            PolicyVersion::V1 => Box::new(PolicyV1(bits)),
            PolicyVersion::V2 => Box::new(PolicyV2(bits)),
        }
    }

    /// Policy of an RSA public key asset used to verify SHA-256 signatures.
    pub fn rsa_verify_key(self, padding: RsaPadding, non_secure: bool) -> u64 {
        match self {
            PolicyVersion::V1 => {
                let scheme = match padding {
                    RsaPadding::Pkcs1v15 => PolicyV1::PK_RSA_PKCS1_SIGN,
                    RsaPadding::Pss => PolicyV1::PK_RSA_PSS_SIGN,
                };
                (scheme | PolicyV1::PUBLIC_KEY | PolicyV1::SHA256).bits()
            }
            PolicyVersion::V2 => {
                let scheme = match padding {
                    RsaPadding::Pkcs1v15 => PolicyV2::ACA_RSAPKCS1V15,
                    RsaPadding::Pss => PolicyV2::ACA_RSAPSS,
                };
                let mut p = PolicyV2::ASYM_SIGNVERIFY | scheme | PolicyV2::ACH_SHA256;
                if non_secure {
                    p = p | PolicyV2::SOURCENONSECURE;
                }
                p.bits()
            }
        }
    }
}

impl PolicyVersion {
    /// Policy of the asset carrying a SHA-256 state between hash tokens.
    pub fn temp_hash_state(self) -> u64 {
        match self {
            PolicyVersion::V1 => (PolicyV1::TEMP_MAC | PolicyV1::SHA256).bits(),
            PolicyVersion::V2 => {
                (PolicyV2::SYM_TEMP | PolicyV2::SCUIHASH | PolicyV2::SCAHSHA256).bits()
            }
        }
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyVersion::V1 => write!(f, "v1"),
            PolicyVersion::V2 => write!(f, "v2"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, IntoStaticStr)]
pub enum Family {
    GeneralData,
    Symmetric,
    Asymmetric,
    Coprocessor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, IntoStaticStr)]
pub enum Direction {
    EncryptGenerate,
    DecryptVerify,
    Both,
}

/// Questions the driver and the tool ask of a policy, whichever encoding it
/// uses.
pub trait AssetPolicy: fmt::Debug {
    fn version(&self) -> PolicyVersion;

    fn bits(&self) -> u64;

    fn family(&self) -> Family;

    /// `None` when the policy does not restrict the direction.
    fn direction(&self) -> Option<Direction>;

    fn is_exportable(&self) -> bool;

    fn is_temporary(&self) -> bool;

    fn is_non_modifiable(&self) -> bool;

    fn is_public_data(&self) -> bool;

    /// Names of the set flags and decoded fields, for humans.
    fn flag_names(&self) -> Vec<&'static str>;
}

macro_rules! policy_consts {
    ($ty:ident { $($name:ident = $val:expr,)* }) => {
        impl $ty {
            $(pub const $name: $ty = $ty($val);)*
        }
    };
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PolicyV2(pub u64);

policy_consts!(PolicyV2 {
    NONMODIFIABLE = 0x1,
    TEMPORARY = 0x2,
    EXPORTABLE = 0x4,
    TRUSTEXPORT = 0x8,
    SOURCENONSECURE = 0x100,
    CROSSDOMAIN = 0x200,
    NODOMAIN = 0x400,
    PRIVATEDATA = 0x800,
    FIPSAPPROVED = 0x1000,
    SYMCRYPTO = 0x2000,
    ASYMCRYPTO = 0x4000,
    COPROIFC = 0x6000,
    GDCOID = 0x1_0000,
    SCUIHASH = 0,
    SCUIMACHASH = 0x1_0000,
    SCUIMACCIPHER = 0x2_0000,
    SCUICIPHERBULK = 0x3_0000,
    SCUICIPHERAUTH = 0x4_0000,
    SCUIWRAP = 0x5_0000,
    SCUIDERIVE = 0x6_0000,
    SCDIRENCGEN = 0x10_0000,
    SCDIRDECVRFY = 0x20_0000,
    SCDIRENCDEC = 0x30_0000,
    SCACAES = 0,
    SCAHSHA256 = 0x140_0000,
    ACUI_SIGNVRFY = 0,
    ACUI_KEYEXCH = 0x1_0000,
    ACUI_DECENC = 0x2_0000,
    ACUI_PARAMETERS = 0xF_0000,
    ACA_ECDSA = 0x30_0000,
    ACA_RSAPKCS1V15 = 0x80_0000,
    ACA_RSAPSS = 0x90_0000,
    ACH_SHA256 = 0x2800_0000,
    SYM_BASE = 0x1 | 0x800 | 0x2000,
    SYM_TEMP = 0x2 | 0x800 | 0x2000,
    SYM_BULK_AES = 0x1 | 0x800 | 0x2000 | 0x3_0000,
    SYM_WRAP = 0x1 | 0x800 | 0x2000 | 0x5_0000,
    SYM_DERIVE = 0x1 | 0x800 | 0x2000 | 0x6_0000,
    ASYM_BASE = 0x1 | 0x4000,
    ASYM_SIGNVERIFY = 0x1 | 0x4000,
    ASYM_KEYPARAMS = 0x1 | 0x4000 | 0x400 | 0xF_0000,
});

const V2_FAMILY_MASK: u64 = 0x6000;
const V2_USAGE_SHIFT: u32 = 16;
const V2_DIRECTION_SHIFT: u32 = 20;
const V2_ALGORITHM_SHIFT: u32 = 20;
const V2_HASH_SHIFT: u32 = 27;

/// The single-bit flags every V2 policy may carry.
#[repr(u64)]
#[derive(Copy, Clone, Debug, EnumIter, IntoStaticStr)]
enum V2Flag {
    NonModifiable = 0x1,
    Temporary = 0x2,
    Exportable = 0x4,
    TrustedExport = 0x8,
    SourceNonSecure = 0x100,
    CrossDomain = 0x200,
    NoDomain = 0x400,
    PrivateData = 0x800,
    FipsApproved = 0x1000,
}

#[derive(Copy, Clone, Debug, FromPrimitive, IntoStaticStr)]
enum SymUsage {
    Hash = 0,
    MacHash = 1,
    MacCipher = 2,
    CipherBulk = 3,
    CipherAuth = 4,
    Wrap = 5,
    Derive = 6,
    EmmcAuth = 0xF,
}

#[derive(Copy, Clone, Debug, FromPrimitive, IntoStaticStr)]
enum AsymUsage {
    SignVerify = 0,
    KeyExchange = 1,
    DecryptEncrypt = 2,
    SecureDebug = 3,
    SecureDebugGpio = 0xB,
    Parameters = 0xF,
}

#[derive(Copy, Clone, Debug, FromPrimitive, IntoStaticStr)]
enum AsymAlgorithm {
    Dh = 0,
    Dsa = 1,
    Ecdh = 2,
    Ecdsa = 3,
    Curve25519 = 4,
    EdDsa = 5,
    Sm2 = 6,
    EccElGamal = 7,
    RsaPkcs1v15 = 8,
    RsaPss = 9,
    RsaOaep = 10,
    RsaKem = 11,
}

#[derive(Copy, Clone, Debug, FromPrimitive, IntoStaticStr)]
enum AsymHash {
    NoHash = 0,
    Sha1 = 1,
    Sm3 = 2,
    Sha224 = 4,
    Sha256 = 5,
    Sha384 = 6,
    Sha512 = 7,
    Sha3_224 = 8,
    Sha3_256 = 9,
    Sha3_384 = 10,
    Sha3_512 = 11,
}

impl PolicyV2 {
    pub fn bits(self) -> u64 {
        self.0
    }

    fn field(self, shift: u32, mask: u64) -> u64 {
        (self.0 >> shift) & mask
    }
}

impl BitOr for PolicyV2 {
    type Output = PolicyV2;

    fn bitor(self, rhs: PolicyV2) -> PolicyV2 {
        PolicyV2(self.0 | rhs.0)
    }
}

impl AssetPolicy for PolicyV2 {
    fn version(&self) -> PolicyVersion {
        PolicyVersion::V2
    }

    fn bits(&self) -> u64 {
        self.0
    }

    fn family(&self) -> Family {
        match self.0 & V2_FAMILY_MASK {
            0x2000 => Family::Symmetric,
            0x4000 => Family::Asymmetric,
            0x6000 => Family::Coprocessor,
            _ => Family::GeneralData,
        }
    }

    fn direction(&self) -> Option<Direction> {
        // Only symmetric keys have a direction field, asymmetric keys reuse
        // these bits for the algorithm.
        if self.family() != Family::Symmetric {
            return None;
        }
        match self.field(V2_DIRECTION_SHIFT, 0x3) {
            1 => Some(Direction::EncryptGenerate),
            2 => Some(Direction::DecryptVerify),
            3 => Some(Direction::Both),
            _ => None,
        }
    }

    fn is_exportable(&self) -> bool {
        self.0 & (Self::EXPORTABLE.0 | Self::TRUSTEXPORT.0) != 0
    }

    fn is_temporary(&self) -> bool {
        self.0 & Self::TEMPORARY.0 != 0
    }

    fn is_non_modifiable(&self) -> bool {
        self.0 & Self::NONMODIFIABLE.0 != 0
    }

    fn is_public_data(&self) -> bool {
        self.family() == Family::GeneralData && self.0 & Self::PRIVATEDATA.0 == 0
    }

    fn flag_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = V2Flag::iter()
            .filter(|f| self.0 & (*f as u64) != 0)
            .map(<&'static str>::from)
            .collect();
        names.push(self.family().into());
        let usage = self.field(V2_USAGE_SHIFT, 0xF);
        match self.family() {
            Family::Symmetric => {
                if let Some(u) = SymUsage::from_u64(usage) {
                    names.push(u.into());
                }
                if let Some(d) = self.direction() {
                    names.push(d.into());
                }
            }
            Family::Asymmetric => {
                if let Some(u) = AsymUsage::from_u64(usage) {
                    names.push(u.into());
                }
                if let Some(a) = AsymAlgorithm::from_u64(self.field(V2_ALGORITHM_SHIFT, 0xF)) {
                    names.push(a.into());
                }
                if let Some(h) = AsymHash::from_u64(self.field(V2_HASH_SHIFT, 0xF)) {
                    names.push(h.into());
                }
            }
            Family::GeneralData | Family::Coprocessor => {}
        }
        names
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PolicyV1(pub u64);

/// Every bit of a V1 policy is an independent permission.
#[repr(u64)]
#[derive(Copy, Clone, Debug, EnumIter, IntoStaticStr)]
enum V1Flag {
    Sha1 = 0x1,
    Sha224 = 0x2,
    Sha256 = 0x4,
    Sha384 = 0x8,
    Sha512 = 0x10,
    Cmac = 0x20,
    Aes = 0x100,
    TripleDes = 0x200,
    Mode1 = 0x1_0000,
    Mode2 = 0x2_0000,
    Mode3 = 0x4_0000,
    Mode4 = 0x8_0000,
    MacGenerate = 0x400_0000,
    MacVerify = 0x800_0000,
    Encrypt = 0x1000_0000,
    Decrypt = 0x2000_0000,
    PublicKey = 0x8000_0000,
    Monotonic = 0x1_0000_0000,
    TrustedRootKey = 0x2_0000_0000,
    TrustedKeyDerive = 0x4_0000_0000,
    KeyDerive = 0x8_0000_0000,
    TrustedWrap = 0x10_0000_0000,
    AesWrap = 0x20_0000_0000,
    PkRsaOaepWrap = 0x40_0000_0000,
    PkRsaPkcs1Wrap = 0x100_0000_0000,
    PkRsaPkcs1Sign = 0x200_0000_0000,
    PkRsaPssSign = 0x400_0000_0000,
    PkDsaSign = 0x800_0000_0000,
    PkEcdsaSign = 0x1000_0000_0000,
    PkDhKey = 0x2000_0000_0000,
    PkEcdhKey = 0x4000_0000_0000,
    PublicKeyParam = 0x8000_0000_0000,
    TempIv = 0x1_0000_0000_0000,
    TempCounter = 0x2_0000_0000_0000,
    TempMac = 0x4_0000_0000_0000,
    SourceNonSecure = 0x0100_0000_0000_0000,
    CrossDomain = 0x0200_0000_0000_0000,
    PrivateData = 0x0800_0000_0000_0000,
    PublicData = 0x1000_0000_0000_0000,
    Export = 0x2000_0000_0000_0000,
    TrustedExport = 0x4000_0000_0000_0000,
    AuthKey = 0x8000_0000_0000_0000,
}

policy_consts!(PolicyV1 {
    SHA1 = 0x1,
    SHA224 = 0x2,
    SHA256 = 0x4,
    SHA384 = 0x8,
    SHA512 = 0x10,
    CMAC = 0x20,
    AES = 0x100,
    TDES = 0x200,
    MODE1 = 0x1_0000,
    MAC_GENERATE = 0x400_0000,
    MAC_VERIFY = 0x800_0000,
    ENCRYPT = 0x1000_0000,
    DECRYPT = 0x2000_0000,
    PUBLIC_KEY = 0x8000_0000,
    MONOTONIC = 0x1_0000_0000,
    TRUSTED_ROOT_KEY = 0x2_0000_0000,
    TRUSTED_KEY_DERIVE = 0x4_0000_0000,
    KEY_DERIVE = 0x8_0000_0000,
    TRUSTED_WRAP = 0x10_0000_0000,
    AES_WRAP = 0x20_0000_0000,
    PK_RSA_OAEP_WRAP = 0x40_0000_0000,
    PK_RSA_PKCS1_WRAP = 0x100_0000_0000,
    PK_RSA_PKCS1_SIGN = 0x200_0000_0000,
    PK_RSA_PSS_SIGN = 0x400_0000_0000,
    PK_DSA_SIGN = 0x800_0000_0000,
    PK_ECC_ECDSA_SIGN = 0x1000_0000_0000,
    PK_DH_KEY = 0x2000_0000_0000,
    PK_ECDH_KEY = 0x4000_0000_0000,
    PUBLIC_KEY_PARAM = 0x8000_0000_0000,
    TEMP_IV = 0x1_0000_0000_0000,
    TEMP_COUNTER = 0x2_0000_0000_0000,
    TEMP_MAC = 0x4_0000_0000_0000,
    SOURCE_NON_SECURE = 0x0100_0000_0000_0000,
    CROSS_DOMAIN = 0x0200_0000_0000_0000,
    PRIVATE_DATA = 0x0800_0000_0000_0000,
    PUBLIC_DATA = 0x1000_0000_0000_0000,
    EXPORT = 0x2000_0000_0000_0000,
    TRUSTED_EXPORT = 0x4000_0000_0000_0000,
    AUTH_KEY = 0x8000_0000_0000_0000,
});

const V1_ASYMMETRIC: u64 = 0x8000_0000 | 0xFFC0_0000_0000 | 0x8000_0000_0000;
const V1_SYMMETRIC: u64 = 0x3F | 0x300 | 0xF_0000 | 0x3C00_0000 | 0x3E_0000_0000;

impl PolicyV1 {
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl BitOr for PolicyV1 {
    type Output = PolicyV1;

    fn bitor(self, rhs: PolicyV1) -> PolicyV1 {
        PolicyV1(self.0 | rhs.0)
    }
}

impl AssetPolicy for PolicyV1 {
    fn version(&self) -> PolicyVersion {
        PolicyVersion::V1
    }

    fn bits(&self) -> u64 {
        self.0
    }

    fn family(&self) -> Family {
        if self.0 & V1_ASYMMETRIC != 0 {
            Family::Asymmetric
        } else if self.0 & V1_SYMMETRIC != 0 {
            Family::Symmetric
        } else {
            Family::GeneralData
        }
    }

    fn direction(&self) -> Option<Direction> {
        let enc = Self::ENCRYPT.0 | Self::MAC_GENERATE.0;
        let dec = Self::DECRYPT.0 | Self::MAC_VERIFY.0;
        match (self.0 & enc != 0, self.0 & dec != 0) {
            (true, true) => Some(Direction::Both),
            (true, false) => Some(Direction::EncryptGenerate),
            (false, true) => Some(Direction::DecryptVerify),
            (false, false) => None,
        }
    }

    fn is_exportable(&self) -> bool {
        self.0 & (Self::EXPORT.0 | Self::TRUSTED_EXPORT.0) != 0
    }

    fn is_temporary(&self) -> bool {
        self.0 & (Self::TEMP_IV.0 | Self::TEMP_COUNTER.0 | Self::TEMP_MAC.0) != 0
    }

    // V1 has no notion of modifying an asset after it was loaded
    fn is_non_modifiable(&self) -> bool {
        false
    }

    fn is_public_data(&self) -> bool {
        self.0 & Self::PUBLIC_DATA.0 != 0
    }

    fn flag_names(&self) -> Vec<&'static str> {
        V1Flag::iter()
            .filter(|f| self.0 & (*f as u64) != 0)
            .map(<&'static str>::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_composites() {
        assert_eq!(PolicyV2::SYM_BASE.bits(), 0x2801);
        assert_eq!(PolicyV2::SYM_BULK_AES.bits(), 0x3_2801);
        assert_eq!(
            (PolicyV2::SYM_BASE | PolicyV2::SCUIWRAP).bits(),
            PolicyV2::SYM_WRAP.bits()
        );
        assert_eq!(
            (PolicyV2::SYM_BASE | PolicyV2::SCUIDERIVE).bits(),
            PolicyV2::SYM_DERIVE.bits()
        );
        assert_eq!(PolicyV2::ASYM_KEYPARAMS.bits(), 0xF_4401);
    }

    #[test]
    fn v2_queries() {
        let p = PolicyV2::SYM_BULK_AES | PolicyV2::TEMPORARY | PolicyV2::SCDIRENCDEC;
        assert_eq!(p.family(), Family::Symmetric);
        assert_eq!(p.direction(), Some(Direction::Both));
        assert!(p.is_temporary());
        assert!(p.is_non_modifiable());
        assert!(!p.is_exportable());
        assert!(!p.is_public_data());
        let names = p.flag_names();
        assert!(names.contains(&"Temporary"));
        assert!(names.contains(&"CipherBulk"));
        assert!(names.contains(&"Symmetric"));

        // The asymmetric algorithm field overlaps the symmetric direction
        let key = PolicyV2(PolicyVersion::V2.rsa_verify_key(RsaPadding::Pss, false));
        assert_eq!(key.family(), Family::Asymmetric);
        assert_eq!(key.direction(), None);
        let names = key.flag_names();
        assert!(names.contains(&"RsaPss"));
        assert!(names.contains(&"Sha256"));
        assert!(names.contains(&"SignVerify"));

        assert!(PolicyV2(0).is_public_data());
    }

    #[test]
    fn rsa_key_policies() {
        assert_eq!(
            PolicyVersion::V2.rsa_verify_key(RsaPadding::Pkcs1v15, false),
            0x2880_4001
        );
        assert_eq!(
            PolicyVersion::V2.rsa_verify_key(RsaPadding::Pkcs1v15, true),
            0x2880_4101
        );
        assert_eq!(
            PolicyVersion::V1.rsa_verify_key(RsaPadding::Pkcs1v15, false),
            0x200_8000_0004
        );
        assert_eq!(
            PolicyVersion::V1.rsa_verify_key(RsaPadding::Pss, true),
            0x400_8000_0004
        );
    }

    #[test]
    fn temp_hash_state_policies() {
        let v2 = PolicyV2(PolicyVersion::V2.temp_hash_state());
        assert_eq!(v2.bits(), 0x0140_2802);
        assert!(v2.is_temporary());
        assert_eq!(v2.family(), Family::Symmetric);

        let v1 = PolicyV1(PolicyVersion::V1.temp_hash_state());
        assert_eq!(v1.bits(), 0x4_0000_0000_0004);
        assert!(v1.is_temporary());
    }

    #[test]
    fn v1_queries() {
        let p = PolicyV1::AES | PolicyV1::ENCRYPT | PolicyV1::DECRYPT | PolicyV1::EXPORT;
        assert_eq!(p.family(), Family::Symmetric);
        assert_eq!(p.direction(), Some(Direction::Both));
        assert!(p.is_exportable());
        assert_eq!(p.flag_names(), vec!["Aes", "Encrypt", "Decrypt", "Export"]);

        let p = PolicyV1::PUBLIC_KEY | PolicyV1::PK_RSA_PSS_SIGN | PolicyV1::SHA256;
        assert_eq!(p.family(), Family::Asymmetric);
        assert!(PolicyV1::PUBLIC_DATA.is_public_data());
        assert!(PolicyV1::TEMP_MAC.is_temporary());
    }

    #[test]
    fn search_limits() {
        assert_eq!(PolicyVersion::V1.max_search_index(), 62);
        assert_eq!(PolicyVersion::V2.max_search_index(), 126);
        assert_eq!(PolicyVersion::V1.search_index_mask(), 0x3F);
        assert_eq!(PolicyVersion::V2.decode(0x2801).family(), Family::Symmetric);
        assert_eq!(PolicyVersion::default(), PolicyVersion::V2);
    }
}
