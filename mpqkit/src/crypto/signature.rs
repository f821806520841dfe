//! RSA verification of weak (MD5) and strong (SHA-1) archive signatures
//!
//! Only verification is supported: creating a signature needs Blizzard's
//! private keys.

use crate::{Error, Result};
use num_bigint::BigUint;
use num_traits::{Num, Zero};

/// Blizzard weak signature public key modulus (512-bit)
pub const BLIZZARD_WEAK_PUBLIC_KEY_N: &str =
    "92627704BFB882CC0523B90CB1AC0459272175968D025EDA47DD7C49371BF8FAEB0E0A92167557AD51B78CCB68C5426290EE9FB14BC118E430349EA4ED6AD837";

/// Blizzard strong signature public key modulus (2048-bit)
pub const BLIZZARD_STRONG_PUBLIC_KEY_N: &str =
    "B1067ECE24F687C87E27F88C42981DB47D47689CCE044DDA823538C8C3DCAE2C5A3CE668038B7C6F07DECBBA9CCDF5B2C28718A37A657B2B4517E22E0F81C3165F4E5CDD52172BA94A0331D441999606C50289A76EAF4C409C8CA90B4C8510231608384E7752ED835BF893120042A991736A636F27FC45411C3E53B0CB9508BE7BF6021E9DBAFAD5D23DD830C4772EFDD08CC81B454A58B87F28E4DC4C97E60ECFFB1D04E41A8B955BE594B1F7A4BAA350A3B343F4306784B8CB8E9B71785136019A98700D5AA374BD2CDDC62F5B569555C5217F5CEDF5AA6954D0959DA836C23F011540A4E2B782B360AAFC07E98A156155E3349128E6C409B0FB1D57F86477";

/// Public exponent shared by both keys
pub const BLIZZARD_PUBLIC_EXPONENT: u32 = 0x10001;

/// DER prefix of an MD5 DigestInfo
const MD5_DIGEST_INFO: [u8; 18] = [
    0x30, 0x20, 0x30, 0x0C, 0x06, 0x08, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x02, 0x05, 0x05,
    0x00, 0x04, 0x10,
];

/// An RSA public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    n: BigUint,
    e: BigUint,
}

impl PublicKey {
    /// Build a key from a hex modulus and an exponent
    pub fn from_hex(modulus: &str, exponent: u32) -> Result<Self> {
        let n = BigUint::from_str_radix(modulus, 16)
            .map_err(|e| Error::signature(format!("invalid key modulus: {}", e)))?;
        if n.is_zero() {
            return Err(Error::signature("key modulus is zero"));
        }
        Ok(Self {
            n,
            e: BigUint::from(exponent),
        })
    }

    /// Blizzard's 512-bit weak signature key
    pub fn blizzard_weak() -> Result<Self> {
        Self::from_hex(BLIZZARD_WEAK_PUBLIC_KEY_N, BLIZZARD_PUBLIC_EXPONENT)
    }

    /// Blizzard's 2048-bit strong signature key
    pub fn blizzard_strong() -> Result<Self> {
        Self::from_hex(BLIZZARD_STRONG_PUBLIC_KEY_N, BLIZZARD_PUBLIC_EXPONENT)
    }

    /// Modulus length in bytes
    pub fn size(&self) -> usize {
        ((self.n.bits() + 7) / 8) as usize
    }

    /// Raw RSA public operation on a little-endian signature.
    ///
    /// The result is big-endian and left-padded to the modulus length.
    pub fn apply(&self, signature_le: &[u8]) -> Result<Vec<u8>> {
        let s = BigUint::from_bytes_le(signature_le);
        if s >= self.n {
            return Err(Error::signature("signature value exceeds modulus"));
        }
        let m = s.modpow(&self.e, &self.n).to_bytes_be();
        let mut padded = vec![0u8; self.size().saturating_sub(m.len())];
        padded.extend_from_slice(&m);
        Ok(padded)
    }
}

/// Check a weak signature against the archive's MD5 digest
pub fn verify_weak(key: &PublicKey, signature_le: &[u8], md5_digest: &[u8; 16]) -> Result<bool> {
    let decrypted = key.apply(signature_le)?;
    Ok(check_pkcs1_md5(&decrypted, md5_digest))
}

/// Check a strong signature against the archive's SHA-1 digest
pub fn verify_strong(
    key: &PublicKey,
    signature_le: &[u8],
    sha1_digest: &[u8; 20],
) -> Result<bool> {
    let decrypted = key.apply(signature_le)?;
    Ok(check_strong_padding(&decrypted, sha1_digest))
}

/// `00 01 FF.. 00 DigestInfo(MD5) digest`
fn check_pkcs1_md5(decrypted: &[u8], digest: &[u8]) -> bool {
    let tail = MD5_DIGEST_INFO.len() + digest.len();
    if decrypted.len() < 11 + tail || decrypted[0] != 0x00 || decrypted[1] != 0x01 {
        return false;
    }

    let separator = decrypted.len() - tail - 1;
    if decrypted[2..separator].iter().any(|&b| b != 0xFF) || decrypted[separator] != 0x00 {
        return false;
    }

    let info = &decrypted[separator + 1..separator + 1 + MD5_DIGEST_INFO.len()];
    info == MD5_DIGEST_INFO && &decrypted[decrypted.len() - digest.len()..] == digest
}

/// `0B BB*235 sha1`, with the digest stored reversed relative to the
/// little-endian signature
fn check_strong_padding(decrypted: &[u8], digest: &[u8]) -> bool {
    if decrypted.len() != 256 {
        return false;
    }

    let (head, hash) = decrypted.split_at(256 - digest.len());
    if head[0] != 0x0B || head[1..].iter().any(|&b| b != 0xBB) {
        log::debug!("strong signature padding mismatch");
        return false;
    }

    if hash == digest {
        return true;
    }

    let reversed: Vec<u8> = hash.iter().rev().copied().collect();
    reversed == digest
}
