//! Archive signatures: the weak `(signature)` file and the strong `NGIS` tail

use crate::crypto::signature::{verify_strong, verify_weak, PublicKey};
use crate::{signatures, Error, Result};
use md5::Md5;
use sha1::{Digest, Sha1};
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;

/// Name of the weak signature file inside an archive
pub const SIGNATURE_NAME: &str = "(signature)";

/// Size of the `(signature)` file: 8 zero bytes and the signature
pub const WEAK_SIGNATURE_FILE_SIZE: usize = 72;

/// Size of a weak (RSA-512) signature
pub const WEAK_SIGNATURE_SIZE: usize = 64;

/// Size of a strong (RSA-2048) signature, without its magic
pub const STRONG_SIGNATURE_SIZE: usize = 256;

const DIGEST_CHUNK: usize = 0x10000;

/// Outcome of signature verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// No signature present
    Unsigned,
    /// Weak signature matches
    WeakValid,
    /// Weak signature present but does not match
    WeakInvalid,
    /// Strong signature matches
    StrongValid,
    /// Strong signature present but does not match
    StrongInvalid,
}

impl SignatureStatus {
    /// Whether a present signature verified
    pub fn is_valid(self) -> bool {
        matches!(self, SignatureStatus::WeakValid | SignatureStatus::StrongValid)
    }
}

/// The content of a `(signature)` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeakSignature {
    signature: [u8; WEAK_SIGNATURE_SIZE],
}

impl WeakSignature {
    /// Parse the 72-byte `(signature)` file
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != WEAK_SIGNATURE_FILE_SIZE {
            return Err(Error::signature(format!(
                "(signature) is {} bytes, expected {}",
                data.len(),
                WEAK_SIGNATURE_FILE_SIZE
            )));
        }
        if data[..8].iter().any(|&b| b != 0) {
            log::warn!("(signature) has non-zero leading bytes");
        }
        let mut signature = [0u8; WEAK_SIGNATURE_SIZE];
        signature.copy_from_slice(&data[8..]);
        Ok(Self { signature })
    }

    /// Signature bytes, little-endian
    pub fn as_bytes(&self) -> &[u8] {
        &self.signature
    }

    /// Verify against the archive digest
    pub fn verify(&self, key: &PublicKey, md5_digest: &[u8; 16]) -> Result<bool> {
        verify_weak(key, &self.signature, md5_digest)
    }
}

/// A strong signature found after the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrongSignature {
    signature: Vec<u8>,
}

impl StrongSignature {
    /// Parse `NGIS` followed by 256 signature bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let magic = &signatures::STRONG_SIGNATURE;
        if data.len() != magic.len() + STRONG_SIGNATURE_SIZE || !data.starts_with(magic) {
            return Err(Error::signature("not a strong signature block"));
        }
        Ok(Self {
            signature: data[magic.len()..].to_vec(),
        })
    }

    /// Look for a strong signature at absolute position `pos`
    pub fn read_at<R: Read + Seek>(reader: &mut R, pos: u64) -> Result<Option<Self>> {
        let stream_len = reader.seek(SeekFrom::End(0))?;
        let needed = (signatures::STRONG_SIGNATURE.len() + STRONG_SIGNATURE_SIZE) as u64;
        if stream_len < pos + needed {
            return Ok(None);
        }

        let mut block = vec![0u8; needed as usize];
        reader.seek(SeekFrom::Start(pos))?;
        reader.read_exact(&mut block)?;
        if !block.starts_with(&signatures::STRONG_SIGNATURE) {
            return Ok(None);
        }

        log::debug!("found strong signature at {:#x}", pos);
        Self::parse(&block).map(Some)
    }

    /// Signature bytes, little-endian
    pub fn as_bytes(&self) -> &[u8] {
        &self.signature
    }

    /// Verify against the archive digest
    pub fn verify(&self, key: &PublicKey, sha1_digest: &[u8; 20]) -> Result<bool> {
        verify_strong(key, &self.signature, sha1_digest)
    }
}

fn digest_range<R, D>(reader: &mut R, range: Range<u64>, zeroed: Option<Range<u64>>) -> Result<D>
where
    R: Read + Seek,
    D: Digest,
{
    let mut hasher = D::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK];
    let mut pos = range.start;
    reader.seek(SeekFrom::Start(pos))?;

    while pos < range.end {
        let len = ((range.end - pos) as usize).min(DIGEST_CHUNK);
        let chunk = &mut buffer[..len];
        reader.read_exact(chunk)?;

        if let Some(zeroed) = &zeroed {
            let start = zeroed.start.max(pos);
            let end = zeroed.end.min(pos + len as u64);
            if start < end {
                chunk[(start - pos) as usize..(end - pos) as usize].fill(0);
            }
        }

        hasher.update(&*chunk);
        pos += len as u64;
    }

    Ok(hasher)
}

/// MD5 over `range` with the signature block's bytes zeroed
pub fn weak_digest<R: Read + Seek>(
    reader: &mut R,
    range: Range<u64>,
    signature_block: Range<u64>,
) -> Result<[u8; 16]> {
    let hasher: Md5 = digest_range(reader, range, Some(signature_block))?;
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// SHA-1 over `range`
pub fn strong_digest<R: Read + Seek>(reader: &mut R, range: Range<u64>) -> Result<[u8; 20]> {
    let hasher: Sha1 = digest_range(reader, range, None)?;
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}
