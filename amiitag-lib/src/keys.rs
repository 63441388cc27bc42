//! Master key material.
//!
//! The retail key file is 160 bytes: the "unfixed infos" data key followed by
//! the "locked secret" tag key, 80 bytes each. Its contents are opaque to this
//! crate beyond the structure below.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tracing::info;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of one master key
pub const MASTER_KEY_SIZE: usize = 80;

/// Size of the combined key file
pub const KEY_FILE_SIZE: usize = 2 * MASTER_KEY_SIZE;

/// One 80-byte master key (layout fixed by the key file format).
#[derive(Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Zeroize, ZeroizeOnDrop)]
#[repr(C)]
pub struct MasterKey {
    /// Key for the HMAC-DRBG
    pub hmac_key: [u8; 16],
    /// NUL-terminated type string
    pub type_string: [u8; 14],
    pub rfu: u8,
    /// Number of valid bytes in `magic_bytes` (at most 16)
    pub magic_size: u8,
    pub magic_bytes: [u8; 16],
    /// XOR'd over the salt half of the seed
    pub xor_pad: [u8; 32],
}

impl MasterKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key = Self::read_from_bytes(bytes)
            .map_err(|_| Error::InvalidKeyFile(format!("master key must be {MASTER_KEY_SIZE} bytes")))?;
        if key.magic_size as usize > key.magic_bytes.len() {
            return Err(Error::InvalidKeyFile(format!("magic size {} exceeds 16", key.magic_size)));
        }
        Ok(key)
    }

    /// Type string up to and including its terminating NUL, or all 14 bytes if unterminated.
    pub fn type_prefix(&self) -> &[u8] {
        match self.type_string.iter().position(|&b| b == 0) {
            Some(nul) => &self.type_string[..=nul],
            None => &self.type_string,
        }
    }

    pub fn name(&self) -> String {
        let s = self.type_prefix();
        String::from_utf8_lossy(s.strip_suffix(&[0]).unwrap_or(s)).into_owned()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("type", &self.name())
            .field("magic_size", &self.magic_size)
            .finish_non_exhaustive()
    }
}

/// Both master keys needed to decrypt and sign a figure.
#[derive(Clone, Debug)]
pub struct KeySet {
    /// "unfixed infos": encrypts the payload and signs the data HMAC
    pub data: MasterKey,
    /// "locked secret": signs the tag HMAC
    pub tag: MasterKey,
}

impl KeySet {
    /// Structural checks only; use [`KeySet::load_verified`] for untrusted files.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_FILE_SIZE {
            return Err(Error::InvalidKeyFile(format!(
                "expected {KEY_FILE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            data: MasterKey::from_slice(&bytes[..MASTER_KEY_SIZE])?,
            tag: MasterKey::from_slice(&bytes[MASTER_KEY_SIZE..])?,
        })
    }

    /// Accept the file only if its SHA-256 matches `expected_sha256`.
    pub fn load_verified(bytes: &[u8], expected_sha256: &[u8; 32]) -> Result<Self> {
        let actual: [u8; 32] = Sha256::digest(bytes).into();
        if &actual != expected_sha256 {
            return Err(Error::KeyDigestMismatch {
                expected: hex::encode(expected_sha256),
                actual: hex::encode(actual),
            });
        }
        Self::from_bytes(bytes)
    }

    pub fn from_file(path: impl AsRef<Path>, expected_sha256: Option<&[u8; 32]>) -> Result<Self> {
        let path = path.as_ref();
        let mut bytes = std::fs::read(path)?;
        let keys = match expected_sha256 {
            Some(digest) => Self::load_verified(&bytes, digest),
            None => Self::from_bytes(&bytes),
        };
        bytes.zeroize();
        let keys = keys?;
        info!("Loaded key file {}", path.display());
        Ok(keys)
    }

    /// The 160-byte file layout, as uploaded to devices.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_FILE_SIZE);
        out.extend_from_slice(self.data.as_bytes());
        out.extend_from_slice(self.tag.as_bytes());
        out
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
