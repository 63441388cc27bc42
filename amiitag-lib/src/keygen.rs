//! Per-tag session key derivation.
//!
//! Session keys are bound to one (uid, write counter, salt) triple. Deriving
//! twice from the same inputs always yields the same keys.

use crate::constants::SALT_LEN;
use crate::error::{Error, Result};
use crate::image::TagImage;
use crate::keys::{KeySet, MasterKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Length of the base seed built from the tag
pub const SEED_SIZE: usize = 64;

/// Bytes produced per master key: AES key, AES IV, HMAC key
const DERIVED_SIZE: usize = 48;

/// The tag fields that feed key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagIdentity {
    pub uid: [u8; 9],
    pub write_counter: [u8; 2],
    pub salt: [u8; SALT_LEN],
}

impl From<&TagImage> for TagIdentity {
    fn from(image: &TagImage) -> Self {
        Self {
            uid: image.uid_bytes(),
            write_counter: image.write_counter_bytes(),
            salt: image.salt(),
        }
    }
}

impl TagIdentity {
    /// `counter[2] | zero[14] | uid[0..8] | uid[0..8] | salt[32]`
    pub fn seed(&self) -> [u8; SEED_SIZE] {
        let mut seed = [0u8; SEED_SIZE];
        seed[0..2].copy_from_slice(&self.write_counter);
        seed[16..24].copy_from_slice(&self.uid[0..8]);
        seed[24..32].copy_from_slice(&self.uid[0..8]);
        seed[32..64].copy_from_slice(&self.salt);
        seed
    }
}

/// Ephemeral keys for one tag identity. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pub cipher_key: [u8; 16],
    pub cipher_iv: [u8; 16],
    /// Signs the data HMAC
    pub data_hmac_key: [u8; 16],
    /// Signs the tag HMAC
    pub tag_hmac_key: [u8; 16],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial { .. }")
    }
}

/// Pluggable derivation primitive.
pub trait KeyDerivation: Send + Sync {
    /// Must fail with [`Error::KeyMissing`] when either master key is absent.
    fn derive(
        &self,
        data_key: Option<&MasterKey>,
        tag_key: Option<&MasterKey>,
        identity: &TagIdentity,
    ) -> Result<KeyMaterial>;

    fn derive_for(&self, keys: Option<&KeySet>, identity: &TagIdentity) -> Result<KeyMaterial> {
        self.derive(keys.map(|k| &k.data), keys.map(|k| &k.tag), identity)
    }
}

/// HMAC-SHA256 DRBG construction used by this tag family.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrbgKeyDerivation;

impl DrbgKeyDerivation {
    fn prepare_seed(master: &MasterKey, seed: &[u8; SEED_SIZE]) -> Result<Vec<u8>> {
        let magic_size = master.magic_size as usize;
        if magic_size > master.magic_bytes.len() {
            return Err(Error::InvalidKeyFile(format!("magic size {magic_size} exceeds 16")));
        }

        let mut out = Vec::with_capacity(14 + 16 + 16 + 32);
        out.extend_from_slice(master.type_prefix());
        out.extend_from_slice(&seed[..16 - magic_size]);
        out.extend_from_slice(&master.magic_bytes[..magic_size]);
        out.extend_from_slice(&seed[16..32]);
        out.extend(seed[32..64].iter().zip(master.xor_pad.iter()).map(|(s, x)| s ^ x));
        Ok(out)
    }

    fn generate(master: &MasterKey, seed: &[u8; SEED_SIZE]) -> Result<[u8; DERIVED_SIZE]> {
        let prepared = Self::prepare_seed(master, seed)?;
        let mut out = [0u8; DERIVED_SIZE];
        for (iteration, block) in out.chunks_mut(32).enumerate() {
            let mut mac = HmacSha256::new_from_slice(&master.hmac_key)
                .map_err(|e| Error::InvalidKeyFile(e.to_string()))?;
            mac.update(&(iteration as u16).to_be_bytes());
            mac.update(&prepared);
            let digest = mac.finalize().into_bytes();
            block.copy_from_slice(&digest[..block.len()]);
        }
        Ok(out)
    }
}

impl KeyDerivation for DrbgKeyDerivation {
    fn derive(
        &self,
        data_key: Option<&MasterKey>,
        tag_key: Option<&MasterKey>,
        identity: &TagIdentity,
    ) -> Result<KeyMaterial> {
        let (data_key, tag_key) = match (data_key, tag_key) {
            (Some(d), Some(t)) => (d, t),
            _ => return Err(Error::KeyMissing),
        };

        let seed = identity.seed();
        let mut data = Self::generate(data_key, &seed)?;
        let mut tag = Self::generate(tag_key, &seed)?;

        let mut keys = KeyMaterial {
            cipher_key: [0; 16],
            cipher_iv: [0; 16],
            data_hmac_key: [0; 16],
            tag_hmac_key: [0; 16],
        };
        keys.cipher_key.copy_from_slice(&data[0..16]);
        keys.cipher_iv.copy_from_slice(&data[16..32]);
        keys.data_hmac_key.copy_from_slice(&data[32..48]);
        keys.tag_hmac_key.copy_from_slice(&tag[32..48]);

        data.zeroize();
        tag.zeroize();
        Ok(keys)
    }
}
