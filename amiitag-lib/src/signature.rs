//! Originality signatures and the cached (uid, signature) table.
//!
//! Verifying a signature needs the chip vendor's curve parameters, which this
//! crate does not ship; callers supply a [`SignatureVerifier`].

use crate::constants::*;
use crate::image::{TagImage, Uid};
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

/// Length of one table record: `uid[9] | 0x48 | signature[32]`
pub const RECORD_LEN: usize = UID_LEN + 1 + SIGNATURE_LEN;

/// Checks an originality signature over the 16-byte message built from a uid.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, message: &[u8; 16], signature: &[u8; SIGNATURE_LEN]) -> bool;
}

impl<F> SignatureVerifier for F
where
    F: Fn(&[u8; 16], &[u8; SIGNATURE_LEN]) -> bool + Send + Sync,
{
    fn verify(&self, message: &[u8; 16], signature: &[u8; SIGNATURE_LEN]) -> bool {
        self(message, signature)
    }
}

/// Zero-padded message with the 7 serial bytes at the end.
///
/// Accepts the 9-byte uid (check bytes dropped) or the bare 7-byte serial.
pub fn originality_message(uid: &[u8]) -> Option<[u8; 16]> {
    let mut message = [0u8; 16];
    match uid.len() {
        UID_LEN => {
            message[9..12].copy_from_slice(&uid[0..3]);
            message[12..16].copy_from_slice(&uid[4..8]);
        }
        7 => message[9..16].copy_from_slice(uid),
        _ => return None,
    }
    Some(message)
}

pub fn originality_check(uid: &[u8], signature: &[u8], verifier: &dyn SignatureVerifier) -> bool {
    let Some(message) = originality_message(uid) else {
        return false;
    };
    let Ok(signature) = <&[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    verifier.verify(&message, signature)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidSignaturePair {
    pub uid: Uid,
    pub signature: [u8; SIGNATURE_LEN],
}

impl UidSignaturePair {
    /// The pair carried by a full-size dump, if its uid is well formed.
    pub fn from_image(image: &TagImage) -> Option<Self> {
        let signature = image.signature()?;
        let uid = image.uid().ok()?;
        Some(Self { uid, signature })
    }

    pub fn from_record(record: &[u8]) -> Option<Self> {
        if record.len() != RECORD_LEN || record[UID_LEN] != NXP_INTERNAL {
            return None;
        }
        let uid = Uid::from_slice(&record[..UID_LEN]).ok()?;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&record[UID_LEN + 1..]);
        Some(Self { uid, signature })
    }

    pub fn to_record(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[..UID_LEN].copy_from_slice(self.uid.as_bytes());
        record[UID_LEN] = NXP_INTERNAL;
        record[UID_LEN + 1..].copy_from_slice(&self.signature);
        record
    }

    pub fn verify(&self, verifier: &dyn SignatureVerifier) -> bool {
        originality_check(self.uid.as_bytes(), &self.signature, verifier)
    }
}

/// Genuine (uid, signature) pairs collected from scanned chips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidSignatureTable {
    pairs: Vec<UidSignaturePair>,
}

impl UidSignatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse concatenated records. Malformed records are skipped.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut table = Self::new();
        let chunks = bytes.chunks_exact(RECORD_LEN);
        if !chunks.remainder().is_empty() {
            warn!("Ignoring {} trailing bytes in signature table", chunks.remainder().len());
        }
        for record in chunks {
            match UidSignaturePair::from_record(record) {
                Some(pair) => {
                    table.insert(pair);
                }
                None => debug!(record = hex::encode(record), "Skipping malformed signature record"),
            }
        }
        table
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.pairs.iter().flat_map(|p| p.to_record()).collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UidSignaturePair> {
        self.pairs.iter()
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.pairs.iter().any(|p| &p.uid == uid)
    }

    /// Add a pair without checking it. Returns false if the uid is already known.
    pub fn insert(&mut self, pair: UidSignaturePair) -> bool {
        if self.contains(&pair.uid) {
            return false;
        }
        self.pairs.push(pair);
        true
    }

    /// Add a pair only if its signature checks out.
    pub fn insert_verified(&mut self, pair: UidSignaturePair, verifier: &dyn SignatureVerifier) -> bool {
        if !pair.verify(verifier) {
            debug!(uid = %pair.uid, "Rejecting pair with bad originality signature");
            return false;
        }
        self.insert(pair)
    }

    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&UidSignaturePair> {
        self.pairs.choose(rng)
    }
}
