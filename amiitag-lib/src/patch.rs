//! Re-keying figures onto a new uid.

use crate::cipher;
use crate::constants::*;
use crate::decoded::DecryptedImage;
use crate::error::Result;
use crate::image::{FigureId, SizeClass, TagImage, Uid};
use crate::keygen::{DrbgKeyDerivation, KeyDerivation, TagIdentity};
use crate::keys::KeySet;
use crate::signature::UidSignatureTable;
use bytes::BytesMut;
use rand::{Rng, RngCore};
use tracing::{debug, info};

/// Header of a freshly formatted figure, before uid and keys are applied
const FIGURE_TEMPLATE_HEAD: [u8; 20] = [
    0x00, 0x00, 0x00, 0x88, 0x00, 0x00, 0x00, 0x00, 0x00, 0x48, 0x0F, 0xE0, 0xF1, 0x10, 0xFF, 0xEE, 0xA5, 0x00, 0x00,
    0x00,
];

/// Dynamic lock and configuration pages of a formatted figure
const FIGURE_TEMPLATE_LOCKS: [u8; 12] = [0x01, 0x00, 0x0F, 0xBD, 0x00, 0x00, 0x00, 0x04, 0x5F, 0x00, 0x00, 0x00];

/// Decrypts, re-signs and encrypts images. Stateless apart from the
/// derivation primitive.
#[derive(Debug, Clone, Default)]
pub struct PatchEngine<D = DrbgKeyDerivation> {
    derivation: D,
}

impl PatchEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: KeyDerivation> PatchEngine<D> {
    pub fn with_derivation(derivation: D) -> Self {
        Self { derivation }
    }

    /// Decrypt and check both signatures.
    pub fn decrypt(&self, image: &TagImage, keys: Option<&KeySet>) -> Result<DecryptedImage> {
        let material = self.derivation.derive_for(keys, &TagIdentity::from(image))?;
        let plain = cipher::apply(&material, image)?;
        cipher::verify(&material, &plain)?;
        Ok(DecryptedImage::new(plain))
    }

    /// Sign and encrypt under the identity found in the plaintext.
    pub fn encrypt(&self, plain: &DecryptedImage, keys: Option<&KeySet>) -> Result<TagImage> {
        self.seal(plain.as_image(), keys)
    }

    fn seal(&self, plain: &TagImage, keys: Option<&KeySet>) -> Result<TagImage> {
        let material = self.derivation.derive_for(keys, &TagIdentity::from(plain))?;
        let tag_hmac = cipher::tag_hmac(&material, plain)?;
        let plain = plain.with_field(TAG_HMAC, &tag_hmac);
        let data_hmac = cipher::data_hmac(&material, &plain, &tag_hmac)?;
        let plain = plain.with_field(DATA_HMAC, &data_hmac);
        cipher::apply(&material, &plain)
    }

    /// Move a figure onto `new_uid` with a fresh salt.
    ///
    /// With `skip_decrypt` the input is taken to be plaintext already.
    pub fn patch(
        &self,
        image: &TagImage,
        new_uid: &[u8],
        keys: Option<&KeySet>,
        skip_decrypt: bool,
    ) -> Result<TagImage> {
        self.patch_with_rng(image, new_uid, keys, skip_decrypt, &mut rand::thread_rng())
    }

    pub fn patch_with_rng<R: RngCore + ?Sized>(
        &self,
        image: &TagImage,
        new_uid: &[u8],
        keys: Option<&KeySet>,
        skip_decrypt: bool,
        rng: &mut R,
    ) -> Result<TagImage> {
        let plain = if skip_decrypt {
            image.clone()
        } else {
            self.decrypt(image, keys)?.into_image()
        };
        let uid = Uid::from_slice(new_uid)?;

        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);

        let plain = plain.with_field(UID, uid.as_bytes()).with_field(SALT, &salt);
        let patched = self.seal(&plain, keys)?;
        info!("Patched {} onto uid {}", patched.figure_id(), uid);
        Ok(patched)
    }

    /// Build a new figure for `figure_id`; a random uid is used when none is given.
    pub fn synthesize(&self, figure_id: FigureId, uid: Option<Uid>, keys: Option<&KeySet>) -> Result<TagImage> {
        let mut rng = rand::thread_rng();
        let mut data = BytesMut::zeroed(IMAGE_SIZE);
        data[0..20].copy_from_slice(&FIGURE_TEMPLATE_HEAD);
        data[FIGURE_ID].copy_from_slice(&figure_id.0);
        rng.fill_bytes(&mut data[SALT]);
        data[LOCK_AND_CONFIG].copy_from_slice(&FIGURE_TEMPLATE_LOCKS);

        let template = TagImage::from_bytes(data.freeze())?;
        let uid = uid.unwrap_or_else(|| Uid::random_with(&mut rng));
        debug!("Synthesizing {} on uid {}", figure_id, uid);
        self.patch_with_rng(&template, uid.as_bytes(), keys, true, &mut rng)
    }

    /// Re-key onto a genuine uid from `table`, carrying its signature along.
    ///
    /// Falls back to a random uid with a zeroed signature when the table is
    /// empty. The result is always a full-size image.
    pub fn randomize_uid(
        &self,
        image: &TagImage,
        keys: Option<&KeySet>,
        table: &UidSignatureTable,
    ) -> Result<TagImage> {
        self.randomize_uid_with_rng(image, keys, table, &mut rand::thread_rng())
    }

    pub fn randomize_uid_with_rng<R: Rng + ?Sized>(
        &self,
        image: &TagImage,
        keys: Option<&KeySet>,
        table: &UidSignatureTable,
        rng: &mut R,
    ) -> Result<TagImage> {
        let (uid, signature) = match table.choose(rng) {
            Some(pair) => (pair.uid, pair.signature),
            None => {
                debug!("Signature table is empty, using a random uid");
                (Uid::random_with(rng), [0u8; SIGNATURE_LEN])
            }
        };

        let patched = self.patch_with_rng(image, uid.as_bytes(), keys, false, rng)?;
        let mut data = BytesMut::zeroed(IMAGE_SIZE);
        data[..IMAGE_SIZE_MIN].copy_from_slice(patched.field(0..IMAGE_SIZE_MIN));
        data[SIGNATURE].copy_from_slice(&signature);
        Ok(TagImage::from_bytes(data.freeze())?.with_size_class(SizeClass::Full))
    }
}
