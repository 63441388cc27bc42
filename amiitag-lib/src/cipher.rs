//! Payload cipher and integrity signatures.
//!
//! The encrypted payload is the header window followed by the body window,
//! run through one AES-128-CTR keystream. The same call encrypts and
//! decrypts.

use crate::constants::*;
use crate::error::{Error, Result};
use crate::image::TagImage;
use crate::keygen::KeyMaterial;
use aes::Aes128;
use bytes::BytesMut;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const HEADER_LEN: usize = HEADER_WINDOW.end - HEADER_WINDOW.start;

/// Transform a full 392-byte payload. Anything shorter or longer is rejected.
pub fn apply_keystream(keys: &KeyMaterial, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() != PAYLOAD_LEN {
        return Err(Error::InvalidPayload(payload.len()));
    }
    let mut out = payload.to_vec();
    let mut cipher = Aes128Ctr::new(&keys.cipher_key.into(), &keys.cipher_iv.into());
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// The concatenated header and body windows of an image.
pub fn payload_of(image: &TagImage) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PAYLOAD_LEN);
    payload.extend_from_slice(image.header_window());
    payload.extend_from_slice(image.body_window());
    payload
}

/// New image with both windows transformed under `keys`.
pub fn apply(keys: &KeyMaterial, image: &TagImage) -> Result<TagImage> {
    let transformed = apply_keystream(keys, &payload_of(image))?;
    let (header, body) = transformed.split_at(HEADER_LEN);

    let mut data = BytesMut::from(image.as_bytes());
    data[HEADER_WINDOW].copy_from_slice(header);
    data[BODY_WINDOW].copy_from_slice(body);
    TagImage::from_bytes(data.freeze()).map(|t| t.with_size_class(image.size_class()))
}

fn keyed(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| Error::InvalidKeyFile(e.to_string()))
}

fn tag_mac(keys: &KeyMaterial, image: &[u8]) -> Result<HmacSha256> {
    let mut mac = keyed(&keys.tag_hmac_key)?;
    mac.update(&image[0..8]);
    mac.update(&image[FIGURE_ID.start..SALT.end]);
    Ok(mac)
}

fn data_mac(keys: &KeyMaterial, plain: &[u8], tag_hmac: &[u8]) -> Result<HmacSha256> {
    let mut mac = keyed(&keys.data_hmac_key)?;
    mac.update(&plain[WRITE_COUNTER.start..HEADER_WINDOW.end]);
    mac.update(&plain[BODY_WINDOW]);
    mac.update(tag_hmac);
    mac.update(&plain[0..8]);
    mac.update(&plain[FIGURE_ID.start..SALT.end]);
    Ok(mac)
}

/// HMAC over the locked identity area (uid and model info + salt).
pub fn tag_hmac(keys: &KeyMaterial, image: &TagImage) -> Result<[u8; HMAC_LEN]> {
    Ok(tag_mac(keys, image.as_bytes())?.finalize().into_bytes().into())
}

/// HMAC over the plaintext; chained after the tag HMAC.
pub fn data_hmac(keys: &KeyMaterial, plain: &TagImage, tag_hmac: &[u8]) -> Result<[u8; HMAC_LEN]> {
    Ok(data_mac(keys, plain.as_bytes(), tag_hmac)?.finalize().into_bytes().into())
}

/// Check both stored signatures of a decrypted image.
pub fn verify(keys: &KeyMaterial, plain: &TagImage) -> Result<()> {
    tag_mac(keys, plain.as_bytes())?
        .verify_slice(plain.tag_hmac())
        .map_err(|_| Error::DecryptionFailure("tag"))?;
    data_mac(keys, plain.as_bytes(), plain.tag_hmac())?
        .verify_slice(plain.data_hmac())
        .map_err(|_| Error::DecryptionFailure("data"))?;
    Ok(())
}
