//! Immutable typed view over a tag memory image.
//!
//! Every accepted dump is normalized to the full 572-byte layout on load:
//! shorter dumps are zero-padded and remember their original size class so
//! they can be written back out unchanged.

use crate::constants::*;
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use rand::RngCore;
use std::fmt;
use std::ops::{Range, RangeInclusive};

/// Which of the three accepted file sizes an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum SizeClass {
    /// 532 bytes: no PWD/PACK pages, no signature
    #[strum(to_string = "532")]
    Min,
    /// 540 bytes: full NTAG215 memory, no signature
    #[strum(to_string = "540")]
    NoSignature,
    /// 572 bytes: memory plus originality signature
    #[strum(to_string = "572")]
    Full,
}

impl SizeClass {
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            IMAGE_SIZE_MIN => Some(Self::Min),
            IMAGE_SIZE_NO_SIGNATURE => Some(Self::NoSignature),
            IMAGE_SIZE => Some(Self::Full),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Min => IMAGE_SIZE_MIN,
            Self::NoSignature => IMAGE_SIZE_NO_SIGNATURE,
            Self::Full => IMAGE_SIZE,
        }
    }
}

/// 9-byte chip identifier with its two embedded check bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid([u8; UID_LEN]);

impl Uid {
    /// Validate the check bytes and wrap them.
    pub fn new(bytes: [u8; UID_LEN]) -> Result<Self> {
        if Self::is_valid(&bytes) {
            Ok(Self(bytes))
        } else {
            Err(Error::InvalidUid(hex::encode(bytes)))
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; UID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidUid(hex::encode(bytes)))?;
        Self::new(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches("0x");
        Self::from_slice(&hex::decode(s)?)
    }

    /// `uid[3]` is BCC0 and `uid[8]` is BCC1.
    pub fn is_valid(bytes: &[u8; UID_LEN]) -> bool {
        bytes[3] == bytes[0] ^ bytes[1] ^ bytes[2] ^ 0x88 && bytes[8] == bytes[4] ^ bytes[5] ^ bytes[6] ^ bytes[7]
    }

    /// Fresh random NXP uid (manufacturer byte `0x04`).
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    pub fn random_with<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; UID_LEN];
        rng.fill_bytes(&mut bytes);
        bytes[0] = 0x04;
        bytes[3] = bytes[0] ^ bytes[1] ^ bytes[2] ^ 0x88;
        bytes[8] = bytes[4] ^ bytes[5] ^ bytes[6] ^ bytes[7];
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }

    /// The 7 identifier bytes without the check bytes.
    pub fn serial(&self) -> [u8; 7] {
        let b = &self.0;
        [b[0], b[1], b[2], b[4], b[5], b[6], b[7]]
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self)
    }
}

/// Logical character + variant identifier, stable across re-keying.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FigureId(pub [u8; FIGURE_ID_LEN]);

impl FigureId {
    /// Parse 16 hex digits, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != FIGURE_ID_LEN * 2 {
            return Err(Error::InvalidFigureId(s.to_string()));
        }
        let bytes = hex::decode(s)?;
        let bytes: [u8; FIGURE_ID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidFigureId(s.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn head(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn tail(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    pub fn head_hex(&self) -> String {
        hex::encode(&self.0[0..4])
    }

    pub fn tail_hex(&self) -> String {
        hex::encode(&self.0[4..8])
    }

    /// 16 lowercase hex digits, no prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn game_series_hex(&self) -> String {
        self.hex()[0..3].to_string()
    }

    pub fn character_hex(&self) -> String {
        self.hex()[0..4].to_string()
    }

    pub fn type_hex(&self) -> String {
        self.hex()[6..8].to_string()
    }

    pub fn amiibo_series_hex(&self) -> String {
        self.hex()[12..14].to_string()
    }
}

impl fmt::Display for FigureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.hex())
    }
}

impl fmt::Debug for FigureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FigureId({})", self)
    }
}

/// What a writer is allowed to put on a physical chip holding this image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Blank or unlocked chip: identity, payload and lock pages may be written.
    FullIdentity,
    /// Locked figure: only the counter/header pages and the body may change.
    AppDataOnly,
}

impl WriteMode {
    /// NFC page ranges that may be written, in write order.
    pub fn pages(&self) -> Vec<RangeInclusive<u8>> {
        match self {
            WriteMode::AppDataOnly => vec![4..=12, 32..=129],
            WriteMode::FullIdentity => vec![3..=129, 130..=134],
        }
    }
}

/// A 572-byte tag image. Never mutated in place; see [`TagImage::with_field`].
#[derive(Clone, PartialEq, Eq)]
pub struct TagImage {
    data: Bytes,
    size_class: SizeClass,
}

impl TagImage {
    /// Load a dump of one of the accepted sizes.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let size_class = SizeClass::from_len(bytes.len()).ok_or(Error::InvalidSize(bytes.len()))?;
        let mut data = BytesMut::zeroed(IMAGE_SIZE);
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            data: data.freeze(),
            size_class,
        })
    }

    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        if bytes.len() == IMAGE_SIZE {
            return Ok(Self {
                data: bytes,
                size_class: SizeClass::Full,
            });
        }
        Self::load(&bytes)
    }

    /// All-zero full-size image.
    pub fn zeroed() -> Self {
        Self {
            data: Bytes::from(vec![0u8; IMAGE_SIZE]),
            size_class: SizeClass::Full,
        }
    }

    /// Factory-fresh NTAG215 contents for the given uid.
    pub fn blank_ntag215(uid: Uid) -> Self {
        let mut data = BytesMut::zeroed(IMAGE_SIZE);
        data[UID].copy_from_slice(uid.as_bytes());
        data[INTERNAL] = NXP_INTERNAL;
        data[CAPABILITY_CONTAINER].copy_from_slice(&BLANK_CAPABILITY_CONTAINER);
        data[MAGIC..WRITE_COUNTER.end].copy_from_slice(&[0x03, 0x00, 0xFE]);
        data[523..530].copy_from_slice(&[0xBD, 0x04, 0x00, 0x00, 0xFF, 0x00, 0x05]);
        Self {
            data: data.freeze(),
            size_class: SizeClass::Full,
        }
    }

    /// The normalized 572-byte buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Bytes in the size class the image was loaded from.
    pub fn to_file_bytes(&self) -> Bytes {
        self.data.slice(0..self.size_class.len())
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    pub fn with_size_class(&self, size_class: SizeClass) -> Self {
        Self {
            data: self.data.clone(),
            size_class,
        }
    }

    /// Copy of this image with `range` replaced by `bytes`.
    ///
    /// # Panics
    /// If `range` lies outside the image or its length differs from `bytes`.
    pub fn with_field(&self, range: Range<usize>, bytes: &[u8]) -> Self {
        let mut data = BytesMut::from(self.data.as_ref());
        data[range].copy_from_slice(bytes);
        Self {
            data: data.freeze(),
            size_class: self.size_class,
        }
    }

    pub fn field(&self, range: Range<usize>) -> &[u8] {
        &self.data[range]
    }

    pub fn uid_bytes(&self) -> [u8; UID_LEN] {
        self.array(UID)
    }

    /// The uid, if its check bytes are consistent.
    pub fn uid(&self) -> Result<Uid> {
        Uid::new(self.uid_bytes())
    }

    pub fn write_counter_bytes(&self) -> [u8; 2] {
        self.array(WRITE_COUNTER)
    }

    pub fn write_counter(&self) -> u16 {
        u16::from_le_bytes(self.write_counter_bytes())
    }

    pub fn salt(&self) -> [u8; SALT_LEN] {
        self.array(SALT)
    }

    pub fn figure_id(&self) -> FigureId {
        FigureId(self.array(FIGURE_ID))
    }

    pub fn tag_hmac(&self) -> &[u8] {
        &self.data[TAG_HMAC]
    }

    pub fn data_hmac(&self) -> &[u8] {
        &self.data[DATA_HMAC]
    }

    pub fn header_window(&self) -> &[u8] {
        &self.data[HEADER_WINDOW]
    }

    pub fn body_window(&self) -> &[u8] {
        &self.data[BODY_WINDOW]
    }

    /// The originality signature, when the dump carried one.
    pub fn signature(&self) -> Option<[u8; SIGNATURE_LEN]> {
        match self.size_class {
            SizeClass::Full => Some(self.array(SIGNATURE)),
            _ => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.data[STATIC_LOCK].iter().any(|&b| b != 0)
    }

    pub fn is_amiibo(&self) -> bool {
        self.data[MAGIC] == AMIIBO_MAGIC
    }

    /// Header bytes look like a formatted figure on a genuine chip.
    pub fn is_plausible(&self) -> bool {
        Uid::is_valid(&self.uid_bytes()) && self.is_amiibo()
    }

    pub fn write_mode(&self) -> WriteMode {
        if self.is_amiibo() && self.is_locked() {
            WriteMode::AppDataOnly
        } else {
            WriteMode::FullIdentity
        }
    }

    fn array<const N: usize>(&self, range: Range<usize>) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[range]);
        out
    }
}

impl fmt::Debug for TagImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagImage")
            .field("uid", &hex::encode(self.uid_bytes()))
            .field("figure_id", &self.figure_id())
            .field("size_class", &self.size_class)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_check_bytes() {
        let uid = Uid::random();
        assert!(Uid::is_valid(uid.as_bytes()));
        assert_eq!(uid.as_bytes()[0], 0x04);

        let mut broken = *uid.as_bytes();
        broken[8] ^= 0x01;
        assert!(matches!(Uid::new(broken), Err(Error::InvalidUid(_))));
    }

    #[test]
    fn test_zero_uid_is_valid() {
        // The placeholder uid used for synthesized figures
        let uid = Uid::from_hex("000000880000000000").unwrap();
        assert_eq!(uid.serial(), [0; 7]);
    }

    #[test]
    fn test_figure_id_parts() {
        let id = FigureId::from_hex("0x0741000000200002").unwrap();
        assert_eq!(id.head(), 0x07410000);
        assert_eq!(id.tail(), 0x00200002);
        assert_eq!(id.head_hex(), "07410000");
        assert_eq!(id.game_series_hex(), "074");
        assert_eq!(id.character_hex(), "0741");
        assert_eq!(id.type_hex(), "00");
        assert_eq!(id.amiibo_series_hex(), "00");
        assert_eq!(id.to_string(), "0x0741000000200002");
        assert!(FigureId::from_hex("0741").is_err());
    }

    #[test]
    fn test_size_classes_pad_to_full() {
        for len in ACCEPTED_SIZES {
            let image = TagImage::load(&vec![0xAB; len]).unwrap();
            assert_eq!(image.as_bytes().len(), IMAGE_SIZE);
            assert_eq!(image.to_file_bytes().len(), len);
            assert!(image.as_bytes()[len..].iter().all(|&b| b == 0));
        }
        assert!(matches!(TagImage::load(&[0u8; 571]), Err(Error::InvalidSize(571))));
    }

    #[test]
    fn test_with_field_leaves_original() {
        let original = TagImage::load(&[0u8; IMAGE_SIZE]).unwrap();
        let changed = original.with_field(SALT, &[0x55; SALT_LEN]);
        assert_eq!(original.salt(), [0; SALT_LEN]);
        assert_eq!(changed.salt(), [0x55; SALT_LEN]);
    }

    #[test]
    fn test_blank_tag_write_mode() {
        let blank = TagImage::blank_ntag215(Uid::random());
        assert!(!blank.is_amiibo());
        assert!(!blank.is_locked());
        assert_eq!(blank.write_mode(), WriteMode::FullIdentity);
        assert_eq!(
            blank.field(9..19),
            &[0x48, 0x00, 0x00, 0xE1, 0x10, 0x3E, 0x00, 0x03, 0x00, 0xFE]
        );
        assert_eq!(blank.field(523..530), &[0xBD, 0x04, 0x00, 0x00, 0xFF, 0x00, 0x05]);
    }
}
