mod common;
use common::*;

use amiitag_lib::image::{SizeClass, WriteMode};
use amiitag_lib::keys::sha256_hex;
use amiitag_lib::protocol::{image_from_slot_header, slot_header_from_image};

#[test]
fn test_full_image_roundtrips_exactly() {
    let bytes: Vec<u8> = (0..IMAGE_SIZE).map(|i| (i * 31 % 251) as u8).collect();
    let image = TagImage::load(&bytes).unwrap();
    assert_eq!(image.as_bytes(), bytes.as_slice());
    assert_eq!(image.to_file_bytes().as_ref(), bytes.as_slice());
    assert_eq!(image.size_class(), SizeClass::Full);
}

#[test]
fn test_short_dumps_keep_their_size() {
    let figure = plain_figure(&uid(UID_A), "Pit");
    for (len, class) in [(532, SizeClass::Min), (540, SizeClass::NoSignature)] {
        let image = TagImage::load(&figure.as_bytes()[..len]).unwrap();
        assert_eq!(image.size_class(), class);
        assert_eq!(image.to_file_bytes().len(), len);
        assert_eq!(image.signature(), None);
        assert_eq!(image.figure_id(), figure.figure_id());
    }
}

#[test]
fn test_figure_fields() {
    let figure = plain_figure(&uid(UID_A), "Pit");
    assert_eq!(figure.uid().unwrap(), uid(UID_A));
    assert_eq!(figure.figure_id().hex(), FIGURE);
    assert_eq!(figure.write_counter(), 3);
    assert_eq!(figure.salt(), [0x3C; SALT_LEN]);
    assert_eq!(figure.signature(), Some([0xE7; SIGNATURE_LEN]));
    assert!(figure.is_amiibo());
    assert!(figure.is_locked());
    assert!(figure.is_plausible());
    assert_eq!(figure.write_mode(), WriteMode::AppDataOnly);
}

#[test]
fn test_invalid_uid_is_reported() {
    let figure = plain_figure(&uid(UID_A), "Pit").with_field(8..9, &[0xFF]);
    assert!(matches!(figure.uid(), Err(Error::InvalidUid(_))));
    assert!(!figure.is_plausible());
}

#[test]
fn test_slot_header_keeps_identity() {
    let figure = plain_figure(&uid(UID_B), "Pit");
    let partial = image_from_slot_header(&slot_header_from_image(&figure));
    assert_eq!(partial.figure_id(), figure.figure_id());
    assert_eq!(partial.field(0..8), figure.field(0..8));
    assert_eq!(partial.salt(), figure.salt());
    assert_eq!(partial.field(BODY_WINDOW), &[0u8; 360][..]);
}

#[test]
fn test_key_file_digest() {
    let bytes = key_file_bytes();
    let digest: [u8; 32] = hex::decode(sha256_hex(&bytes)).unwrap().try_into().unwrap();
    let keys = KeySet::load_verified(&bytes, &digest).unwrap();
    assert_eq!(keys.to_bytes(), bytes);

    let mut tampered = bytes.clone();
    tampered[0] ^= 1;
    assert!(matches!(
        KeySet::load_verified(&tampered, &digest),
        Err(Error::KeyDigestMismatch { .. })
    ));
}

#[test]
fn test_key_file_from_disk() {
    let path = std::env::temp_dir().join(format!("amiitag-keys-{}.bin", std::process::id()));
    std::fs::write(&path, key_file_bytes()).unwrap();
    let keys = KeySet::from_file(&path, None).unwrap();
    assert_eq!(keys.data.name(), "unfixed infos");
    assert_eq!(keys.tag.name(), "locked secret");
    std::fs::remove_file(&path).unwrap();
}
