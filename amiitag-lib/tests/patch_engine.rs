mod common;
use common::*;

use amiitag_lib::decoded::AppId;
use amiitag_lib::error::ErrorKind;
use amiitag_lib::image::SizeClass;
use amiitag_lib::patch::PatchEngine;
use amiitag_lib::signature::{UidSignaturePair, UidSignatureTable, originality_check};
use rand::SeedableRng;
use rand::rngs::StdRng;

#[test]
fn test_decrypt_signed_figure() {
    let image = encrypted_figure(&uid(UID_A), "Link");
    let engine = PatchEngine::new();
    let plain = engine.decrypt(&image, Some(&fixture_keys())).unwrap();

    assert_eq!(plain.nickname(), "Link");
    assert_eq!(plain.known_app(), Some(AppId::SmashBrosUltimate));
    assert!(plain.has_app_data());
    assert_eq!(plain.app_data()[5], 5);
    assert_eq!(plain.figure_id().hex(), FIGURE);

    // The stored image really is encrypted
    assert_ne!(image.header_window(), plain.as_image().header_window());
}

#[test]
fn test_patch_moves_figure_to_new_uid() {
    let engine = PatchEngine::new();
    let keys = fixture_keys();
    let original = encrypted_figure(&uid(UID_A), "Link");
    let patched = engine.patch(&original, uid(UID_B).as_bytes(), Some(&keys), false).unwrap();

    assert_eq!(patched.uid().unwrap(), uid(UID_B));
    assert_eq!(patched.figure_id(), original.figure_id());
    assert_ne!(patched.salt(), original.salt());
    assert_eq!(patched.field(LOCK_AND_CONFIG), original.field(LOCK_AND_CONFIG));
    assert_eq!(patched.signature(), original.signature());
    assert_eq!(patched.field(9..17), original.field(9..17));

    let before = engine.decrypt(&original, Some(&keys)).unwrap();
    let after = engine.decrypt(&patched, Some(&keys)).unwrap();
    assert_eq!(before.nickname(), after.nickname());
    assert_eq!(before.app_data(), after.app_data());
    assert_eq!(before.as_image().header_window(), after.as_image().header_window());
    assert_eq!(before.as_image().body_window(), after.as_image().body_window());
}

#[test]
fn test_patch_is_repeatable() {
    let engine = PatchEngine::new();
    let keys = fixture_keys();
    let once = engine
        .patch(&encrypted_figure(&uid(UID_A), "Link"), uid(UID_B).as_bytes(), Some(&keys), false)
        .unwrap();
    let twice = engine.patch(&once, uid(UID_A).as_bytes(), Some(&keys), false).unwrap();
    assert_eq!(engine.decrypt(&twice, Some(&keys)).unwrap().nickname(), "Link");
}

#[test]
fn test_patch_rejects_malformed_uid() {
    let engine = PatchEngine::new();
    let image = encrypted_figure(&uid(UID_A), "Link");
    let mut bad = *uid(UID_B).as_bytes();
    bad[3] ^= 0x01;
    let err = engine.patch(&image, &bad, Some(&fixture_keys()), false).unwrap_err();
    assert!(matches!(err, Error::InvalidUid(_)));
    assert_eq!(err.kind(), ErrorKind::Format);

    assert!(matches!(
        engine.patch(&image, &[0x04, 0x11], Some(&fixture_keys()), false),
        Err(Error::InvalidUid(_))
    ));
}

#[test]
fn test_wrong_or_missing_keys_fail_closed() {
    let engine = PatchEngine::new();
    let image = encrypted_figure(&uid(UID_A), "Link");

    let mut other = key_file_bytes();
    other[0] ^= 0xFF;
    let other = KeySet::from_bytes(&other).unwrap();
    let err = engine.decrypt(&image, Some(&other)).unwrap_err();
    assert!(matches!(err, Error::DecryptionFailure(_)));
    assert_eq!(err.kind(), ErrorKind::Crypto);

    assert!(matches!(engine.decrypt(&image, None), Err(Error::KeyMissing)));
    assert!(matches!(
        engine.patch(&image, uid(UID_B).as_bytes(), None, false),
        Err(Error::KeyMissing)
    ));
}

#[test]
fn test_tampered_payload_fails_verification() {
    let engine = PatchEngine::new();
    let image = encrypted_figure(&uid(UID_A), "Link");
    let mut body = image.body_window().to_vec();
    body[100] ^= 0x01;
    let tampered = image.with_field(BODY_WINDOW, &body);
    assert!(matches!(
        engine.decrypt(&tampered, Some(&fixture_keys())),
        Err(Error::DecryptionFailure("data"))
    ));

    let moved = image.with_field(FIGURE_ID, &[0u8; 8]);
    assert!(matches!(
        engine.decrypt(&moved, Some(&fixture_keys())),
        Err(Error::DecryptionFailure("tag"))
    ));
}

#[test]
fn test_synthesize_builds_formatted_figure() {
    let engine = PatchEngine::new();
    let keys = fixture_keys();
    let id = FigureId::from_hex(FIGURE).unwrap();
    let image = engine.synthesize(id, Some(uid(UID_B)), Some(&keys)).unwrap();

    assert_eq!(image.uid().unwrap(), uid(UID_B));
    assert_eq!(image.figure_id(), id);
    assert!(image.is_amiibo());
    assert_eq!(image.field(9..16), &[0x48, 0x0F, 0xE0, 0xF1, 0x10, 0xFF, 0xEE]);
    assert_eq!(
        image.field(LOCK_AND_CONFIG),
        &[0x01, 0x00, 0x0F, 0xBD, 0x00, 0x00, 0x00, 0x04, 0x5F, 0x00, 0x00, 0x00]
    );

    let plain = engine.decrypt(&image, Some(&keys)).unwrap();
    assert_eq!(plain.nickname(), "");
    assert_eq!(plain.known_app(), Some(AppId::None));

    let random = engine.synthesize(id, None, Some(&keys)).unwrap();
    assert!(random.uid().is_ok());
    assert_eq!(random.uid_bytes()[0], 0x04);
}

#[test]
fn test_randomize_uses_table_pairs() {
    let engine = PatchEngine::new();
    let keys = fixture_keys();
    let pair = UidSignaturePair {
        uid: uid(UID_B),
        signature: [0x9A; SIGNATURE_LEN],
    };
    let mut table = UidSignatureTable::new();
    table.insert(pair);

    let source = TagImage::load(&encrypted_figure(&uid(UID_A), "Link").as_bytes()[..540]).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let out = engine
        .randomize_uid_with_rng(&source, Some(&keys), &table, &mut rng)
        .unwrap();

    assert_eq!(out.size_class(), SizeClass::Full);
    assert_eq!(out.uid().unwrap(), uid(UID_B));
    assert_eq!(out.signature(), Some([0x9A; SIGNATURE_LEN]));
    assert_eq!(out.field(PASSWORD), &[0u8; 8]);
    assert_eq!(engine.decrypt(&out, Some(&keys)).unwrap().nickname(), "Link");
}

#[test]
fn test_randomize_without_table_zeroes_signature() {
    let engine = PatchEngine::new();
    let keys = fixture_keys();
    let source = encrypted_figure(&uid(UID_A), "Link");
    let out = engine.randomize_uid(&source, Some(&keys), &UidSignatureTable::new()).unwrap();
    assert_eq!(out.signature(), Some([0u8; SIGNATURE_LEN]));
    assert_ne!(out.uid_bytes(), source.uid_bytes());
    assert!(out.uid().is_ok());
}

#[test]
fn test_originality_with_pluggable_verifier() {
    let chip = uid(UID_A);
    let expected_signature = [0x42u8; 32];
    let verifier = move |message: &[u8; 16], signature: &[u8; 32]| {
        message[9..] == [0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66] && signature == &expected_signature
    };
    assert!(originality_check(chip.as_bytes(), &expected_signature, &verifier));
    assert!(originality_check(&chip.serial(), &expected_signature, &verifier));
    assert!(!originality_check(chip.as_bytes(), &[0x43; 32], &verifier));

    let mut table = UidSignatureTable::new();
    let good = UidSignaturePair {
        uid: chip,
        signature: expected_signature,
    };
    assert!(table.insert_verified(good, &verifier));
    assert!(!table.insert_verified(
        UidSignaturePair {
            uid: uid(UID_B),
            signature: [0u8; 32]
        },
        &verifier
    ));
    assert_eq!(UidSignatureTable::from_bytes(&table.to_bytes()), table);
}
