// Tag layout constants. All offsets are relative to the full 572-byte image.

use std::ops::Range;

/// Size of a full image including the originality signature
pub const IMAGE_SIZE: usize = 572;

/// Size of an NTAG215 dump without the originality signature
pub const IMAGE_SIZE_NO_SIGNATURE: usize = 540;

/// Size of a dump without PWD/PACK pages and signature
pub const IMAGE_SIZE_MIN: usize = 532;

/// Accepted file sizes, smallest first
pub const ACCEPTED_SIZES: [usize; 3] = [IMAGE_SIZE_MIN, IMAGE_SIZE_NO_SIGNATURE, IMAGE_SIZE];

/// NFC page size in bytes
pub const PAGE_SIZE: usize = 4;

/// Number of 4-byte pages covering a full image
pub const PAGE_COUNT: usize = IMAGE_SIZE / PAGE_SIZE;

pub const UID_LEN: usize = 9;
pub const FIGURE_ID_LEN: usize = 8;
pub const SALT_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 32;
pub const HMAC_LEN: usize = 32;

pub const UID: Range<usize> = 0..9;
pub const INTERNAL: usize = 9;
pub const STATIC_LOCK: Range<usize> = 10..12;
pub const CAPABILITY_CONTAINER: Range<usize> = 12..16;
pub const MAGIC: usize = 16;
pub const WRITE_COUNTER: Range<usize> = 17..19;
pub const HEADER_WINDOW: Range<usize> = 20..52;
pub const TAG_HMAC: Range<usize> = 52..84;
pub const FIGURE_ID: Range<usize> = 84..92;
pub const MODEL_INFO: Range<usize> = 84..96;
pub const SALT: Range<usize> = 96..128;
pub const DATA_HMAC: Range<usize> = 128..160;
pub const BODY_WINDOW: Range<usize> = 160..520;
pub const LOCK_AND_CONFIG: Range<usize> = 520..532;
pub const PASSWORD: Range<usize> = 532..540;
pub const SIGNATURE: Range<usize> = 540..572;

/// Byte 16 of every formatted figure
pub const AMIIBO_MAGIC: u8 = 0xA5;

/// Byte 9 of a genuine chip, also the record marker in signature tables
pub const NXP_INTERNAL: u8 = 0x48;

/// NDEF capability container of a factory-fresh NTAG215
pub const BLANK_CAPABILITY_CONTAINER: [u8; 4] = [0xE1, 0x10, 0x3E, 0x00];

/// Combined length of the encrypted header and body windows
pub const PAYLOAD_LEN: usize = (HEADER_WINDOW.end - HEADER_WINDOW.start) + (BODY_WINDOW.end - BODY_WINDOW.start);

// Plaintext fields, valid only on a decrypted image
pub const SETTINGS_FLAGS: usize = 20;
pub const COUNTRY_CODE: usize = 21;
pub const MODIFIED_COUNTER: Range<usize> = 22..24;
pub const NICKNAME: Range<usize> = 32..52;
pub const APP_ID: Range<usize> = 182..186;
pub const APP_DATA: Range<usize> = 220..436;

pub const FLAG_USER_DATA: u8 = 0x10;
pub const FLAG_APP_DATA: u8 = 0x20;
