//! Puck wire protocol: command encoding and response parsing.
//!
//! Every request starts with an [`Opcode`] byte and most responses echo it
//! back followed by the slot or sub-op they answer. All multi-byte integers
//! are little-endian.

use crate::constants::*;
use crate::error::{Error, Result};
use crate::image::{TagImage, Uid};
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};

/// Length of a slot header as sent by the device
pub const SLOT_HEADER_LEN: usize = 80;

/// Length of one slot header response: opcode, slot, header
pub const SLOT_HEADER_RESPONSE_LEN: usize = 2 + SLOT_HEADER_LEN;

/// Longest name the device stores
pub const MAX_NAME_LEN: usize = 20;

const FIRMWARE_LEN: usize = 16;

/// Where each part of a slot header lands in a full image.
const SLOT_HEADER_MAP: [(std::ops::Range<usize>, std::ops::Range<usize>); 5] = [
    (0..8, 0..8),
    (8..20, 16..28),
    (20..40, 32..52),
    (40..48, 84..92),
    (48..80, 96..128),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive, strum_macros::Display)]
#[repr(u8)]
pub enum Opcode {
    Test = 0x00,
    SlotInfo = 0x01,
    Read = 0x02,
    Write = 0x03,
    Save = 0x04,
    FullWrite = 0x05,
    FullRead = 0x06,
    MoveSlot = 0x07,
    ClearSlot = 0x08,
    Identity = 0x09,
    SetName = 0xFA,
    GetName = 0xFB,
    FirmwareVersion = 0xFC,
    RawConsole = 0xFE,
    ChangeSlot = 0xFF,

    #[num_enum(catch_all)]
    Unknown(u8) = 0x80,
}

/// Sub-operations of [`Opcode::Identity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, strum_macros::Display)]
#[repr(u8)]
pub enum IdentityOp {
    QueryKeys = 0x00,
    SetKeys = 0x01,
    Synthesize = 0x02,
    RewriteUid = 0x03,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Feature byte of the test response.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Device can hold master keys and re-key figures itself
    pub identity: bool,
    #[skip]
    unused: B7,
}

/// Status byte of bulk uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, strum_macros::Display)]
#[repr(u8)]
pub enum TransferStatus {
    Ok = 0,
    ChecksumMismatch = 1,
    LengthMismatch = 2,

    #[num_enum(catch_all)]
    Unknown(u8),
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Pages carried by one paged write at the given packet size.
pub fn pages_per_write(packet_size: usize) -> usize {
    (packet_size.saturating_sub(3) / PAGE_SIZE).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Test,
    SlotSummary,
    SlotHeaders { first: u8, count: u8 },
    Read { slot: u8, page: u8, count: u8 },
    Write { slot: u8, page: u8, data: Bytes },
    Save { slot: u8 },
    FullWrite { slot: u8, image: Bytes },
    FullRead { slot: u8 },
    MoveSlot { from: u8, to: u8 },
    ClearSlot { slot: u8 },
    QueryKeys,
    SetKeys { keys: Bytes },
    Synthesize { slot: u8, figure_id: [u8; FIGURE_ID_LEN] },
    RewriteUid { slot: u8 },
    SetName { name: Bytes },
    GetName,
    FirmwareVersion,
    RawConsole,
    /// `None` reloads the current slot
    ChangeSlot { slot: Option<u8> },
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Test => Opcode::Test,
            Command::SlotSummary | Command::SlotHeaders { .. } => Opcode::SlotInfo,
            Command::Read { .. } => Opcode::Read,
            Command::Write { .. } => Opcode::Write,
            Command::Save { .. } => Opcode::Save,
            Command::FullWrite { .. } => Opcode::FullWrite,
            Command::FullRead { .. } => Opcode::FullRead,
            Command::MoveSlot { .. } => Opcode::MoveSlot,
            Command::ClearSlot { .. } => Opcode::ClearSlot,
            Command::QueryKeys | Command::SetKeys { .. } | Command::Synthesize { .. } | Command::RewriteUid { .. } => {
                Opcode::Identity
            }
            Command::SetName { .. } => Opcode::SetName,
            Command::GetName => Opcode::GetName,
            Command::FirmwareVersion => Opcode::FirmwareVersion,
            Command::RawConsole => Opcode::RawConsole,
            Command::ChangeSlot { .. } => Opcode::ChangeSlot,
        }
    }

    /// The first packet of the request.
    pub fn header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.opcode().into());
        match self {
            Command::Test
            | Command::SlotSummary
            | Command::GetName
            | Command::FirmwareVersion
            | Command::RawConsole => {}
            Command::SlotHeaders { first, count } => {
                buf.put_u8(*first);
                buf.put_u8(*count);
            }
            Command::Read { slot, page, count } => {
                buf.put_slice(&[*slot, *page, *count]);
            }
            Command::Write { slot, page, data } => {
                buf.put_slice(&[*slot, *page]);
                buf.put_slice(data);
            }
            Command::Save { slot } | Command::FullRead { slot } | Command::ClearSlot { slot } => buf.put_u8(*slot),
            Command::FullWrite { slot, image } => {
                buf.put_u8(*slot);
                buf.put_u32_le(crc32(image));
            }
            Command::MoveSlot { from, to } => buf.put_slice(&[*from, *to]),
            Command::QueryKeys => buf.put_u8(IdentityOp::QueryKeys.into()),
            Command::SetKeys { keys } => {
                buf.put_u8(IdentityOp::SetKeys.into());
                buf.put_u32_le(crc32(keys));
            }
            Command::Synthesize { slot, figure_id } => {
                buf.put_u8(IdentityOp::Synthesize.into());
                buf.put_u8(*slot);
                buf.put_slice(figure_id);
            }
            Command::RewriteUid { slot } => {
                buf.put_u8(IdentityOp::RewriteUid.into());
                buf.put_u8(*slot);
            }
            Command::SetName { name } => buf.put_u8(name.len() as u8),
            Command::ChangeSlot { slot } => {
                if let Some(slot) = slot {
                    buf.put_u8(*slot);
                }
            }
        }
        buf.freeze()
    }

    /// Data streamed after the header, if any.
    pub fn bulk(&self) -> Option<&Bytes> {
        match self {
            Command::FullWrite { image, .. } => Some(image),
            Command::SetKeys { keys } => Some(keys),
            Command::SetName { name } => Some(name),
            _ => None,
        }
    }

    /// Header followed by the bulk data split into `packet_size` chunks.
    pub fn packets(&self, packet_size: usize) -> Vec<Bytes> {
        let mut packets = vec![self.header()];
        if let Some(bulk) = self.bulk() {
            let size = packet_size.max(1);
            packets.extend((0..bulk.len()).step_by(size).map(|i| bulk.slice(i..(i + size).min(bulk.len()))));
        }
        packets
    }

    /// Expected response length; `None` for fire-and-forget commands.
    pub fn response_len(&self) -> Option<usize> {
        match self {
            Command::Test | Command::SlotSummary | Command::QueryKeys | Command::SetKeys { .. } => Some(3),
            Command::MoveSlot { .. } => Some(3),
            Command::SlotHeaders { count, .. } => Some(*count as usize * SLOT_HEADER_RESPONSE_LEN),
            Command::Read { count, .. } => Some(4 + *count as usize * PAGE_SIZE),
            Command::FullWrite { .. } => Some(5),
            Command::FullRead { .. } => Some(2 + IMAGE_SIZE),
            Command::ClearSlot { .. } => Some(2 + UID_LEN),
            Command::Synthesize { .. } | Command::RewriteUid { .. } => Some(3 + UID_LEN),
            Command::GetName => Some(2 + MAX_NAME_LEN),
            Command::FirmwareVersion => Some(2 + FIRMWARE_LEN),
            Command::ChangeSlot { .. } => Some(2),
            Command::Write { .. } | Command::Save { .. } | Command::SetName { .. } | Command::RawConsole => None,
        }
    }
}

fn unexpected(opcode: Opcode, response: &[u8]) -> Error {
    Error::UnexpectedResponse {
        opcode: opcode.into(),
        response: hex::encode(response),
    }
}

/// Check length and echoed prefix.
pub fn expect_prefix<'a>(response: &'a [u8], opcode: Opcode, prefix: &[u8], len: usize) -> Result<&'a [u8]> {
    if response.len() != len || !response.starts_with(prefix) {
        return Err(unexpected(opcode, response));
    }
    Ok(&response[prefix.len()..])
}

fn check_status(opcode: Opcode, status: u8) -> Result<()> {
    match TransferStatus::from_primitive(status) {
        TransferStatus::Ok => Ok(()),
        _ => Err(Error::DeviceRejected {
            opcode: opcode.into(),
            status,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestResponse {
    pub version: u8,
    pub features: FeatureFlags,
}

pub fn parse_test(response: &[u8]) -> Result<TestResponse> {
    let body = expect_prefix(response, Opcode::Test, &[Opcode::Test.into()], 3)?;
    Ok(TestResponse {
        version: body[0],
        features: FeatureFlags::from_bytes([body[1]]),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSummary {
    pub current: u8,
    pub total: u8,
}

pub fn parse_slot_summary(response: &[u8]) -> Result<SlotSummary> {
    let body = expect_prefix(response, Opcode::SlotInfo, &[Opcode::SlotInfo.into()], 3)?;
    Ok(SlotSummary {
        current: body[0],
        total: body[1],
    })
}

/// Enumerated slot and its partial image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: u8,
    /// Only the header bytes are populated
    pub image: TagImage,
}

impl SlotInfo {
    /// `0x` followed by the 16 hex digits of the figure id.
    pub fn display_id(&self) -> String {
        self.image.figure_id().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.image.field(0..8).iter().all(|&b| b == 0) && !self.image.is_amiibo()
    }
}

/// Spread a slot header into an otherwise zero image.
pub fn image_from_slot_header(header: &[u8; SLOT_HEADER_LEN]) -> TagImage {
    SLOT_HEADER_MAP
        .into_iter()
        .fold(TagImage::zeroed(), |image, (from, to)| image.with_field(to, &header[from]))
}

/// Inverse of [`image_from_slot_header`].
pub fn slot_header_from_image(image: &TagImage) -> [u8; SLOT_HEADER_LEN] {
    let mut header = [0u8; SLOT_HEADER_LEN];
    for (from, to) in SLOT_HEADER_MAP {
        header[from].copy_from_slice(image.field(to));
    }
    header
}

/// One 82-byte header response; the echoed slot must be `slot`.
pub fn parse_slot_header(response: &[u8], slot: u8) -> Result<SlotInfo> {
    let body = expect_prefix(response, Opcode::SlotInfo, &[Opcode::SlotInfo.into(), slot], SLOT_HEADER_RESPONSE_LEN)?;
    let mut header = [0u8; SLOT_HEADER_LEN];
    header.copy_from_slice(body);
    Ok(SlotInfo {
        slot,
        image: image_from_slot_header(&header),
    })
}

pub fn parse_read(response: &[u8], slot: u8, page: u8, count: u8) -> Result<Bytes> {
    let len = 4 + count as usize * PAGE_SIZE;
    let body = expect_prefix(response, Opcode::Read, &[Opcode::Read.into(), slot, page, count], len)?;
    Ok(Bytes::copy_from_slice(body))
}

/// Returns the byte count the device reported.
pub fn parse_full_write(response: &[u8], slot: u8) -> Result<u16> {
    let body = expect_prefix(response, Opcode::FullWrite, &[Opcode::FullWrite.into(), slot], 5)?;
    check_status(Opcode::FullWrite, body[2])?;
    Ok(u16::from_le_bytes([body[0], body[1]]))
}

pub fn parse_full_read(response: &[u8], slot: u8) -> Result<TagImage> {
    let body = expect_prefix(response, Opcode::FullRead, &[Opcode::FullRead.into(), slot], 2 + IMAGE_SIZE)?;
    TagImage::load(body)
}

pub fn parse_move(response: &[u8], from: u8, to: u8) -> Result<()> {
    expect_prefix(response, Opcode::MoveSlot, &[Opcode::MoveSlot.into(), from, to], 3).map(|_| ())
}

/// The uid left behind in a cleared slot.
pub fn parse_clear(response: &[u8], slot: u8) -> Result<Uid> {
    let body = expect_prefix(response, Opcode::ClearSlot, &[Opcode::ClearSlot.into(), slot], 2 + UID_LEN)?;
    Uid::from_slice(body)
}

pub fn parse_query_keys(response: &[u8]) -> Result<bool> {
    let body = expect_prefix(
        response,
        Opcode::Identity,
        &[Opcode::Identity.into(), IdentityOp::QueryKeys.into()],
        3,
    )?;
    Ok(body[0] != 0)
}

pub fn parse_set_keys(response: &[u8]) -> Result<()> {
    let body = expect_prefix(
        response,
        Opcode::Identity,
        &[Opcode::Identity.into(), IdentityOp::SetKeys.into()],
        3,
    )?;
    check_status(Opcode::Identity, body[0])
}

/// Uid assigned by a synthesize or rewrite.
pub fn parse_identity_uid(response: &[u8], op: IdentityOp, slot: u8) -> Result<Uid> {
    let body = expect_prefix(
        response,
        Opcode::Identity,
        &[Opcode::Identity.into(), op.into(), slot],
        3 + UID_LEN,
    )?;
    Uid::from_slice(body)
}

pub fn parse_name(response: &[u8]) -> Result<String> {
    let body = expect_prefix(response, Opcode::GetName, &[Opcode::GetName.into()], 2 + MAX_NAME_LEN)?;
    let len = (body[0] as usize).min(MAX_NAME_LEN);
    Ok(String::from_utf8_lossy(&body[1..1 + len]).into_owned())
}

pub fn parse_firmware(response: &[u8]) -> Result<String> {
    let body = expect_prefix(
        response,
        Opcode::FirmwareVersion,
        &[Opcode::FirmwareVersion.into()],
        2 + FIRMWARE_LEN,
    )?;
    let len = (body[0] as usize).min(FIRMWARE_LEN);
    Ok(String::from_utf8_lossy(&body[1..1 + len]).trim_end_matches('\0').to_string())
}

/// The slot now active.
pub fn parse_change_slot(response: &[u8]) -> Result<u8> {
    let body = expect_prefix(response, Opcode::ChangeSlot, &[Opcode::ChangeSlot.into()], 2)?;
    Ok(body[0])
}

/// Validate a device name and return its bytes.
pub fn encode_name(name: &str) -> Result<Bytes> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong(name.len()));
    }
    Ok(Bytes::copy_from_slice(name.as_bytes()))
}
