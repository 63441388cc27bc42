//! Common test utilities: fixture keys, figure images and a device emulator

// Shared across test files; not every item is used by each of them
#![allow(dead_code)]

#[allow(unused_imports)]
pub use amiitag_lib::constants::*;
#[allow(unused_imports)]
pub use amiitag_lib::error::Error;
#[allow(unused_imports)]
pub use amiitag_lib::image::{FigureId, TagImage, Uid};
#[allow(unused_imports)]
pub use amiitag_lib::keys::KeySet;
#[allow(unused_imports)]
pub use bytes::Bytes;

use amiitag_lib::config::SessionConfig;
use amiitag_lib::patch::PatchEngine;
use amiitag_lib::protocol::{self, Opcode};
use amiitag_lib::transport::MemoryPeer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const UID_A: &str = "041122bf3344556644";
pub const UID_B: &str = "04a1b29fc3d4e5f604";
pub const FIGURE: &str = "0741000000200002";

/// Master key with a recognizable fill pattern.
fn master_key(type_string: &[u8], magic_size: u8, seed: u8) -> Vec<u8> {
    let mut key: Vec<u8> = (0..80u8).map(|i| i.wrapping_mul(7).wrapping_add(seed)).collect();
    key[16..30].fill(0);
    key[16..16 + type_string.len()].copy_from_slice(type_string);
    key[30] = 0;
    key[31] = magic_size;
    key
}

pub fn key_file_bytes() -> Vec<u8> {
    let mut file = master_key(b"unfixed infos\0", 14, 0x11);
    file.extend(master_key(b"locked secret\0", 16, 0x5C));
    file
}

pub fn fixture_keys() -> KeySet {
    KeySet::from_bytes(&key_file_bytes()).unwrap()
}

pub fn uid(hex: &str) -> Uid {
    Uid::from_hex(hex).unwrap()
}

/// Plaintext figure with a registered owner nickname and app data.
pub fn plain_figure(uid: &Uid, nickname: &str) -> TagImage {
    let mut data = vec![0u8; IMAGE_SIZE];
    data[UID].copy_from_slice(uid.as_bytes());
    data[9..20].copy_from_slice(&[0x48, 0x0F, 0xE0, 0xF1, 0x10, 0xFF, 0xEE, 0xA5, 0x03, 0x00, 0x00]);
    data[SETTINGS_FLAGS] = FLAG_USER_DATA | FLAG_APP_DATA;
    data[MODIFIED_COUNTER].copy_from_slice(&[0x00, 0x03]);
    for (i, unit) in nickname.encode_utf16().take(10).enumerate() {
        data[NICKNAME.start + i * 2..NICKNAME.start + i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
    }
    data[FIGURE_ID].copy_from_slice(&hex::decode(FIGURE).unwrap());
    data[SALT].fill(0x3C);
    data[APP_ID].copy_from_slice(&[0x34, 0xF8, 0x02, 0x00]);
    for (i, b) in data[APP_DATA].iter_mut().enumerate() {
        *b = i as u8;
    }
    data[LOCK_AND_CONFIG].copy_from_slice(&[0x01, 0x00, 0x0F, 0xBD, 0x00, 0x00, 0x00, 0x04, 0x5F, 0x00, 0x00, 0x00]);
    data[SIGNATURE].fill(0xE7);
    TagImage::load(&data).unwrap()
}

/// An encrypted, correctly signed figure on `uid`.
pub fn encrypted_figure(uid: &Uid, nickname: &str) -> TagImage {
    PatchEngine::new()
        .patch(&plain_figure(uid, nickname), uid.as_bytes(), Some(&fixture_keys()), true)
        .unwrap()
}

/// Log to the test writer; `RUST_LOG=debug` shows the packet dumps.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        response_timeout: Duration::from_millis(200),
        handshake_timeout: Duration::from_millis(200),
        drain_timeout: Duration::from_millis(20),
        ..SessionConfig::default()
    }
}

/// How the emulated device misbehaves.
#[derive(Debug, Clone, Default)]
pub struct Quirks {
    /// Never answer anything
    pub silent: bool,
    /// Answer slot header requests with this many headers for the wrong slot first
    pub bad_headers: usize,
    /// Only send the bad headers
    pub only_bad_headers: bool,
    /// Status byte returned for full writes
    pub write_status: u8,
    /// Pad the fast mode marker notification to this length
    pub marker_len: usize,
}

/// Device state observable by tests after the emulator has run.
#[derive(Debug, Default)]
pub struct DeviceLog {
    /// Every packet the host wrote, in order
    pub writes: Vec<Bytes>,
    pub keys: Option<Vec<u8>>,
    pub name: String,
    pub saved: Vec<u8>,
}

pub struct Emulator {
    pub slots: Vec<Vec<u8>>,
    pub current: u8,
    pub identity: bool,
    pub quirks: Quirks,
    /// Size of the notifications responses are split into
    pub notify_size: usize,
    pub log: Arc<Mutex<DeviceLog>>,
}

impl Emulator {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![vec![0u8; IMAGE_SIZE]; slot_count],
            current: 0,
            identity: false,
            quirks: Quirks::default(),
            notify_size: 20,
            log: Arc::new(Mutex::new(DeviceLog::default())),
        }
    }

    pub fn with_slot(mut self, slot: usize, image: &TagImage) -> Self {
        self.slots[slot] = image.as_bytes().to_vec();
        self
    }

    pub fn spawn(self, peer: MemoryPeer) -> Arc<Mutex<DeviceLog>> {
        init_logging();
        let log = self.log.clone();
        tokio::spawn(self.run(peer));
        log
    }

    fn notify(&self, peer: &MemoryPeer, response: &[u8]) {
        for chunk in response.chunks(self.notify_size.max(1)) {
            peer.notify(Bytes::copy_from_slice(chunk));
        }
    }

    async fn next(&self, peer: &mut MemoryPeer) -> Option<Bytes> {
        let packet = peer.recv().await?;
        self.log.lock().unwrap().writes.push(packet.clone());
        Some(packet)
    }

    async fn collect(&self, peer: &mut MemoryPeer, len: usize) -> Option<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            data.extend_from_slice(&self.next(peer).await?);
        }
        Some(data)
    }

    fn header_response(&self, slot: u8) -> Vec<u8> {
        let image = TagImage::load(&self.slots[slot as usize]).unwrap();
        let mut response = vec![0x01, slot];
        response.extend_from_slice(&protocol::slot_header_from_image(&image));
        response
    }

    pub async fn run(mut self, mut peer: MemoryPeer) {
        // Text mode until the trigger arrives
        let mut text = Vec::new();
        while !String::from_utf8_lossy(&text).contains("fastMode()\n") {
            let Some(packet) = self.next(&mut peer).await else { return };
            text.extend_from_slice(&packet);
        }
        if self.quirks.silent {
            while self.next(&mut peer).await.is_some() {}
            return;
        }
        let mut marker = b"FAST\r\n".to_vec();
        marker.resize(self.quirks.marker_len.max(marker.len()), b' ');
        peer.notify(Bytes::from(marker));

        while let Some(packet) = self.next(&mut peer).await {
            let slot = packet.get(1).copied().unwrap_or(0);
            match Opcode::from(packet[0]) {
                Opcode::Test => self.notify(&peer, &[0x00, 0x01, self.identity as u8]),
                Opcode::SlotInfo if packet.len() == 1 => {
                    self.notify(&peer, &[0x01, self.current, self.slots.len() as u8])
                }
                Opcode::SlotInfo => {
                    let (first, count) = (packet[1], packet[2]);
                    for _ in 0..self.quirks.bad_headers {
                        self.notify(&peer, &self.header_response(first.wrapping_add(1) % self.slots.len() as u8));
                    }
                    if self.quirks.only_bad_headers {
                        continue;
                    }
                    for i in 0..count {
                        self.notify(&peer, &self.header_response(first + i));
                    }
                }
                Opcode::Read => {
                    let (page, count) = (packet[2] as usize, packet[3] as usize);
                    let mut response = packet[..4].to_vec();
                    response.extend_from_slice(&self.slots[slot as usize][page * 4..(page + count) * 4]);
                    self.notify(&peer, &response);
                }
                Opcode::Write => {
                    let page = packet[2] as usize;
                    let data = &packet[3..];
                    self.slots[slot as usize][page * 4..page * 4 + data.len()].copy_from_slice(data);
                }
                Opcode::Save => self.log.lock().unwrap().saved.push(slot),
                Opcode::FullWrite => {
                    let crc = u32::from_le_bytes([packet[2], packet[3], packet[4], packet[5]]);
                    let Some(image) = self.collect(&mut peer, IMAGE_SIZE).await else { return };
                    let mut status = self.quirks.write_status;
                    if status == 0 && protocol::crc32(&image) != crc {
                        status = 1;
                    }
                    if status == 0 {
                        self.slots[slot as usize] = image.clone();
                    }
                    let len = (image.len() as u16).to_le_bytes();
                    self.notify(&peer, &[0x05, slot, len[0], len[1], status]);
                }
                Opcode::FullRead => {
                    let mut response = vec![0x06, slot];
                    response.extend_from_slice(&self.slots[slot as usize]);
                    self.notify(&peer, &response);
                }
                Opcode::MoveSlot => {
                    let to = packet[2];
                    self.slots.swap(slot as usize, to as usize);
                    self.notify(&peer, &packet[..3]);
                }
                Opcode::ClearSlot => {
                    let uid = Uid::random();
                    let mut blank = vec![0u8; IMAGE_SIZE];
                    blank[UID].copy_from_slice(uid.as_bytes());
                    self.slots[slot as usize] = blank;
                    let mut response = vec![0x08, slot];
                    response.extend_from_slice(uid.as_bytes());
                    self.notify(&peer, &response);
                }
                Opcode::Identity => match packet[1] {
                    0x00 => {
                        let provisioned = self.log.lock().unwrap().keys.is_some();
                        self.notify(&peer, &[0x09, 0x00, provisioned as u8]);
                    }
                    0x01 => {
                        let crc = u32::from_le_bytes([packet[2], packet[3], packet[4], packet[5]]);
                        let Some(keys) = self.collect(&mut peer, 160).await else { return };
                        let status = if protocol::crc32(&keys) == crc { 0 } else { 1 };
                        self.log.lock().unwrap().keys = Some(keys);
                        self.notify(&peer, &[0x09, 0x01, status]);
                    }
                    op @ (0x02 | 0x03) => {
                        let slot = packet[2];
                        let uid = Uid::random();
                        let image = &mut self.slots[slot as usize];
                        image[UID].copy_from_slice(uid.as_bytes());
                        if op == 0x02 {
                            image[FIGURE_ID].copy_from_slice(&packet[3..11]);
                            image[MAGIC] = AMIIBO_MAGIC;
                        }
                        let mut response = vec![0x09, op, slot];
                        response.extend_from_slice(uid.as_bytes());
                        self.notify(&peer, &response);
                    }
                    _ => {}
                },
                Opcode::SetName => {
                    let len = packet[1] as usize;
                    let Some(name) = self.collect(&mut peer, len).await else { return };
                    self.log.lock().unwrap().name = String::from_utf8_lossy(&name).into_owned();
                }
                Opcode::GetName => {
                    let name = self.log.lock().unwrap().name.clone();
                    let mut response = vec![0xFB, name.len() as u8];
                    response.extend_from_slice(name.as_bytes());
                    response.resize(22, 0);
                    self.notify(&peer, &response);
                }
                Opcode::FirmwareVersion => {
                    let mut response = vec![0xFC, 5];
                    response.extend_from_slice(b"1.2.3");
                    response.resize(18, 0);
                    self.notify(&peer, &response);
                }
                Opcode::ChangeSlot => {
                    if packet.len() > 1 {
                        self.current = packet[1];
                    }
                    self.notify(&peer, &[0xFF, self.current]);
                }
                Opcode::RawConsole | Opcode::Unknown(_) => {}
            }
        }
    }
}
