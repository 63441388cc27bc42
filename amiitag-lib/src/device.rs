//! One connection to one puck.
//!
//! A [`DeviceSession`] serializes every operation behind a FIFO mutex and
//! tracks the connection in a [`SessionState`]. Responses arrive as arbitrary
//! notification fragments; the session reassembles them into exact-length
//! responses and keeps any surplus bytes for the next read.

use crate::config::SessionConfig;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::image::{FigureId, TagImage, Uid, WriteMode};
use crate::keys::KeySet;
use crate::protocol::{self, Command, FeatureFlags, IdentityOp, Opcode, SlotInfo, SlotSummary};
use crate::transport::TransportChannel;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

/// Upper bound on notifications discarded by one drain
const MAX_DRAIN_PACKETS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Ready,
    Busy(Opcode),
    Disconnecting,
    /// Handshake or channel failure; only `connect` is accepted.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Handshaking => f.write_str("handshaking"),
            SessionState::Ready => f.write_str("ready"),
            SessionState::Busy(op) => write!(f, "busy ({op})"),
            SessionState::Disconnecting => f.write_str("disconnecting"),
            SessionState::Failed => f.write_str("failed"),
        }
    }
}

/// What the device reported during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: u8,
    pub features: FeatureFlags,
    /// Negotiated packet size
    pub packet_size: usize,
}

impl DeviceInfo {
    pub fn supports_identity(&self) -> bool {
        self.features.identity()
    }
}

/// Progress of a multi-step transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub slot: u8,
    pub done: usize,
    pub total: usize,
}

struct Inner<C> {
    channel: C,
    config: SessionConfig,
    packet_size: usize,
    info: Option<DeviceInfo>,
    summary: Option<SlotSummary>,
    slots: BTreeMap<u8, SlotInfo>,
    /// Received bytes not yet consumed by a response
    pending: BytesMut,
    /// An operation was abandoned and its response may still arrive
    stale: bool,
}

impl<C: TransportChannel> Inner<C> {
    fn packet_cap(&self) -> usize {
        let cap = self.config.max_packet_size;
        self.channel.max_write_len().map_or(cap, |len| len.min(cap)).max(1)
    }

    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        debug!(bytes = hex::encode(packet), "TX");
        self.channel.write(packet).await
    }

    async fn send_command(&mut self, command: &Command) -> Result<()> {
        for packet in command.packets(self.packet_size) {
            self.send(&packet).await?;
        }
        Ok(())
    }

    /// Like [`Inner::send_command`], reporting bulk bytes as they go out.
    async fn send_bulk(
        &mut self,
        command: &Command,
        slot: u8,
        progress: &mut (impl FnMut(TransferProgress) + Send),
    ) -> Result<()> {
        let packets = command.packets(self.packet_size);
        let total = command.bulk().map_or(0, Bytes::len);
        let mut done = 0;
        for (i, packet) in packets.iter().enumerate() {
            self.send(packet).await?;
            if i > 0 {
                done += packet.len();
                progress(TransferProgress { slot, done, total });
            }
        }
        Ok(())
    }

    async fn recv_until(&mut self, deadline: Instant) -> Result<Bytes> {
        let chunk = timeout_at(deadline, self.channel.recv()).await??;
        debug!(bytes = hex::encode(&chunk), "RX");
        Ok(chunk)
    }

    /// Exactly `len` response bytes, reassembled from notifications.
    async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        let deadline = Instant::now() + self.config.response_timeout;
        while self.pending.len() < len {
            let chunk = self.recv_until(deadline).await?;
            self.pending.extend_from_slice(&chunk);
        }
        Ok(self.pending.split_to(len).freeze())
    }

    /// Read and validate a response, re-reading when it answers something else.
    async fn await_response<T>(&mut self, len: usize, parse: impl Fn(&[u8]) -> Result<T>) -> Result<T> {
        let retries = self.config.max_read_retries;
        let mut last = None;
        for attempt in 0..=retries {
            let response = self.read_exact(len).await?;
            match parse(&response) {
                Err(e @ Error::UnexpectedResponse { .. }) => {
                    warn!(attempt, "Discarding response: {}", e);
                    last = Some(e);
                }
                other => return other,
            }
        }
        Err(Error::Protocol(format!(
            "no valid response after {} reads{}",
            retries + 1,
            last.map(|e| format!(": {e}")).unwrap_or_default()
        )))
    }

    async fn request<T>(&mut self, command: &Command, parse: impl Fn(&[u8]) -> Result<T>) -> Result<T> {
        let len = command
            .response_len()
            .ok_or_else(|| Error::Protocol(format!("{} has no response", command.opcode())))?;
        self.send_command(command).await?;
        self.await_response(len, parse).await
    }

    /// Discard notifications until the channel stays quiet for `drain_timeout`.
    async fn drain(&mut self) {
        self.pending.clear();
        let quiet = self.config.drain_timeout;
        for _ in 0..MAX_DRAIN_PACKETS {
            match timeout(quiet, self.channel.recv()).await {
                Ok(Ok(chunk)) => debug!(bytes = hex::encode(&chunk), "Drained"),
                Ok(Err(e)) => {
                    warn!("Drain stopped: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }
        self.stale = false;
    }

    async fn handshake(&mut self, keys: Option<&KeySet>, state: &watch::Sender<SessionState>) -> Result<DeviceInfo> {
        self.channel.connect().await?;
        state.send_replace(SessionState::Handshaking);

        self.pending.clear();
        self.stale = false;
        self.info = None;
        let cap = self.packet_cap();
        self.packet_size = self.config.initial_packet_size.clamp(1, cap);

        let trigger = self.config.trigger.clone().into_bytes();
        for chunk in trigger.chunks(self.packet_size) {
            self.send(chunk).await?;
        }

        let marker = self.config.marker.clone().into_bytes();
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut seen: Vec<u8> = Vec::new();
        while !marker.is_empty() && !seen.windows(marker.len()).any(|w| w == marker.as_slice()) {
            let chunk = self.recv_until(deadline).await?;
            self.packet_size = self.packet_size.max(chunk.len()).min(cap);
            seen.extend_from_slice(&chunk);
        }
        debug!("Fast mode active, packet size {}", self.packet_size);
        self.drain().await;

        let test = self.request(&Command::Test, protocol::parse_test).await?;
        let info = DeviceInfo {
            version: test.version,
            features: test.features,
            packet_size: self.packet_size,
        };
        info!(
            "Device protocol version {} (identity: {})",
            info.version,
            info.supports_identity()
        );

        if info.supports_identity() {
            let provisioned = self.request(&Command::QueryKeys, protocol::parse_query_keys).await?;
            match (provisioned, keys) {
                (true, _) => debug!("Device already holds keys"),
                (false, Some(keys)) => self.upload_keys(keys).await?,
                (false, None) => warn!("Device has no keys and none were supplied"),
            }
        }

        self.info = Some(info);
        Ok(info)
    }

    async fn upload_keys(&mut self, keys: &KeySet) -> Result<()> {
        let command = Command::SetKeys {
            keys: Bytes::from(keys.to_bytes()),
        };
        self.request(&command, protocol::parse_set_keys).await?;
        info!("Uploaded keys to device");
        Ok(())
    }

    async fn slot_summary(&mut self) -> Result<SlotSummary> {
        let summary = self.request(&Command::SlotSummary, protocol::parse_slot_summary).await?;
        self.summary = Some(summary);
        Ok(summary)
    }

    async fn slot_headers(
        &mut self,
        first: u8,
        count: u8,
        progress: &mut (impl FnMut(TransferProgress) + Send),
    ) -> Result<Vec<SlotInfo>> {
        self.send_command(&Command::SlotHeaders { first, count }).await?;
        let mut slots = Vec::with_capacity(count as usize);
        for i in 0..count {
            let slot = first.wrapping_add(i);
            let info = self
                .await_response(protocol::SLOT_HEADER_RESPONSE_LEN, |r| protocol::parse_slot_header(r, slot))
                .await?;
            self.slots.insert(slot, info.clone());
            slots.push(info);
            progress(TransferProgress {
                slot,
                done: i as usize + 1,
                total: count as usize,
            });
        }
        Ok(slots)
    }

    async fn read_pages(&mut self, slot: u8, first_page: u8, count: usize) -> Result<Bytes> {
        check_pages(first_page as usize, count)?;
        let per_read = self.config.max_pages_per_read.max(1) as usize;
        let mut out = BytesMut::with_capacity(count * PAGE_SIZE);
        let mut page = first_page as usize;
        let end = first_page as usize + count;
        while page < end {
            let n = (end - page).min(per_read);
            let (p, c) = (page as u8, n as u8);
            let data = self
                .request(&Command::Read { slot, page: p, count: c }, |r| {
                    protocol::parse_read(r, slot, p, c)
                })
                .await?;
            out.extend_from_slice(&data);
            page += n;
        }
        Ok(out.freeze())
    }

    async fn write_pages(&mut self, slot: u8, first_page: u8, data: &[u8]) -> Result<()> {
        if data.len() % PAGE_SIZE != 0 {
            return Err(Error::InvalidPayload(data.len()));
        }
        check_pages(first_page as usize, data.len() / PAGE_SIZE)?;
        let chunk = protocol::pages_per_write(self.packet_size) * PAGE_SIZE;
        for (i, part) in data.chunks(chunk).enumerate() {
            let page = first_page as usize + i * chunk / PAGE_SIZE;
            let command = Command::Write {
                slot,
                page: page as u8,
                data: Bytes::copy_from_slice(part),
            };
            self.send(&command.header()).await?;
        }
        Ok(())
    }

    async fn full_read(&mut self, slot: u8) -> Result<TagImage> {
        self.request(&Command::FullRead { slot }, |r| protocol::parse_full_read(r, slot))
            .await
    }

    async fn full_write(
        &mut self,
        slot: u8,
        image: &TagImage,
        progress: &mut (impl FnMut(TransferProgress) + Send),
    ) -> Result<SlotInfo> {
        let command = Command::FullWrite {
            slot,
            image: Bytes::copy_from_slice(image.as_bytes()),
        };
        self.send_bulk(&command, slot, progress).await?;
        let received = self.await_response(5, |r| protocol::parse_full_write(r, slot)).await?;
        if received as usize != IMAGE_SIZE {
            return Err(Error::Protocol(format!("device stored {received} of {IMAGE_SIZE} bytes")));
        }

        let header = protocol::slot_header_from_image(image);
        let info = SlotInfo {
            slot,
            image: protocol::image_from_slot_header(&header),
        };
        self.slots.insert(slot, info.clone());
        Ok(info)
    }

    fn require_identity(&self) -> Result<()> {
        match self.info {
            Some(info) if info.supports_identity() => Ok(()),
            _ => Err(Error::Unsupported("identity commands")),
        }
    }
}

/// Serialized access to one device over a [`TransportChannel`].
pub struct DeviceSession<C> {
    inner: Mutex<Inner<C>>,
    state: watch::Sender<SessionState>,
    name: Option<String>,
}

/// Exclusive access for one operation. Dropping it unfinished marks the
/// session stale so the next operation drains first.
struct OpGuard<'a, C> {
    inner: MutexGuard<'a, Inner<C>>,
    state: &'a watch::Sender<SessionState>,
    finished: bool,
}

impl<C> OpGuard<'_, C> {
    fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let next = match &result {
            Err(e) if e.is_fatal_to_session() => SessionState::Failed,
            Err(Error::Timeout(_)) => {
                self.inner.stale = true;
                SessionState::Ready
            }
            _ => SessionState::Ready,
        };
        if let Err(e) = &result {
            warn!("Operation failed: {}", e);
        }
        self.state.send_replace(next);
        self.finished = true;
        result
    }
}

impl<C> Drop for OpGuard<'_, C> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.stale = true;
            self.state.send_if_modified(|state| {
                if matches!(state, SessionState::Busy(_)) {
                    *state = SessionState::Ready;
                    true
                } else {
                    false
                }
            });
        }
    }
}

impl<C> Deref for OpGuard<'_, C> {
    type Target = Inner<C>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<C> DerefMut for OpGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

fn no_progress(_: TransferProgress) {}

/// Paged transfers must stay inside the image.
fn check_pages(first: usize, count: usize) -> Result<()> {
    if first + count > PAGE_COUNT {
        return Err(Error::InvalidPageRange { first, count });
    }
    Ok(())
}

impl<C: TransportChannel> DeviceSession<C> {
    pub fn new(channel: C, config: SessionConfig) -> Self {
        let name = channel.peer_name();
        let packet_size = config.initial_packet_size.max(1);
        Self {
            inner: Mutex::new(Inner {
                channel,
                config,
                packet_size,
                info: None,
                summary: None,
                slots: BTreeMap::new(),
                pending: BytesMut::new(),
                stale: false,
            }),
            state: watch::Sender::new(SessionState::Idle),
            name,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Name advertised by the transport.
    pub fn peer_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Open the channel, switch the device to fast mode and read its
    /// capabilities. Keys are uploaded when the device supports identity
    /// commands and has none yet.
    pub async fn connect(&self, keys: Option<&KeySet>) -> Result<DeviceInfo> {
        let mut inner = self.inner.lock().await;
        if let (SessionState::Ready, Some(info)) = (self.state(), inner.info) {
            return Ok(info);
        }
        self.state.send_replace(SessionState::Connecting);
        info!("Connecting to {}", self.name.as_deref().unwrap_or("device"));

        match inner.handshake(keys, &self.state).await {
            Ok(info) => {
                self.state.send_replace(SessionState::Ready);
                Ok(info)
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                self.state.send_replace(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Always succeeds; channel errors are logged.
    pub async fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.state.send_replace(SessionState::Disconnecting);

        let quiet = inner.config.drain_timeout;
        if let Ok(Ok(chunk)) = timeout(quiet, inner.channel.recv()).await {
            debug!(bytes = hex::encode(&chunk), "Drained");
        }
        if let Err(e) = inner.channel.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }

        inner.pending.clear();
        inner.slots.clear();
        inner.summary = None;
        inner.info = None;
        inner.stale = false;
        self.state.send_replace(SessionState::Idle);
        info!("Disconnected from {}", self.name.as_deref().unwrap_or("device"));
        Ok(())
    }

    async fn begin(&self, op: Opcode) -> Result<OpGuard<'_, C>> {
        let inner = self.inner.lock().await;
        let state = self.state();
        if state != SessionState::Ready {
            return Err(Error::NotReady(state));
        }
        self.state.send_replace(SessionState::Busy(op));
        let mut guard = OpGuard {
            inner,
            state: &self.state,
            finished: false,
        };
        if guard.stale {
            debug!("Draining stale responses before {}", op);
            guard.drain().await;
        }
        Ok(guard)
    }

    pub async fn info(&self) -> Option<DeviceInfo> {
        self.inner.lock().await.info
    }

    pub async fn packet_size(&self) -> usize {
        self.inner.lock().await.packet_size
    }

    /// Slots seen since the last connect.
    pub async fn cached_slots(&self) -> Vec<SlotInfo> {
        self.inner.lock().await.slots.values().cloned().collect()
    }

    pub async fn slot_summary(&self) -> Result<SlotSummary> {
        let mut op = self.begin(Opcode::SlotInfo).await?;
        let result = op.slot_summary().await;
        op.finish(result)
    }

    pub async fn read_slot_info(&self, first: u8, count: u8) -> Result<Vec<SlotInfo>> {
        let mut op = self.begin(Opcode::SlotInfo).await?;
        let result = op.slot_headers(first, count, &mut no_progress).await;
        op.finish(result)
    }

    /// Summary plus the header of every slot.
    pub async fn read_all_slot_info(
        &self,
        mut progress: impl FnMut(TransferProgress) + Send,
    ) -> Result<(SlotSummary, Vec<SlotInfo>)> {
        let mut op = self.begin(Opcode::SlotInfo).await?;
        let result = async {
            let summary = op.slot_summary().await?;
            let slots = op.slot_headers(0, summary.total, &mut progress).await?;
            Ok::<_, Error>((summary, slots))
        }
        .await;
        op.finish(result)
    }

    /// Paged read of `count` pages starting at `first_page`.
    pub async fn read_pages(&self, slot: u8, first_page: u8, count: usize) -> Result<Bytes> {
        let mut op = self.begin(Opcode::Read).await?;
        let result = op.read_pages(slot, first_page, count).await;
        op.finish(result)
    }

    /// Whole slot via paged reads, for devices without full transfers.
    pub async fn read_image_paged(&self, slot: u8) -> Result<TagImage> {
        let mut op = self.begin(Opcode::Read).await?;
        let result = async {
            let data = op.read_pages(slot, 0, PAGE_COUNT).await?;
            TagImage::load(&data)
        }
        .await;
        op.finish(result)
    }

    /// Paged write. Nothing is acknowledged; call [`DeviceSession::save`] after.
    pub async fn write_pages(&self, slot: u8, first_page: u8, data: &[u8]) -> Result<()> {
        let mut op = self.begin(Opcode::Write).await?;
        let result = op.write_pages(slot, first_page, data).await;
        op.finish(result)
    }

    /// Write the pages `mode` allows, then commit.
    pub async fn write_image_paged(&self, slot: u8, image: &TagImage, mode: WriteMode) -> Result<()> {
        let mut op = self.begin(Opcode::Write).await?;
        let result = async {
            for pages in mode.pages() {
                let start = *pages.start() as usize * PAGE_SIZE;
                let end = (*pages.end() as usize + 1) * PAGE_SIZE;
                op.write_pages(slot, *pages.start(), image.field(start..end)).await?;
            }
            op.send_command(&Command::Save { slot }).await?;
            op.slots.remove(&slot);
            Ok::<_, Error>(())
        }
        .await;
        op.finish(result)
    }

    pub async fn save(&self, slot: u8) -> Result<()> {
        let mut op = self.begin(Opcode::Save).await?;
        let result = op.send_command(&Command::Save { slot }).await;
        op.finish(result)
    }

    pub async fn read_image(&self, slot: u8) -> Result<TagImage> {
        let mut op = self.begin(Opcode::FullRead).await?;
        let result = op.full_read(slot).await;
        op.finish(result)
    }

    /// Full image of every slot, in slot order.
    pub async fn read_all_images(
        &self,
        mut progress: impl FnMut(TransferProgress) + Send,
    ) -> Result<Vec<(u8, TagImage)>> {
        let mut op = self.begin(Opcode::FullRead).await?;
        let result = async {
            let summary = op.slot_summary().await?;
            let mut images = Vec::with_capacity(summary.total as usize);
            for slot in 0..summary.total {
                images.push((slot, op.full_read(slot).await?));
                progress(TransferProgress {
                    slot,
                    done: slot as usize + 1,
                    total: summary.total as usize,
                });
            }
            Ok::<_, Error>(images)
        }
        .await;
        op.finish(result)
    }

    /// Upload a full image and refresh the slot cache.
    pub async fn write_image(
        &self,
        slot: u8,
        image: &TagImage,
        mut progress: impl FnMut(TransferProgress) + Send,
    ) -> Result<SlotInfo> {
        let mut op = self.begin(Opcode::FullWrite).await?;
        let result = op.full_write(slot, image, &mut progress).await;
        op.finish(result)
    }

    pub async fn move_slot(&self, from: u8, to: u8) -> Result<()> {
        let mut op = self.begin(Opcode::MoveSlot).await?;
        let result = async {
            op.request(&Command::MoveSlot { from, to }, |r| protocol::parse_move(r, from, to))
                .await?;
            op.slots.remove(&from);
            op.slots.remove(&to);
            Ok::<_, Error>(())
        }
        .await;
        op.finish(result)
    }

    /// Blank the slot; returns the uid the device assigned to it.
    pub async fn clear_slot(&self, slot: u8) -> Result<Uid> {
        let mut op = self.begin(Opcode::ClearSlot).await?;
        let result = async {
            let uid = op
                .request(&Command::ClearSlot { slot }, |r| protocol::parse_clear(r, slot))
                .await?;
            let image = TagImage::zeroed().with_field(UID, uid.as_bytes());
            op.slots.insert(slot, SlotInfo { slot, image });
            Ok::<_, Error>(uid)
        }
        .await;
        op.finish(result)
    }

    pub async fn keys_provisioned(&self) -> Result<bool> {
        let mut op = self.begin(Opcode::Identity).await?;
        let result = async {
            op.require_identity()?;
            op.request(&Command::QueryKeys, protocol::parse_query_keys).await
        }
        .await;
        op.finish(result)
    }

    pub async fn set_keys(&self, keys: &KeySet) -> Result<()> {
        let mut op = self.begin(Opcode::Identity).await?;
        let result = async {
            op.require_identity()?;
            op.upload_keys(keys).await
        }
        .await;
        op.finish(result)
    }

    /// Have the device build a figure in `slot`; returns its new uid.
    pub async fn synthesize(&self, slot: u8, figure_id: FigureId) -> Result<Uid> {
        self.identity_uid(Command::Synthesize {
            slot,
            figure_id: figure_id.0,
        })
        .await
    }

    /// Have the device re-key the figure in `slot` onto a fresh uid.
    pub async fn rewrite_uid(&self, slot: u8) -> Result<Uid> {
        self.identity_uid(Command::RewriteUid { slot }).await
    }

    async fn identity_uid(&self, command: Command) -> Result<Uid> {
        let (op_code, slot) = match command {
            Command::Synthesize { slot, .. } => (IdentityOp::Synthesize, slot),
            Command::RewriteUid { slot } => (IdentityOp::RewriteUid, slot),
            _ => return Err(Error::Unsupported("identity command")),
        };
        let mut op = self.begin(Opcode::Identity).await?;
        let result = async {
            op.require_identity()?;
            let uid = op
                .request(&command, |r| protocol::parse_identity_uid(r, op_code, slot))
                .await?;
            op.slots.remove(&slot);
            Ok::<_, Error>(uid)
        }
        .await;
        op.finish(result)
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        let name = protocol::encode_name(name)?;
        let mut op = self.begin(Opcode::SetName).await?;
        let result = op.send_command(&Command::SetName { name }).await;
        op.finish(result)
    }

    pub async fn device_name(&self) -> Result<String> {
        let mut op = self.begin(Opcode::GetName).await?;
        let result = op.request(&Command::GetName, protocol::parse_name).await;
        op.finish(result)
    }

    /// Device name, or the advertised name if the device does not answer.
    pub async fn display_name(&self) -> String {
        match self.device_name().await {
            Ok(name) if !name.is_empty() => name,
            Ok(_) | Err(_) => self.name.clone().unwrap_or_else(|| "Puck".to_string()),
        }
    }

    pub async fn firmware_version(&self) -> Result<String> {
        let mut op = self.begin(Opcode::FirmwareVersion).await?;
        let result = op.request(&Command::FirmwareVersion, protocol::parse_firmware).await;
        op.finish(result)
    }

    /// Select `slot`, or reload the current slot. Returns the active slot.
    pub async fn change_slot(&self, slot: Option<u8>) -> Result<u8> {
        let mut op = self.begin(Opcode::ChangeSlot).await?;
        let result = async {
            let current = op
                .request(&Command::ChangeSlot { slot }, protocol::parse_change_slot)
                .await?;
            if let Some(summary) = op.summary.as_mut() {
                summary.current = current;
            }
            Ok::<_, Error>(current)
        }
        .await;
        op.finish(result)
    }

    /// Leave binary mode. The device stops answering commands, so the
    /// session disconnects.
    pub async fn enter_raw_console(&self) -> Result<()> {
        {
            let mut op = self.begin(Opcode::RawConsole).await?;
            let result = op.send_command(&Command::RawConsole).await;
            op.finish(result)?;
        }
        self.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryChannel;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            response_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_millis(100),
            drain_timeout: Duration::from_millis(10),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_commands_rejected_before_connect() {
        let (channel, mut peer) = MemoryChannel::pair();
        let session = DeviceSession::new(channel, config());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(
            session.slot_summary().await,
            Err(Error::NotReady(SessionState::Idle))
        ));
        assert!(peer.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_infallible() {
        let (channel, peer) = MemoryChannel::pair();
        drop(peer);
        let session = DeviceSession::new(channel, config());
        assert!(session.disconnect().await.is_ok());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Busy(Opcode::FullWrite).to_string(), "busy (FullWrite)");
        assert_eq!(SessionState::Failed.to_string(), "failed");
    }
}
