//! Byte-stream channels a [`DeviceSession`](crate::device::DeviceSession) talks over.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

#[cfg(feature = "ble")]
pub mod ble;
pub mod memory;

#[cfg(feature = "ble")]
pub use ble::BleChannel;
pub use memory::{MemoryChannel, MemoryPeer};

/// A notify/write link to one device.
///
/// `recv` must be cancel safe: the session wraps it in timeouts and drops the
/// future when one fires.
#[async_trait]
pub trait TransportChannel: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Send one packet.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Wait for the next notification.
    async fn recv(&mut self) -> Result<Bytes>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Largest packet the link accepts, if known.
    fn max_write_len(&self) -> Option<usize> {
        None
    }

    /// Name the device advertises, if any.
    fn peer_name(&self) -> Option<String> {
        None
    }
}
