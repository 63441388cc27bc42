use super::TransportChannel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Host end of an in-process channel pair.
#[derive(Debug)]
pub struct MemoryChannel {
    to_peer: mpsc::UnboundedSender<Bytes>,
    from_peer: mpsc::UnboundedReceiver<Bytes>,
    connected: bool,
    max_write_len: Option<usize>,
    name: Option<String>,
}

/// Device end of an in-process channel pair.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Packets written by the host
    pub rx: mpsc::UnboundedReceiver<Bytes>,
    /// Notifications delivered to the host
    pub tx: mpsc::UnboundedSender<Bytes>,
}

impl MemoryPeer {
    /// Next host packet; `None` once the host side is dropped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Returns false if the host side is gone.
    pub fn notify(&self, data: impl Into<Bytes>) -> bool {
        self.tx.send(data.into()).is_ok()
    }
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryPeer) {
        let (to_peer, rx) = mpsc::unbounded_channel();
        let (tx, from_peer) = mpsc::unbounded_channel();
        let channel = MemoryChannel {
            to_peer,
            from_peer,
            connected: false,
            max_write_len: None,
            name: None,
        };
        (channel, MemoryPeer { rx, tx })
    }

    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = Some(len);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn connect(&mut self) -> Result<()> {
        if self.to_peer.is_closed() {
            return Err(Error::Channel("peer closed".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::Channel("not connected".to_string()));
        }
        self.to_peer
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| Error::Channel("peer closed".to_string()))
    }

    async fn recv(&mut self) -> Result<Bytes> {
        self.from_peer
            .recv()
            .await
            .ok_or_else(|| Error::Channel("peer closed".to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn max_write_len(&self) -> Option<usize> {
        self.max_write_len
    }

    fn peer_name(&self) -> Option<String> {
        self.name.clone()
    }
}
