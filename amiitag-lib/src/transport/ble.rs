//! BLE transport over btleplug.

use super::TransportChannel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures_lite::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x78290001_d52e_473f_a9f4_f03da7c67dd1);
pub const COMMAND_UUID: Uuid = Uuid::from_u128(0x78290002_d52e_473f_a9f4_f03da7c67dd1);
pub const RESPONSE_UUID: Uuid = Uuid::from_u128(0x78290003_d52e_473f_a9f4_f03da7c67dd1);

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn ble_err(e: btleplug::Error) -> Error {
    Error::Channel(e.to_string())
}

pub struct BleChannel {
    peripheral: Peripheral,
    command: Option<Characteristic>,
    notifications: Option<NotificationStream>,
    name: Option<String>,
}

impl BleChannel {
    pub fn new(peripheral: Peripheral, name: Option<String>) -> Self {
        Self {
            peripheral,
            command: None,
            notifications: None,
            name,
        }
    }

    pub async fn default_adapter() -> Result<Adapter> {
        let manager = Manager::new().await.map_err(ble_err)?;
        manager
            .adapters()
            .await
            .map_err(ble_err)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Channel("no Bluetooth adapter found".to_string()))
    }

    /// Scan for devices advertising the puck service.
    pub async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<BleChannel>> {
        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(ble_err)?;
        tokio::time::sleep(duration).await;
        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let mut found = Vec::new();
        for peripheral in adapter.peripherals().await.map_err(ble_err)? {
            let Some(properties) = peripheral.properties().await.map_err(ble_err)? else {
                continue;
            };
            if !properties.services.contains(&SERVICE_UUID) {
                continue;
            }
            debug!("Found {:?} ({})", properties.local_name, peripheral.id());
            found.push(BleChannel::new(peripheral, properties.local_name));
        }
        info!("Scan found {} device(s)", found.len());
        Ok(found)
    }
}

#[async_trait]
impl TransportChannel for BleChannel {
    async fn connect(&mut self) -> Result<()> {
        if !self.peripheral.is_connected().await.map_err(ble_err)? {
            self.peripheral.connect().await.map_err(ble_err)?;
        }
        self.peripheral.discover_services().await.map_err(ble_err)?;

        let characteristics = self.peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| Error::Channel(format!("characteristic {uuid} not found")))
        };
        let command = find(COMMAND_UUID)?;
        let response = find(RESPONSE_UUID)?;

        self.peripheral.subscribe(&response).await.map_err(ble_err)?;
        self.notifications = Some(self.peripheral.notifications().await.map_err(ble_err)?);
        self.command = Some(command);
        info!("Connected to {}", self.peripheral.id());
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| Error::Channel("not connected".to_string()))?;
        self.peripheral
            .write(command, data, WriteType::WithoutResponse)
            .await
            .map_err(ble_err)
    }

    async fn recv(&mut self) -> Result<Bytes> {
        let stream = self
            .notifications
            .as_mut()
            .ok_or_else(|| Error::Channel("not connected".to_string()))?;
        while let Some(notification) = stream.next().await {
            if notification.uuid == RESPONSE_UUID {
                return Ok(Bytes::from(notification.value));
            }
        }
        Err(Error::Channel("notification stream ended".to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.notifications = None;
        self.command = None;
        self.peripheral.disconnect().await.map_err(ble_err)
    }

    fn peer_name(&self) -> Option<String> {
        self.name.clone()
    }
}
