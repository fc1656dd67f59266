// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BlueZ central transport.
//!
//! Scans for the robot by advertised name, connects, locates the serial
//! bridge characteristics and forwards notifications to the session.

use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::transport::{chunk_for_mtu, Transport, TransportEvent};
use crate::config::BluetoothConfig;
use crate::error::TransportError;

const DISCOVERY_RETRY: Duration = Duration::from_millis(250);

/// Transport over the local BlueZ daemon.
pub struct BluezTransport {
    config: BluetoothConfig,
    writer: Arc<Mutex<Option<Characteristic>>>,
    device: Arc<Mutex<Option<Device>>>,
    link_task: Option<JoinHandle<()>>,
}

impl BluezTransport {
    pub fn new(config: BluetoothConfig) -> Self {
        Self {
            config,
            writer: Arc::new(Mutex::new(None)),
            device: Arc::new(Mutex::new(None)),
            link_task: None,
        }
    }

    /// Drive one connection from scan to disconnect.
    async fn run_link(
        _session: bluer::Session,
        adapter: Adapter,
        config: BluetoothConfig,
        writer: Arc<Mutex<Option<Characteristic>>>,
        device_slot: Arc<Mutex<Option<Device>>>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let scan = Self::find_device(&adapter, &config);
        let device = tokio::time::timeout(config.scan_timeout(), scan)
            .await
            .map_err(|_| TransportError::DeviceNotFound(config.device_name.clone()))??;

        let address = device.address().to_string();
        send(
            &events,
            TransportEvent::AdvertisementMatched {
                name: config.device_name.clone(),
                address: address.clone(),
            },
        )
        .await?;

        info!("Connecting to {} [{}]", config.device_name, address);
        if !device.is_connected().await? {
            device.connect().await?;
        }
        *device_slot.lock().await = Some(device.clone());
        info!("Connected to {}", address);
        send(&events, TransportEvent::Connected).await?;

        let (read_char, write_char) = Self::discover(&device, &config).await?;
        let notifications = read_char.notify().await?;
        *writer.lock().await = Some(write_char);
        info!("Subscribed for mbot read notifications");
        send(&events, TransportEvent::CharacteristicsFound).await?;

        let device_events = device.events().await?;
        tokio::pin!(notifications);
        tokio::pin!(device_events);

        loop {
            tokio::select! {
                data = notifications.next() => match data {
                    Some(data) => {
                        debug!("mbot data received: {}", hex::encode(&data));
                        send(&events, TransportEvent::Notification(data)).await?;
                    }
                    None => {
                        return Err(TransportError::ConnectionLost(
                            "notification stream ended".to_string(),
                        ))
                    }
                },
                event = device_events.next() => match event {
                    Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                        return Err(TransportError::ConnectionLost(
                            "mbot has disconnected".to_string(),
                        ))
                    }
                    Some(_) => {}
                    None => {
                        return Err(TransportError::ConnectionLost(
                            "device event stream ended".to_string(),
                        ))
                    }
                },
            }
        }
    }

    async fn find_device(
        adapter: &Adapter,
        config: &BluetoothConfig,
    ) -> Result<Device, TransportError> {
        info!("Scanning for '{}'...", config.device_name);
        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        while let Some(event) = discover.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event {
                let device = adapter.device(addr)?;
                let name = device.name().await?;
                debug!("Found device {} with local name {:?}", addr, name);

                if name.as_deref() == Some(config.device_name.as_str()) {
                    info!("mbot found at {}", addr);
                    return Ok(device);
                }
            }
        }

        Err(TransportError::DeviceNotFound(config.device_name.clone()))
    }

    /// Locate the read and write characteristics, retrying while BlueZ is
    /// still resolving the GATT database.
    async fn discover(
        device: &Device,
        config: &BluetoothConfig,
    ) -> Result<(Characteristic, Characteristic), TransportError> {
        let deadline = Instant::now() + config.discovery_timeout();

        loop {
            if let Some(found) = Self::find_characteristics(device, config).await? {
                return Ok(found);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::CharacteristicsNotFound(
                    config.service_uuid.to_string(),
                ));
            }
            debug!("GATT services not resolved yet, retrying");
            tokio::time::sleep(DISCOVERY_RETRY).await;
        }
    }

    async fn find_characteristics(
        device: &Device,
        config: &BluetoothConfig,
    ) -> Result<Option<(Characteristic, Characteristic)>, TransportError> {
        for service in device.services().await? {
            if service.uuid().await? != config.service_uuid {
                continue;
            }
            info!("mbot BLE service found");

            let mut read = None;
            let mut write = None;
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?;
                if uuid == config.read_uuid {
                    info!("mbot READ characteristic found");
                    read = Some(characteristic);
                } else if uuid == config.write_uuid {
                    info!("mbot WRITE characteristic found");
                    write = Some(characteristic);
                }
            }

            if let (Some(read), Some(write)) = (read, write) {
                return Ok(Some((read, write)));
            }
        }

        Ok(None)
    }

    fn abort_link(&mut self) {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
    }
}

impl Drop for BluezTransport {
    fn drop(&mut self) {
        self.abort_link();
    }
}

async fn send(
    events: &mpsc::Sender<TransportEvent>,
    event: TransportEvent,
) -> Result<(), TransportError> {
    events
        .send(event)
        .await
        .map_err(|_| TransportError::ConnectionLost("session dropped".to_string()))
}

impl Transport for BluezTransport {
    async fn open(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        self.abort_link();

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let config = self.config.clone();
        let writer = self.writer.clone();
        let device = self.device.clone();

        self.link_task = Some(tokio::spawn(async move {
            let link = Self::run_link(
                session,
                adapter,
                config,
                writer.clone(),
                device,
                events.clone(),
            );
            let reason = match link.await {
                Ok(()) => "link closed".to_string(),
                Err(e) => {
                    error!("BLE link failed: {}", e);
                    e.to_string()
                }
            };
            *writer.lock().await = None;
            let _ = events.send(TransportEvent::Disconnected { reason }).await;
        }));

        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let guard = self.writer.lock().await;
        let characteristic = guard.as_ref().ok_or(TransportError::NotConnected)?;

        for chunk in chunk_for_mtu(data, self.config.mtu) {
            characteristic
                .write(chunk)
                .await
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        }

        debug!("Wrote {} bytes: {}", data.len(), hex::encode(data));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.abort_link();
        *self.writer.lock().await = None;

        let device = self.device.lock().await.take();
        if let Some(device) = device {
            if device.is_connected().await? {
                info!("Disconnecting from {}", device.address());
                device.disconnect().await?;
            }
        }

        Ok(())
    }
}
