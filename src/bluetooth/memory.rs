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

//! In-memory transport.
//!
//! Records every write and lets the owner inject notifications and link
//! events. Clones share state, so a test can keep one handle while the
//! session owns another.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ble_constants::DEVICE_NAME;
use super::transport::{Transport, TransportEvent};
use crate::error::TransportError;

type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

struct MemoryState {
    events: Option<mpsc::Sender<TransportEvent>>,
    writes: Vec<Vec<u8>>,
    auto_connect: bool,
    failing_writes: usize,
    close_delay: Duration,
    opened: usize,
    closed: usize,
    responder: Option<Responder>,
}

/// Transport backed by plain memory instead of a radio.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// Transport that reports a full connection as soon as it is opened.
    pub fn new() -> Self {
        Self::with_auto_connect(true)
    }

    /// Transport that stays silent after `open` until events are emitted.
    pub fn manual() -> Self {
        Self::with_auto_connect(false)
    }

    fn with_auto_connect(auto_connect: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                events: None,
                writes: Vec::new(),
                auto_connect,
                failing_writes: 0,
                close_delay: Duration::ZERO,
                opened: 0,
                closed: 0,
                responder: None,
            })),
        }
    }

    /// Produce notifications in reply to each write.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        self.inner.lock().responder = Some(Box::new(responder));
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.lock().failing_writes = count;
    }

    /// Make `close` take this long, like a real disconnect handshake.
    pub fn set_close_delay(&self, delay: Duration) {
        self.inner.lock().close_delay = delay;
    }

    /// Deliver an event to the session, as the platform would.
    pub async fn emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        let events = self
            .inner
            .lock()
            .events
            .clone()
            .ok_or(TransportError::NotConnected)?;
        events
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionLost("session dropped".to_string()))
    }

    /// Deliver raw bytes as a notification.
    pub async fn notify(&self, data: &[u8]) -> Result<(), TransportError> {
        self.emit(TransportEvent::Notification(data.to_vec())).await
    }

    /// Everything written so far, one entry per frame.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    /// Wait until at least `count` frames have been written.
    pub async fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.write_count() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .is_ok()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().events.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().opened
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().closed
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    async fn open(&mut self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        let auto_connect = {
            let mut state = self.inner.lock();
            state.events = Some(events.clone());
            state.opened += 1;
            state.auto_connect
        };

        if auto_connect {
            let sequence = [
                TransportEvent::AdvertisementMatched {
                    name: DEVICE_NAME.to_string(),
                    address: "00:00:00:00:00:00".to_string(),
                },
                TransportEvent::Connected,
                TransportEvent::CharacteristicsFound,
            ];
            for event in sequence {
                events
                    .send(event)
                    .await
                    .map_err(|_| TransportError::ConnectionLost("session dropped".to_string()))?;
            }
        }

        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let (events, replies) = {
            let mut state = self.inner.lock();
            let events = state.events.clone().ok_or(TransportError::NotConnected)?;

            if state.failing_writes > 0 {
                state.failing_writes -= 1;
                return Err(TransportError::WriteFailed("injected failure".to_string()));
            }

            state.writes.push(data.to_vec());
            let replies = state
                .responder
                .as_ref()
                .map(|respond| respond(data))
                .unwrap_or_default();
            (events, replies)
        };

        debug!("Memory write: {}", hex::encode(data));

        // The session reads this channel while it waits on us, so never
        // block on it here.
        for reply in replies {
            if let Err(e) = events.try_send(TransportEvent::Notification(reply)) {
                warn!("Dropping scripted reply: {}", e);
            }
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let delay = self.inner.lock().close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.lock();
        state.events = None;
        state.closed += 1;
        Ok(())
    }
}
