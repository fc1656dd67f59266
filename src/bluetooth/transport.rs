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

//! Seam between the session and the platform BLE stack.
//!
//! A transport knows how to reach the two characteristics and nothing about
//! frames. Platform callbacks are handed to the session as
//! [`TransportEvent`]s over an mpsc channel so that all protocol state stays
//! on the session task.

use std::future::Future;

use tokio::sync::mpsc;

use super::ble_constants::config;
use crate::error::TransportError;

/// Events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A device advertising the configured name was found.
    AdvertisementMatched { name: String, address: String },
    /// The GATT connection is up.
    Connected,
    /// Read and write characteristics located, notifications subscribed.
    CharacteristicsFound,
    /// Raw bytes from the read characteristic.
    Notification(Vec<u8>),
    /// Link closed by the peer or the platform.
    Disconnected { reason: String },
}

/// Platform side of the link.
///
/// Implementations report connection progress through the `events` sender
/// passed to [`Transport::open`], in the order advertisement matched,
/// connected, characteristics found.
pub trait Transport: Send + 'static {
    /// Start scanning and connecting. May return before the link is ready.
    fn open(
        &mut self,
        events: mpsc::Sender<TransportEvent>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Write one encoded frame to the write characteristic.
    ///
    /// Must not interleave with another write on the same link.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tear the link down. No events are sent afterwards.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Split an encoded frame into writes that fit the ATT MTU.
pub fn chunk_for_mtu(data: &[u8], mtu: usize) -> std::slice::Chunks<'_, u8> {
    data.chunks(config::effective_payload_size(mtu))
}
