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

//! Connection state and link statistics.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of the link to the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Discovering,
    Ready,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Discovering => "Discovering",
            ConnectionState::Ready => "Ready",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }

    /// Whether commands may be written in this state.
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of the link counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub telemetry_frames: u64,
    /// Advertised name of the currently matched device.
    pub device: Option<String>,
}

/// Counters shared between the session task and its callers.
#[derive(Debug, Default)]
pub struct LinkStats {
    inner: RwLock<LinkStatsSnapshot>,
}

impl LinkStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_sent(&self) {
        self.inner.write().frames_sent += 1;
    }

    pub fn record_notification(&self, bytes: usize) {
        self.inner.write().bytes_received += bytes as u64;
    }

    pub fn record_frame(&self) {
        self.inner.write().frames_received += 1;
    }

    /// Raise the protocol error count to the reassembler's running total.
    pub fn set_protocol_errors(&self, total: u64) {
        self.inner.write().protocol_errors = total;
    }

    pub fn record_timeout(&self) {
        self.inner.write().timeouts += 1;
    }

    pub fn record_cancelled(&self) {
        self.inner.write().cancelled += 1;
    }

    pub fn record_telemetry(&self) {
        self.inner.write().telemetry_frames += 1;
    }

    pub fn set_device(&self, device: Option<String>) {
        self.inner.write().device = device;
    }

    pub fn snapshot(&self) -> LinkStatsSnapshot {
        self.inner.read().clone()
    }
}
