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

//! Error types shared by the protocol engine and its transports.

use std::time::Duration;

use thiserror::Error;

use crate::state::ConnectionState;

/// Failures of the BLE link itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peripheral went away.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No write characteristic is available yet.
    #[error("Not connected")]
    NotConnected,

    /// The platform rejected a characteristic write.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Scanning finished without seeing the advertised name.
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    /// The GATT service lacks the read or write characteristic.
    #[error("Characteristics not found under service {0}")]
    CharacteristicsNotFound(String),

    /// Any other error reported by the Bluetooth stack.
    #[error("Bluetooth error: {0}")]
    Platform(String),
}

#[cfg(feature = "bluez")]
impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        Self::Platform(e.to_string())
    }
}

/// Frame encoding failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid payload: {len} bytes exceeds the {max} byte ceiling")]
    InvalidPayload { len: usize, max: usize },
}

/// Inbound framing problems that resynchronisation had to skip over.
///
/// These are logged and counted, never returned to a caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Declared frame length {declared} outside {min}..={max}")]
    LengthOutOfRange { declared: usize, min: usize, max: usize },

    /// The declared length ran past the start of the next frame.
    #[error("Frame of declared length {declared} overlaps the next sync")]
    MisalignedFrame { declared: usize },
}

/// Caller programming errors caught before any bytes are sent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid arguments for '{command}': {reason}")]
    InvalidArguments { command: String, reason: String },
}

/// Errors surfaced by [`crate::session::Session`] operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No matching frame arrived before the deadline.
    #[error("No response within {0:?}")]
    ResponseTimeout(Duration),

    /// Commands may only be sent while the link is ready.
    #[error("Session not ready (state: {0})")]
    NotReady(ConnectionState),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// The session task has stopped.
    #[error("Session closed")]
    Closed,
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
