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

//! Wire frame definition and encoding.
//!
//! ```text
//! byte0-1 : 0xFF 0x55           sync
//! byte2-3 : length (u16 LE)     bytes from byte4 to the end
//! byte4   : command id
//! byte5   : port (external device slot)
//! byte6   : sub-command
//! byte7.. : payload
//! ```

use std::fmt;

use crate::error::CodecError;

/// Two-byte pattern opening every frame.
pub const SYNC: [u8; 2] = [0xFF, 0x55];

/// Bytes of the little-endian length field.
pub const LENGTH_FIELD_SIZE: usize = 2;

/// Command id, port and sub-command.
pub const HEADER_SIZE: usize = 3;

/// Largest payload observed from the device firmware.
pub const DEFAULT_MAX_PAYLOAD: usize = 255;

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command_id: u8,
    pub port: u8,
    pub sub_command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command_id: u8, port: u8, sub_command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command_id,
            port,
            sub_command,
            payload: payload.into(),
        }
    }

    /// Value carried in the length field: the three header bytes plus the
    /// payload, i.e. every byte after the length field.
    ///
    /// Replies from the controller follow this rule. A distance reading
    /// arrives as `FF 55 09 00 02 08 07 02 00 00 00 C8 41`, nine bytes after
    /// the length field, and decoding it any other way loses the float. The
    /// vendor's own request literals count one byte more (`FF 55 04 00 01 01
    /// 03` for a distance read) because its firmware also carries an index
    /// byte that this frame layout does not. Outbound frames use the same
    /// rule as replies, so they are one byte shorter than those literals.
    pub fn length(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode using the default payload ceiling.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.encode_with_limit(DEFAULT_MAX_PAYLOAD)
    }

    /// Encode into wire form, rejecting payloads above `max_payload`.
    pub fn encode_with_limit(&self, max_payload: usize) -> Result<Vec<u8>, CodecError> {
        let max = max_payload.min(u16::MAX as usize - HEADER_SIZE);
        if self.payload.len() > max {
            return Err(CodecError::InvalidPayload {
                len: self.payload.len(),
                max,
            });
        }

        let length = self.length() as u16;
        let mut bytes = Vec::with_capacity(SYNC.len() + LENGTH_FIELD_SIZE + self.length());
        bytes.extend_from_slice(&SYNC);
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.push(self.command_id);
        bytes.push(self.port);
        bytes.push(self.sub_command);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Build a frame from the bytes following the length field.
    ///
    /// `body` must hold at least [`HEADER_SIZE`] bytes.
    pub(crate) fn from_body(body: &[u8]) -> Self {
        Self {
            command_id: body[0],
            port: body[1],
            sub_command: body[2],
            payload: body[HEADER_SIZE..].to_vec(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmd=0x{:02x} port=0x{:02x} sub=0x{:02x} payload={}",
            self.command_id,
            self.port,
            self.sub_command,
            hex::encode(&self.payload)
        )
    }
}
