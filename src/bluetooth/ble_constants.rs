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

//! BLE names and UUIDs exposed by the mBot Bluetooth module.

use uuid::Uuid;

/// Local name advertised by the mBot BLE module.
pub const DEVICE_NAME: &str = "Makeblock_LE";

/// Serial bridge GATT service (short form `ffe1`).
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Read characteristic (short form `ffe2`).
/// Properties: Notify
pub const READ_UUID: Uuid = Uuid::from_u128(0x0000ffe2_0000_1000_8000_00805f9b34fb);

/// Write characteristic (short form `ffe3`).
/// Properties: Write, Write Without Response
pub const WRITE_UUID: Uuid = Uuid::from_u128(0x0000ffe3_0000_1000_8000_00805f9b34fb);

/// BLE link constants.
pub mod config {
    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// Largest single write for a given MTU.
    pub fn effective_payload_size(mtu: usize) -> usize {
        mtu.saturating_sub(ATT_OVERHEAD).max(1)
    }
}
