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

//! mBot command/response protocol.
//!
//! Frames are length-prefixed and start with `0xFF 0x55`. There are no
//! sequence numbers, so replies are correlated by position (see
//! [`crate::session`]).

mod frame;
mod reassembler;
mod registry;

pub use frame::{Frame, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, SYNC};
pub use reassembler::{Feed, FrameReassembler};
pub use registry::{
    command_id, default_port, sub_command, value_type, Command, CommandRegistry,
    DecodedResponse, ResponseShape, COMMAND_NAMES,
};
