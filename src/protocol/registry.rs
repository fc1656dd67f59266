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

//! Command encoding and response decoding rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::frame::{Frame, DEFAULT_MAX_PAYLOAD};
use crate::error::{CodecError, RegistryError};

/// Command ids written by the host.
pub mod command_id {
    pub const READ: u8 = 0x01;
    pub const RUN: u8 = 0x02;
}

/// Sub-commands selecting the addressed peripheral.
pub mod sub_command {
    pub const DISTANCE: u8 = 0x03;
    pub const LED_MATRIX: u8 = 0x04;
    pub const BUZZER: u8 = 0x06;
    pub const RGB_LED: u8 = 0x07;
}

/// Value type carried in the command id of a device reply.
pub mod value_type {
    pub const BYTE: u8 = 0x01;
    pub const FLOAT: u8 = 0x02;
    pub const SHORT: u8 = 0x03;
    pub const TEXT: u8 = 0x04;
}

/// Ports used by the stock mBot wiring.
pub mod default_port {
    pub const DISTANCE: u8 = 0x01;
    pub const RGB_LED: u8 = 0x08;
    pub const BUZZER: u8 = 0x22;
    pub const LED_MATRIX: u8 = 0x29;
}

const RGB_LED_SLOT: u8 = 0x02;
const MATRIX_BITMAP: u8 = 0x02;

/// Names accepted by [`CommandRegistry::build`].
pub const COMMAND_NAMES: [&str; 5] = ["read_distance", "set_led", "buzz", "draw_matrix", "raw"];

/// Discriminant of a [`DecodedResponse`], used to correlate replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    Ack,
    Float32,
    Byte,
    Short,
    Text,
    Raw,
}

/// A frame interpreted according to the registry rules.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedResponse {
    Ack,
    Float32Reading { port: u8, value: f32 },
    ByteReading { port: u8, value: u8 },
    ShortReading { port: u8, value: i16 },
    Text { port: u8, value: String },
    /// Frames with no known interpretation, kept verbatim.
    RawBytes(Frame),
}

impl DecodedResponse {
    pub fn shape(&self) -> ResponseShape {
        match self {
            DecodedResponse::Ack => ResponseShape::Ack,
            DecodedResponse::Float32Reading { .. } => ResponseShape::Float32,
            DecodedResponse::ByteReading { .. } => ResponseShape::Byte,
            DecodedResponse::ShortReading { .. } => ResponseShape::Short,
            DecodedResponse::Text { .. } => ResponseShape::Text,
            DecodedResponse::RawBytes(_) => ResponseShape::Raw,
        }
    }

    /// The float value of a sensor reading, if this is one.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            DecodedResponse::Float32Reading { value, .. } => Some(*value),
            _ => None,
        }
    }
}

fn distance_port() -> u8 {
    default_port::DISTANCE
}

fn rgb_led_port() -> u8 {
    default_port::RGB_LED
}

fn buzzer_port() -> u8 {
    default_port::BUZZER
}

fn matrix_port() -> u8 {
    default_port::LED_MATRIX
}

/// Commands understood by the controller firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Command {
    /// Read the ultrasonic distance sensor. Replies with a float32.
    ReadDistance {
        #[serde(default = "distance_port")]
        port: u8,
    },
    /// Set an onboard RGB LED. Index 0 addresses every LED.
    SetLed {
        #[serde(default = "rgb_led_port")]
        port: u8,
        #[serde(default)]
        index: u8,
        red: u8,
        green: u8,
        blue: u8,
    },
    /// Sound the buzzer.
    Buzz {
        #[serde(default = "buzzer_port")]
        port: u8,
        tone: u8,
        duration_ms: u16,
    },
    /// Draw a 16-column bitmap on an LED matrix.
    DrawMatrix {
        #[serde(default = "matrix_port")]
        port: u8,
        #[serde(default)]
        x: u8,
        #[serde(default)]
        y: u8,
        columns: [u8; 16],
    },
    /// Any other command of the family.
    Raw {
        command_id: u8,
        port: u8,
        sub_command: u8,
        #[serde(default)]
        payload: Vec<u8>,
        #[serde(default)]
        expects: Option<ResponseShape>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ReadDistance { .. } => "read_distance",
            Command::SetLed { .. } => "set_led",
            Command::Buzz { .. } => "buzz",
            Command::DrawMatrix { .. } => "draw_matrix",
            Command::Raw { .. } => "raw",
        }
    }

    /// `(command id, port, sub-command)` header of the outbound frame.
    pub fn header(&self) -> (u8, u8, u8) {
        match self {
            Command::ReadDistance { port } => (command_id::READ, *port, sub_command::DISTANCE),
            Command::SetLed { port, .. } => (command_id::RUN, *port, sub_command::RGB_LED),
            Command::Buzz { port, .. } => (command_id::RUN, *port, sub_command::BUZZER),
            Command::DrawMatrix { port, .. } => (command_id::RUN, *port, sub_command::LED_MATRIX),
            Command::Raw {
                command_id,
                port,
                sub_command,
                ..
            } => (*command_id, *port, *sub_command),
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Command::ReadDistance { .. } => Vec::new(),
            Command::SetLed {
                index,
                red,
                green,
                blue,
                ..
            } => vec![RGB_LED_SLOT, *index, *red, *green, *blue],
            Command::Buzz {
                tone, duration_ms, ..
            } => {
                let duration = duration_ms.to_le_bytes();
                vec![*tone, duration[0], duration[1]]
            }
            Command::DrawMatrix { x, y, columns, .. } => {
                let mut payload = Vec::with_capacity(3 + columns.len());
                payload.extend_from_slice(&[MATRIX_BITMAP, *x, *y]);
                payload.extend_from_slice(columns);
                payload
            }
            Command::Raw { payload, .. } => payload.clone(),
        }
    }

    pub fn to_frame(&self) -> Frame {
        let (command_id, port, sub_command) = self.header();
        Frame::new(command_id, port, sub_command, self.encode_payload())
    }

    /// Wire bytes for this command.
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>, CodecError> {
        self.to_frame().encode_with_limit(max_payload)
    }

    /// Shape of the reply the device sends, or `None` for fire-and-forget
    /// commands.
    pub fn expected_response(&self) -> Option<ResponseShape> {
        match self {
            Command::ReadDistance { .. } => Some(ResponseShape::Float32),
            Command::Raw { expects, .. } => *expects,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ResponseRule {
    command_id: u8,
    sub_command: Option<u8>,
    shape: ResponseShape,
}

/// Maps command names to encoders and reply frames to decoded values.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    rules: Vec<ResponseRule>,
    max_payload: usize,
}

impl CommandRegistry {
    /// Registry with the stock reply rules.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        let rules = [
            (value_type::BYTE, ResponseShape::Byte),
            (value_type::FLOAT, ResponseShape::Float32),
            (value_type::SHORT, ResponseShape::Short),
            (value_type::TEXT, ResponseShape::Text),
        ]
        .into_iter()
        .map(|(command_id, shape)| ResponseRule {
            command_id,
            sub_command: None,
            shape,
        })
        .collect();

        Self { rules, max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Add a reply rule. `sub_command: None` matches any sub-command; a rule
    /// naming the sub-command takes precedence over it.
    pub fn register_response(
        &mut self,
        command_id: u8,
        sub_command: Option<u8>,
        shape: ResponseShape,
    ) {
        self.rules.retain(|r| !(r.command_id == command_id && r.sub_command == sub_command));
        self.rules.push(ResponseRule {
            command_id,
            sub_command,
            shape,
        });
    }

    /// Build a command from its name and a JSON object of arguments.
    pub fn build(&self, name: &str, args: &Value) -> Result<Command, RegistryError> {
        if !COMMAND_NAMES.contains(&name) {
            return Err(RegistryError::UnknownCommand(name.to_string()));
        }

        let invalid = |reason: String| RegistryError::InvalidArguments {
            command: name.to_string(),
            reason,
        };

        let args = match args {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => args.clone(),
            other => return Err(invalid(format!("expected an object, got {}", other))),
        };

        let mut tagged = serde_json::Map::new();
        tagged.insert(name.to_string(), args);
        let command: Command =
            serde_json::from_value(Value::Object(tagged)).map_err(|e| invalid(e.to_string()))?;

        self.validate(&command).map_err(invalid)?;
        Ok(command)
    }

    fn validate(&self, command: &Command) -> Result<(), String> {
        match command {
            Command::Buzz { duration_ms: 0, .. } => Err("duration_ms must be positive".to_string()),
            Command::Raw { payload, .. } if payload.len() > self.max_payload => Err(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                self.max_payload
            )),
            _ => Ok(()),
        }
    }

    fn shape_for(&self, command_id: u8, sub_command: u8) -> Option<ResponseShape> {
        let specific = self
            .rules
            .iter()
            .find(|r| r.command_id == command_id && r.sub_command == Some(sub_command));
        let wildcard = || {
            self.rules
                .iter()
                .find(|r| r.command_id == command_id && r.sub_command.is_none())
        };
        specific.or_else(wildcard).map(|r| r.shape)
    }

    /// Interpret a reply frame. Never fails: anything unrecognised comes
    /// back as [`DecodedResponse::RawBytes`].
    pub fn decode_response(&self, frame: &Frame) -> DecodedResponse {
        if frame.payload.is_empty() {
            return DecodedResponse::Ack;
        }

        let port = frame.port;
        let payload = frame.payload.as_slice();
        let decoded = match self.shape_for(frame.command_id, frame.sub_command) {
            Some(ResponseShape::Float32) => {
                decode_f32(payload).map(|value| DecodedResponse::Float32Reading { port, value })
            }
            Some(ResponseShape::Byte) => payload
                .last()
                .map(|&value| DecodedResponse::ByteReading { port, value }),
            Some(ResponseShape::Short) => tail::<2>(payload).map(|b| DecodedResponse::ShortReading {
                port,
                value: i16::from_le_bytes(b),
            }),
            Some(ResponseShape::Text) => Some(DecodedResponse::Text {
                port,
                value: String::from_utf8_lossy(payload).into_owned(),
            }),
            Some(ResponseShape::Ack) => Some(DecodedResponse::Ack),
            Some(ResponseShape::Raw) | None => None,
        };

        decoded.unwrap_or_else(|| {
            debug!("No decoding rule for {}", frame);
            DecodedResponse::RawBytes(frame.clone())
        })
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn tail<const N: usize>(payload: &[u8]) -> Option<[u8; N]> {
    payload
        .len()
        .checked_sub(N)
        .and_then(|start| payload[start..].try_into().ok())
}

/// The sensor sends its float least significant byte first; reverse into
/// network order before reading the IEEE-754 bits.
fn decode_f32(payload: &[u8]) -> Option<f32> {
    let mut raw = tail::<4>(payload)?;
    raw.reverse();
    Some(f32::from_be_bytes(raw))
}
