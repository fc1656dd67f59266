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

//! Host-side bridge to the mBot robot controller over Bluetooth LE.
//!
//! The [`session::Session`] owns one link to the robot, frames commands
//! with [`protocol`], and correlates replies. Platform Bluetooth sits behind
//! [`bluetooth::Transport`].

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod state;

pub use error::{Result, SessionError, TransportError};
pub use session::{Session, SessionConfig, TelemetryEvent};
pub use state::ConnectionState;
