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

//! Periodic distance polling.

use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::error::{Result, SessionError};
use crate::protocol::Command;
use crate::session::Session;

/// Yellow, then blue.
const LED_COLOURS: [(u8, u8, u8); 2] = [(0xFF, 0xFF, 0x00), (0x00, 0x00, 0xFF)];

/// Reads the ultrasonic sensor on a fixed interval.
///
/// Each tick waits for its reply before the next one starts, so a slow
/// robot never builds up a backlog of reads.
pub struct DistancePoller {
    config: PollerConfig,
    timeout: Duration,
    led_phase: usize,
    last_distance: Option<f32>,
}

impl DistancePoller {
    pub fn new(config: PollerConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            led_phase: 0,
            last_distance: None,
        }
    }

    pub fn last_distance(&self) -> Option<f32> {
        self.last_distance
    }

    /// Poll until the session stops being usable.
    ///
    /// Missed replies are logged and polling continues. Returns the error
    /// that ended the loop.
    pub async fn run(&mut self, session: &Session) -> SessionError {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.tick(session).await {
                Ok(_) => {}
                Err(SessionError::ResponseTimeout(timeout)) => {
                    warn!("Distance read timed out after {:?}", timeout);
                }
                Err(e) => return e,
            }
        }
    }

    /// One poll: optionally flip the LEDs, then read the distance.
    pub async fn tick(&mut self, session: &Session) -> Result<Option<f32>> {
        if self.config.alternate_leds {
            let command = self.next_led_command();
            session.send_command(command, self.timeout).await?;
        }

        let read = Command::ReadDistance {
            port: self.config.distance_port,
        };
        let response = session.send_command(read, self.timeout).await?;

        match response.as_f32() {
            Some(distance) => {
                info!("Distance: {}", distance);
                self.last_distance = Some(distance);
                Ok(Some(distance))
            }
            None => {
                warn!("Unexpected reply to distance read: {:?}", response);
                Ok(None)
            }
        }
    }

    fn next_led_command(&mut self) -> Command {
        let (red, green, blue) = LED_COLOURS[self.led_phase];
        self.led_phase = (self.led_phase + 1) % LED_COLOURS.len();
        debug!("LED colour #{:02X}{:02X}{:02X}", red, green, blue);

        Command::SetLed {
            port: self.config.led_port,
            index: 0,
            red,
            green,
            blue,
        }
    }
}
