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

//! mBot BLE bridge.
//!
//! Connects to the robot and logs its distance sensor until interrupted.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mbot_ble_bridge::bluetooth::BluezTransport;
use mbot_ble_bridge::config::Config;
use mbot_ble_bridge::poller::DistancePoller;
use mbot_ble_bridge::{Session, SessionConfig};

/// Slack on top of the scan and discovery timeouts for connecting.
const CONNECT_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mbot_ble_bridge=info".parse()?),
        )
        .init();

    info!("Starting mBot BLE bridge v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let transport = BluezTransport::new(config.bluetooth.clone());
    let session = Session::spawn(transport, SessionConfig::from(&config.protocol));

    session
        .subscribe_telemetry(|event| {
            info!("Telemetry from port {:#04x}: {:?}", event.frame.port, event.response);
            Ok(())
        })
        .await?;

    session.start().await.context("starting BLE session")?;
    let ready_timeout =
        config.bluetooth.scan_timeout() + config.bluetooth.discovery_timeout() + CONNECT_GRACE;
    session
        .wait_ready(ready_timeout)
        .await
        .with_context(|| format!("waiting for '{}'", config.bluetooth.device_name))?;

    info!(
        "Ready. Polling distance every {:?}",
        config.poller.interval()
    );

    let mut poller = DistancePoller::new(config.poller.clone(), config.protocol.response_timeout());
    tokio::select! {
        e = poller.run(&session) => {
            error!("Polling stopped: {}", e);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    if let Err(e) = session.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    info!("Link stats: {:?}", session.stats());
    session.shutdown().await;

    info!("mBot BLE bridge stopped");
    Ok(())
}
