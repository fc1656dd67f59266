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

//! Session state machine and request/response correlation.
//!
//! One spawned task owns the connection state, the reassembly buffer, the
//! command queue and the single in-flight request slot. Callers reach it
//! through a request channel; the transport reaches it through an event
//! channel. Nothing protocol-related is shared across threads.
//!
//! The protocol has no sequence numbers, so a reply is matched to the
//! in-flight request purely by its decoded shape. Only one request may be in
//! flight; later ones wait in FIFO order. Frames that do not match are
//! unsolicited telemetry and fan out to subscribers.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::bluetooth::{Transport, TransportEvent};
use crate::config::ProtocolConfig;
use crate::error::{Result, SessionError, TransportError};
use crate::protocol::{
    Command, CommandRegistry, DecodedResponse, Frame, FrameReassembler, ResponseShape,
    DEFAULT_MAX_PAYLOAD,
};
use crate::state::{ConnectionState, LinkStats, LinkStatsSnapshot};

const REQUEST_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Payload ceiling for both directions.
    pub max_payload: usize,
    /// Deadline used by [`Session::request`].
    pub response_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            response_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&ProtocolConfig> for SessionConfig {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            max_payload: config.max_payload,
            response_timeout: config.response_timeout(),
        }
    }
}

pub type SubscriptionId = u64;

/// An inbound frame no request was waiting for.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub frame: Frame,
    pub response: DecodedResponse,
}

type TelemetryHandler = Box<dyn FnMut(&TelemetryEvent) -> anyhow::Result<()> + Send>;
type Reply<T> = oneshot::Sender<Result<T>>;

enum SessionRequest {
    Start {
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Send {
        name: &'static str,
        bytes: Vec<u8>,
        expects: Option<ResponseShape>,
        timeout: Duration,
        reply: Reply<DecodedResponse>,
    },
    Subscribe {
        handler: TelemetryHandler,
        reply: Reply<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Reply<bool>,
    },
}

struct QueuedCommand {
    token: u64,
    name: &'static str,
    bytes: Vec<u8>,
    expects: Option<ResponseShape>,
    timeout: Duration,
    reply: Reply<DecodedResponse>,
}

struct PendingRequest {
    token: u64,
    name: &'static str,
    expects: ResponseShape,
    timeout: Duration,
    deadline: Instant,
    reply: Reply<DecodedResponse>,
}

/// Reply still owed to a cancelled request.
struct Orphan {
    token: u64,
    expects: ResponseShape,
    until: Instant,
}

struct Subscriber {
    id: SubscriptionId,
    handler: TelemetryHandler,
}

/// Handle to a running session.
pub struct Session {
    requests: mpsc::Sender<SessionRequest>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<LinkStats>,
    registry: Arc<CommandRegistry>,
    config: SessionConfig,
    task: JoinHandle<()>,
}

impl Session {
    /// Spawn a session over `transport` with the stock command registry.
    pub fn spawn<T: Transport>(transport: T, config: SessionConfig) -> Self {
        let registry = CommandRegistry::with_max_payload(config.max_payload);
        Self::with_registry(transport, registry, config)
    }

    /// Spawn a session with a customised registry. The registry's payload
    /// ceiling applies to both directions.
    pub fn with_registry<T: Transport>(
        transport: T,
        registry: CommandRegistry,
        mut config: SessionConfig,
    ) -> Self {
        config.max_payload = registry.max_payload();

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let stats = LinkStats::new();
        let registry = Arc::new(registry);

        let task = SessionTask::new(
            transport,
            registry.clone(),
            requests_rx,
            state_tx,
            stats.clone(),
        );

        Self {
            requests: requests_tx,
            state: state_rx,
            stats,
            registry,
            config,
            task: tokio::spawn(task.run()),
        }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> SessionRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Begin scanning for the robot. Only valid while disconnected.
    pub async fn start(&self) -> Result<()> {
        self.call(|reply| SessionRequest::Start { reply }).await
    }

    /// Wait until the link is ready for commands.
    ///
    /// Fails if the link falls back to `Disconnected` first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let wait = async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Disconnected => return Err(SessionError::NotReady(current)),
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return Err(SessionError::Closed);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SessionError::NotReady(self.connection_state()))?
    }

    /// Close the link and fail any outstanding commands.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(|reply| SessionRequest::Disconnect { reply }).await
    }

    /// Send a command and wait for its reply.
    ///
    /// The deadline starts when the command is written, not while it waits
    /// behind another request. Commands without a reply resolve with
    /// [`DecodedResponse::Ack`] once written. Dropping the returned future
    /// cancels the command.
    pub async fn send_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<DecodedResponse> {
        let bytes = command.encode(self.config.max_payload)?;

        let state = self.connection_state();
        if !state.is_ready() {
            return Err(SessionError::NotReady(state));
        }

        self.call(|reply| SessionRequest::Send {
            name: command.name(),
            bytes,
            expects: command.expected_response(),
            timeout,
            reply,
        })
        .await
    }

    /// [`Session::send_command`] with the configured default deadline.
    pub async fn request(&self, command: Command) -> Result<DecodedResponse> {
        self.send_command(command, self.config.response_timeout).await
    }

    /// Build a command by name from JSON arguments and send it.
    pub async fn send_named(
        &self,
        name: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<DecodedResponse> {
        let command = self.registry.build(name, args)?;
        self.send_command(command, timeout).await
    }

    /// Register a handler for unsolicited frames.
    ///
    /// Handlers run on the session task in registration order. Keep them
    /// short; an error or panic is logged and delivery continues.
    pub async fn subscribe_telemetry<F>(&self, handler: F) -> Result<SubscriptionId>
    where
        F: FnMut(&TelemetryEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let handler: TelemetryHandler = Box::new(handler);
        self.call(|reply| SessionRequest::Subscribe { handler, reply })
            .await
    }

    /// Remove a telemetry handler. Returns whether it was registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.call(|reply| SessionRequest::Unsubscribe { id, reply }).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver observing every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Stop the session task, closing the link if it is open.
    pub async fn shutdown(self) {
        drop(self.requests);
        if let Err(e) = self.task.await {
            error!("Session task ended abnormally: {}", e);
        }
    }
}

struct SessionTask<T> {
    transport: T,
    registry: Arc<CommandRegistry>,
    reassembler: FrameReassembler,
    state: watch::Sender<ConnectionState>,
    stats: Arc<LinkStats>,
    requests: mpsc::Receiver<SessionRequest>,
    events_tx: mpsc::Sender<TransportEvent>,
    events: mpsc::Receiver<TransportEvent>,
    queue: VecDeque<QueuedCommand>,
    in_flight: Option<PendingRequest>,
    orphans: Vec<Orphan>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// Resolves when the caller waiting on the in-flight request goes away.
async fn reply_dropped(slot: &mut Option<PendingRequest>) {
    match slot {
        Some(pending) => pending.reply.closed().await,
        None => std::future::pending().await,
    }
}

impl<T: Transport> SessionTask<T> {
    fn new(
        transport: T,
        registry: Arc<CommandRegistry>,
        requests: mpsc::Receiver<SessionRequest>,
        state: watch::Sender<ConnectionState>,
        stats: Arc<LinkStats>,
    ) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        Self {
            transport,
            reassembler: FrameReassembler::with_max_payload(registry.max_payload()),
            registry,
            state,
            stats,
            requests,
            events_tx,
            events,
            queue: VecDeque::new(),
            in_flight: None,
            orphans: Vec::new(),
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    async fn run(mut self) {
        debug!("Session task started");

        loop {
            let deadline = self.in_flight.as_ref().map(|p| p.deadline);

            tokio::select! {
                biased;
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = reply_dropped(&mut self.in_flight) => self.cancel_in_flight().await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_in_flight().await
                }
            }
        }

        if self.current_state() != ConnectionState::Disconnected {
            if let Err(e) = self.transport.close().await {
                warn!("Error closing transport: {}", e);
            }
            self.teardown(TransportError::ConnectionLost("session shut down".to_string()));
        }
        debug!("Session task stopped");
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Connection state: {} -> {}", previous, next);
        }
    }

    /// Move `from -> to`, ignoring events that arrive out of order.
    fn advance(&mut self, from: ConnectionState, to: ConnectionState) -> bool {
        let current = self.current_state();
        if current != from {
            warn!("Ignoring transition to {} while {}", to, current);
            return false;
        }
        self.set_state(to);
        true
    }

    async fn handle_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            SessionRequest::Disconnect { reply } => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            SessionRequest::Send {
                name,
                bytes,
                expects,
                timeout,
                reply,
            } => {
                let state = self.current_state();
                if !state.is_ready() {
                    let _ = reply.send(Err(SessionError::NotReady(state)));
                    return;
                }

                self.next_id += 1;
                self.queue.push_back(QueuedCommand {
                    token: self.next_id,
                    name,
                    bytes,
                    expects,
                    timeout,
                    reply,
                });
                if self.in_flight.is_some() {
                    debug!(
                        "Command '{}' queued behind in-flight request ({} waiting)",
                        name,
                        self.queue.len()
                    );
                }
                self.pump().await;
            }
            SessionRequest::Subscribe { handler, reply } => {
                self.next_id += 1;
                let id = self.next_id;
                self.subscribers.push(Subscriber { id, handler });
                debug!("Telemetry subscriber {} registered", id);
                let _ = reply.send(Ok(id));
            }
            SessionRequest::Unsubscribe { id, reply } => {
                let before = self.subscribers.len();
                self.subscribers.retain(|s| s.id != id);
                let _ = reply.send(Ok(self.subscribers.len() != before));
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        let state = self.current_state();
        if state != ConnectionState::Disconnected {
            return Err(SessionError::InvalidState {
                operation: "start",
                state,
            });
        }

        // Anything still queued belongs to the previous link.
        while let Ok(event) = self.events.try_recv() {
            debug!("Dropping stale transport event: {:?}", event);
        }

        self.reassembler.reset();
        self.set_state(ConnectionState::Scanning);
        info!("Session starting, scanning for device");

        if let Err(e) = self.transport.open(self.events_tx.clone()).await {
            error!("Failed to open transport: {}", e);
            self.set_state(ConnectionState::Disconnected);
            return Err(e.into());
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.current_state() == ConnectionState::Disconnected {
            return Ok(());
        }

        info!("Disconnecting");
        self.set_state(ConnectionState::Disconnecting);
        let result = self.transport.close().await;
        self.teardown(TransportError::ConnectionLost(
            "disconnected by caller".to_string(),
        ));
        result.map_err(Into::into)
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::AdvertisementMatched { name, address } => {
                info!("Device matched: {} [{}]", name, address);
                if self.advance(ConnectionState::Scanning, ConnectionState::Connecting) {
                    self.stats.set_device(Some(name));
                }
            }
            TransportEvent::Connected => {
                self.advance(ConnectionState::Connecting, ConnectionState::Discovering);
            }
            TransportEvent::CharacteristicsFound => {
                if self.advance(ConnectionState::Discovering, ConnectionState::Ready) {
                    info!("Session ready");
                }
            }
            TransportEvent::Notification(data) => self.handle_notification(&data).await,
            TransportEvent::Disconnected { reason } => {
                if self.current_state() == ConnectionState::Disconnected {
                    debug!("Ignoring disconnect while already disconnected: {}", reason);
                    return;
                }
                warn!("Transport disconnected: {}", reason);
                self.teardown(TransportError::ConnectionLost(reason));
            }
        }
    }

    async fn handle_notification(&mut self, data: &[u8]) {
        debug!("Notification: {}", hex::encode(data));
        self.stats.record_notification(data.len());

        let frames: Vec<Frame> = self.reassembler.feed(data).collect();
        self.stats.set_protocol_errors(self.reassembler.protocol_errors());

        for frame in frames {
            self.stats.record_frame();
            self.route(frame);
        }
        self.pump().await;
    }

    fn route(&mut self, frame: Frame) {
        let response = self.registry.decode_response(&frame);
        let shape = response.shape();

        let now = Instant::now();
        self.orphans.retain(|o| o.until > now);
        if let Some(pos) = self.orphans.iter().position(|o| o.expects == shape) {
            let orphan = self.orphans.remove(pos);
            info!(
                "Late reply for cancelled request #{} delivered as telemetry",
                orphan.token
            );
            self.publish(frame, response);
            return;
        }

        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|pending| pending.expects == shape);

        match self.in_flight.take() {
            Some(pending) if matches => {
                debug!("Reply for #{} '{}': {:?}", pending.token, pending.name, response);
                if let Err(unsent) = pending.reply.send(Ok(response)) {
                    info!(
                        "Request #{} '{}' cancelled before its reply, delivered as telemetry",
                        pending.token, pending.name
                    );
                    self.stats.record_cancelled();
                    if let Ok(response) = unsent {
                        self.publish(frame, response);
                    }
                }
            }
            other => {
                self.in_flight = other;
                self.publish(frame, response);
            }
        }
    }

    fn publish(&mut self, frame: Frame, response: DecodedResponse) {
        self.stats.record_telemetry();

        if self.subscribers.is_empty() {
            debug!("Unsolicited frame with no subscribers: {}", frame);
            return;
        }

        let event = TelemetryEvent { frame, response };
        for subscriber in &mut self.subscribers {
            let handler = &mut subscriber.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Telemetry handler {} failed: {:#}", subscriber.id, e),
                Err(_) => error!("Telemetry handler {} panicked", subscriber.id),
            }
        }
    }

    /// Write queued commands until one is waiting for a reply.
    async fn pump(&mut self) {
        while self.in_flight.is_none() {
            let Some(command) = self.queue.pop_front() else {
                break;
            };

            if command.reply.is_closed() {
                debug!("Skipping cancelled command #{} '{}'", command.token, command.name);
                self.stats.record_cancelled();
                continue;
            }

            debug!(
                "Writing #{} '{}': {}",
                command.token,
                command.name,
                hex::encode(&command.bytes)
            );
            if let Err(e) = self.transport.write(&command.bytes).await {
                error!("Write of '{}' failed: {}", command.name, e);
                self.fail_link(e.clone()).await;
                let _ = command.reply.send(Err(e.into()));
                return;
            }
            self.stats.record_sent();

            match command.expects {
                Some(expects) => {
                    self.in_flight = Some(PendingRequest {
                        token: command.token,
                        name: command.name,
                        expects,
                        timeout: command.timeout,
                        deadline: Instant::now() + command.timeout,
                        reply: command.reply,
                    });
                }
                None => {
                    let _ = command.reply.send(Ok(DecodedResponse::Ack));
                }
            }
        }
    }

    async fn expire_in_flight(&mut self) {
        if let Some(pending) = self.in_flight.take() {
            warn!(
                "No reply for #{} '{}' within {:?}",
                pending.token, pending.name, pending.timeout
            );
            self.stats.record_timeout();
            let _ = pending
                .reply
                .send(Err(SessionError::ResponseTimeout(pending.timeout)));
        }
        self.pump().await;
    }

    async fn cancel_in_flight(&mut self) {
        if let Some(pending) = self.in_flight.take() {
            info!("Request #{} '{}' cancelled by caller", pending.token, pending.name);
            self.stats.record_cancelled();
            self.orphans.push(Orphan {
                token: pending.token,
                expects: pending.expects,
                until: pending.deadline,
            });
        }
        self.pump().await;
    }

    /// A transport failure takes the whole link down.
    async fn fail_link(&mut self, error: TransportError) {
        self.set_state(ConnectionState::Disconnecting);
        if let Err(e) = self.transport.close().await {
            warn!("Error closing transport: {}", e);
        }
        self.teardown(error);
    }

    fn teardown(&mut self, error: TransportError) {
        self.set_state(ConnectionState::Disconnected);
        if let Some(pending) = self.in_flight.take() {
            let _ = pending.reply.send(Err(error.clone().into()));
        }
        for command in self.queue.drain(..) {
            let _ = command.reply.send(Err(error.clone().into()));
        }
        self.orphans.clear();
        self.reassembler.reset();
        self.stats.set_device(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::MemoryTransport;
    use crate::protocol::value_type;

    const WAIT: Duration = Duration::from_secs(2);

    fn distance_reply(value: f32) -> Vec<u8> {
        let mut payload = vec![0x02, 0x00];
        payload.extend_from_slice(&value.to_le_bytes());
        Frame::new(value_type::FLOAT, 0x08, 0x07, payload)
            .encode()
            .unwrap()
    }

    fn read_distance() -> Command {
        Command::ReadDistance { port: 0x01 }
    }

    async fn ready_session(transport: MemoryTransport) -> Arc<Session> {
        let session = Session::spawn(transport, SessionConfig::default());
        session.start().await.unwrap();
        session.wait_ready(WAIT).await.unwrap();
        Arc::new(session)
    }

    async fn wait_state(session: &Session, expected: ConnectionState) {
        let mut states = session.state_changes();
        tokio::time::timeout(WAIT, states.wait_for(|s| *s == expected))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_state_machine_ignores_out_of_order_events() {
        let transport = MemoryTransport::manual();
        let session = Session::spawn(transport.clone(), SessionConfig::default());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        session.start().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Scanning);

        transport
            .emit(TransportEvent::AdvertisementMatched {
                name: "Makeblock_LE".to_string(),
                address: "AA:BB".to_string(),
            })
            .await
            .unwrap();
        wait_state(&session, ConnectionState::Connecting).await;

        // Skipping Discovering must be refused.
        transport.emit(TransportEvent::CharacteristicsFound).await.unwrap();
        transport.emit(TransportEvent::Connected).await.unwrap();
        wait_state(&session, ConnectionState::Discovering).await;

        transport.emit(TransportEvent::CharacteristicsFound).await.unwrap();
        wait_state(&session, ConnectionState::Ready).await;
        assert_eq!(session.stats().device.as_deref(), Some("Makeblock_LE"));
    }

    #[tokio::test]
    async fn test_commands_rejected_until_ready() {
        let session = Session::spawn(MemoryTransport::manual(), SessionConfig::default());
        assert_eq!(
            session.send_command(read_distance(), WAIT).await,
            Err(SessionError::NotReady(ConnectionState::Disconnected))
        );

        session.start().await.unwrap();
        assert_eq!(
            session.start().await,
            Err(SessionError::InvalidState {
                operation: "start",
                state: ConnectionState::Scanning
            })
        );
        assert_eq!(
            session.send_command(read_distance(), WAIT).await,
            Err(SessionError::NotReady(ConnectionState::Scanning))
        );
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_before_write() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        let raw = Command::Raw {
            command_id: 0x02,
            port: 0x00,
            sub_command: 0x00,
            payload: vec![0; 300],
            expects: None,
        };
        assert!(matches!(
            session.send_command(raw, WAIT).await,
            Err(SessionError::Codec(_))
        ));
        assert!(matches!(
            session.send_named("warp_drive", &Value::Null, WAIT).await,
            Err(SessionError::Registry(_))
        ));
        assert_eq!(transport.write_count(), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_resolves_with_ack() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        let led = Command::SetLed {
            port: 0x08,
            index: 0,
            red: 0,
            green: 0,
            blue: 0xFF,
        };
        assert_eq!(session.send_command(led, WAIT).await, Ok(DecodedResponse::Ack));
        assert_eq!(transport.write_count(), 1);
        assert_eq!(session.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_frees_slot_and_late_reply_is_telemetry() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        let (tx, mut telemetry) = mpsc::unbounded_channel();
        session
            .subscribe_telemetry(move |event| {
                tx.send(event.response.clone())?;
                Ok(())
            })
            .await
            .unwrap();

        let s = session.clone();
        let first = tokio::spawn(async move { s.send_command(read_distance(), WAIT).await });
        assert!(transport.wait_for_writes(1, WAIT).await);
        first.abort();

        let s = session.clone();
        let second = tokio::spawn(async move { s.send_command(read_distance(), WAIT).await });
        assert!(transport.wait_for_writes(2, WAIT).await);

        transport.notify(&distance_reply(1.0)).await.unwrap();
        transport.notify(&distance_reply(2.0)).await.unwrap();

        let reply = second.await.unwrap().unwrap();
        assert_eq!(reply.as_f32(), Some(2.0));
        assert_eq!(telemetry.recv().await.and_then(|r| r.as_f32()), Some(1.0));
        assert_eq!(session.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_handler_failures_do_not_stop_delivery() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        session
            .subscribe_telemetry(|_| Err(anyhow::anyhow!("handler refused")))
            .await
            .unwrap();
        let noisy = session
            .subscribe_telemetry(|_| panic!("handler exploded"))
            .await
            .unwrap();
        let (tx, mut seen) = mpsc::unbounded_channel();
        session
            .subscribe_telemetry(move |event| {
                tx.send(event.frame.clone())?;
                Ok(())
            })
            .await
            .unwrap();

        transport.notify(&distance_reply(5.0)).await.unwrap();
        assert_eq!(seen.recv().await.map(|f| f.port), Some(0x08));

        assert_eq!(session.unsubscribe(noisy).await, Ok(true));
        assert_eq!(session.unsubscribe(noisy).await, Ok(false));

        transport.notify(&distance_reply(6.0)).await.unwrap();
        assert!(seen.recv().await.is_some());
        assert_eq!(session.stats().telemetry_frames, 2);
    }

    #[tokio::test]
    async fn test_write_failure_resets_to_disconnected() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        transport.fail_next_writes(1);
        let result = session.send_command(read_distance(), WAIT).await;
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::WriteFailed(_)))
        ));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.close_count(), 1);

        // Reconnection is an explicit caller decision.
        session.start().await.unwrap();
        session.wait_ready(WAIT).await.unwrap();
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_event_fails_outstanding_requests() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        let s = session.clone();
        let first = tokio::spawn(async move { s.send_command(read_distance(), WAIT).await });
        let s = session.clone();
        assert!(transport.wait_for_writes(1, WAIT).await);
        let second = tokio::spawn(async move { s.send_command(read_distance(), WAIT).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport
            .emit(TransportEvent::Disconnected {
                reason: "out of range".to_string(),
            })
            .await
            .unwrap();

        let lost = Err(SessionError::Transport(TransportError::ConnectionLost(
            "out of range".to_string(),
        )));
        assert_eq!(first.await.unwrap(), lost);
        assert_eq!(second.await.unwrap(), lost);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.write_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_queued_command_is_never_written() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        let s = session.clone();
        let first = tokio::spawn(async move { s.send_command(read_distance(), WAIT).await });
        assert!(transport.wait_for_writes(1, WAIT).await);

        let s = session.clone();
        let second = tokio::spawn(async move { s.send_command(read_distance(), WAIT).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        second.abort();
        assert!(second.await.unwrap_err().is_cancelled());

        let led = Command::SetLed {
            port: 0x08,
            index: 0,
            red: 0,
            green: 0xFF,
            blue: 0,
        };
        let led_bytes = led.encode(DEFAULT_MAX_PAYLOAD).unwrap();
        let s = session.clone();
        let third = tokio::spawn(async move { s.send_command(led, WAIT).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.write_count(), 1);

        transport.notify(&distance_reply(12.0)).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap().as_f32(), Some(12.0));
        assert_eq!(third.await.unwrap(), Ok(DecodedResponse::Ack));

        let read_bytes = read_distance().encode(DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(transport.writes(), vec![read_bytes, led_bytes]);
        assert_eq!(session.stats().cancelled, 1);
    }

    #[test]
    fn test_reply_after_caller_dropped_is_telemetry() {
        let (_requests, requests_rx) = mpsc::channel(1);
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Ready);
        let stats = LinkStats::new();
        let mut task = SessionTask::new(
            MemoryTransport::manual(),
            Arc::new(CommandRegistry::new()),
            requests_rx,
            state_tx,
            stats.clone(),
        );

        let (tx, mut seen) = mpsc::unbounded_channel();
        task.subscribers.push(Subscriber {
            id: 1,
            handler: Box::new(move |event| {
                tx.send(event.response.clone())?;
                Ok(())
            }),
        });

        // The caller is gone but the session has not noticed yet.
        let (reply, response) = oneshot::channel();
        drop(response);
        task.in_flight = Some(PendingRequest {
            token: 1,
            name: "read_distance",
            expects: ResponseShape::Float32,
            timeout: WAIT,
            deadline: Instant::now() + WAIT,
            reply,
        });

        let frame = Frame::new(
            value_type::FLOAT,
            0x08,
            0x07,
            vec![0x02, 0x00, 0x00, 0x00, 0xC8, 0x41],
        );
        task.route(frame);

        assert!(task.in_flight.is_none());
        assert_eq!(seen.try_recv().ok().and_then(|r| r.as_f32()), Some(25.0));
        assert_eq!(stats.snapshot().cancelled, 1);
        assert_eq!(stats.snapshot().telemetry_frames, 1);
    }

    #[tokio::test]
    async fn test_truncated_reply_does_not_answer_request() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        let s = session.clone();
        let read = tokio::spawn(async move { s.send_command(read_distance(), WAIT).await });
        assert!(transport.wait_for_writes(1, WAIT).await);

        let reply = distance_reply(25.0);
        transport.notify(&reply[..6]).await.unwrap();
        transport.notify(&reply).await.unwrap();

        assert_eq!(
            read.await.unwrap(),
            Ok(DecodedResponse::Float32Reading {
                port: 0x08,
                value: 25.0
            })
        );
        assert_eq!(session.stats().protocol_errors, 1);
    }

    #[tokio::test]
    async fn test_disconnect_passes_through_disconnecting() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;
        transport.set_close_delay(Duration::from_millis(100));

        let s = session.clone();
        let disconnect = tokio::spawn(async move { s.disconnect().await });
        wait_state(&session, ConnectionState::Disconnecting).await;
        assert_eq!(
            session.send_command(read_distance(), WAIT).await,
            Err(SessionError::NotReady(ConnectionState::Disconnecting))
        );

        disconnect.await.unwrap().unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_caller_disconnect() {
        let transport = MemoryTransport::new();
        let session = ready_session(transport.clone()).await;

        session.disconnect().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.close_count(), 1);

        // Already disconnected: nothing to do.
        session.disconnect().await.unwrap();
        assert_eq!(transport.close_count(), 1);
    }
}
