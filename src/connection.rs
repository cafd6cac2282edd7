//! Connection controller: handshake, receive/keepalive loops, and the
//! reconnect supervisor (spec §4.5, §5).
//!
//! Grounded on the teacher's `action_cable.rs::{run_connection_loop,
//! run_message_loop, connect_websocket}` for the overall shape — one loop
//! owns send/recv/health-check via `tokio::select!`, exponential backoff
//! with jitter between attempts — and on
//! `hub/action_cable_connection.rs` for the re-subscribe-after-reconnect
//! step over a persisted subscription set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::channel::ChannelKind;
use crate::codec::{self, Envelope};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{ChannelRegistry, ErrorReporter};
use crate::signer;
use crate::transport::{Received, Transport};

/// Matches the teacher's 10s welcome-wait timeout (`connect_websocket`'s
/// `welcome_timeout`), generalized to `pusher:connection_established`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-level state (spec §3). `socket_id` is defined iff the state
/// is `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { socket_id: String },
    Reconnecting { attempt: u32 },
    Closing,
    Closed,
}

impl ConnectionState {
    /// The socket id, if currently connected.
    #[must_use]
    pub fn socket_id(&self) -> Option<&str> {
        match self {
            Self::Connected { socket_id } => Some(socket_id),
            _ => None,
        }
    }
}

/// Reconnection policy state (spec §3). `attempt` resets to 0 on every
/// successful connection.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectState {
    pub attempt: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_frac: f64,
}

impl ReconnectState {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempt: 0,
            base_delay: Duration::from_secs_f64(config.reconnect_delay_min),
            max_delay: Duration::from_secs_f64(config.reconnect_delay_max),
            multiplier: config.reconnect_multiplier,
            jitter_frac: 0.25,
        }
    }
}

/// `delay = min(base x multiplier^attempt, max_delay) x (1 + jitter_frac x
/// jitter_sample)` (spec §3 invariant). `jitter_sample` is expected in
/// `[0, 1)`; production callers pass `rand::random::<f64>()`, tests pass a
/// fixed value to check the nominal sequence.
#[must_use]
pub fn compute_backoff(state: &ReconnectState, jitter_sample: f64) -> Duration {
    let nominal = state.base_delay.as_secs_f64() * state.multiplier.powi(state.attempt as i32);
    let capped = nominal.min(state.max_delay.as_secs_f64());
    let factor = 1.0 + state.jitter_frac * jitter_sample.clamp(0.0, 1.0);
    Duration::from_secs_f64(capped * factor)
}

/// How the receive loop ended — both paths converge on one
/// `handle_connection_lost` call (spec §9, resolved open question).
#[derive(Debug)]
enum LoopExit {
    /// Caller requested `disconnect`; do not reconnect.
    Shutdown,
    /// Peer closed cleanly, or the transport raised an error. `expected`
    /// distinguishes a clean server close (codes 1000/1001) from every
    /// other close code or transport exception (spec §4.5 "Termination
    /// paths").
    Lost { error: Error, expected: bool },
}

/// Operations the façade issues that must go through the controller's
/// single transport writer (spec §5, "single writer" policy). Pure
/// registry mutations (bind/unbind) do not need to cross this channel —
/// the façade applies those directly under the registry lock.
pub(crate) enum Command {
    Subscribe {
        name: String,
        user_data: Option<Value>,
        responder: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        name: String,
    },
    Trigger {
        channel: String,
        event: String,
        data: Value,
        responder: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

/// A callback invoked once per connection loss, after `mark_all_unsubscribed`
/// and subscribe-waiter rejection have already run for that close, and
/// before any envelope from a subsequent reconnect reaches user handlers
/// (spec §4.5 "Connection-lost handler", §8 ordering invariant).
/// `cause` is `None` for an explicit `disconnect()`.
pub type DisconnectHandler = Arc<dyn Fn(Option<Error>) + Send + Sync>;

/// Shared state + channel the client façade uses to drive a running
/// controller task.
pub struct ConnectionHandle {
    pub(crate) command_tx: mpsc::Sender<Command>,
    pub(crate) state: Arc<RwLock<ConnectionState>>,
    pub(crate) registry: Arc<Mutex<ChannelRegistry>>,
    /// Mirrors the controller's `Transport::is_open()` at the last point the
    /// controller touched the transport. `is_connected` ANDs this with
    /// `state == Connected` so a stale cached state can never report
    /// connected once the socket itself is known to be down (spec §4.6,
    /// §9 "Half-open detection").
    pub(crate) transport_open: Arc<AtomicBool>,
}

/// Owns the transport and both internal loops. Runs as a single task; the
/// façade communicates with it over `command_tx` and reads shared state via
/// `state`/`registry`.
pub struct ConnectionController {
    transport: Box<dyn Transport>,
    registry: Arc<Mutex<ChannelRegistry>>,
    config: Config,
    state: Arc<RwLock<ConnectionState>>,
    command_rx: mpsc::Receiver<Command>,
    subscribe_waiters: HashMap<String, oneshot::Sender<Result<()>>>,
    /// Resolved once, with the outcome of the very first handshake attempt,
    /// so `PusherClient::connect` can propagate that result synchronously
    /// while later reconnect attempts stay internal (spec §7 propagation
    /// policy).
    first_attempt: Option<oneshot::Sender<Result<()>>>,
    on_disconnect: Option<DisconnectHandler>,
    transport_open: Arc<AtomicBool>,
}

impl ConnectionController {
    /// Build a controller plus the handle the façade will hold on to.
    #[must_use]
    pub fn new(
        config: Config,
        transport: Box<dyn Transport>,
        on_disconnect: Option<DisconnectHandler>,
        error_reporter: Option<Arc<dyn ErrorReporter>>,
    ) -> (Self, ConnectionHandle, oneshot::Receiver<Result<()>>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let registry = Arc::new(Mutex::new(match error_reporter {
            Some(reporter) => ChannelRegistry::with_error_reporter(reporter),
            None => ChannelRegistry::default(),
        }));
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let transport_open = Arc::new(AtomicBool::new(false));
        let (first_attempt_tx, first_attempt_rx) = oneshot::channel();

        let handle = ConnectionHandle {
            command_tx,
            state: state.clone(),
            registry: registry.clone(),
            transport_open: transport_open.clone(),
        };

        let controller = Self {
            transport,
            registry,
            config,
            state,
            command_rx,
            subscribe_waiters: HashMap::new(),
            first_attempt: Some(first_attempt_tx),
            on_disconnect,
            transport_open,
        };

        (controller, handle, first_attempt_rx)
    }

    /// Resync the shared `transport_open` flag from the transport's own
    /// `is_open()`. Called at every point the controller's view of the
    /// transport's liveness may have changed, so `PusherClient::is_connected`
    /// never reports `true` off a stale cached flag (spec §4.6, §9).
    fn sync_transport_open(&self) {
        self.transport_open.store(self.transport.is_open(), Ordering::Relaxed);
    }

    fn url(&self) -> String {
        format!(
            "{}://{}:{}/app/{}?protocol=7&client=reverb-client&version={}",
            self.config.scheme,
            self.config.host,
            self.config.port,
            self.config.app_key,
            env!("CARGO_PKG_VERSION"),
        )
    }

    /// Drive the connection until the caller sends `Command::Disconnect` or
    /// `reconnect_max_attempts` is exhausted.
    pub async fn run(mut self) {
        let mut reconnect = ReconnectState::from_config(&self.config);

        loop {
            *self.state.write().await = ConnectionState::Connecting;

            match self.handshake().await {
                Ok(socket_id) => {
                    log::info!("connected, socket_id={socket_id}");
                    *self.state.write().await = ConnectionState::Connected { socket_id };
                    reconnect.attempt = 0;
                    if let Some(notify) = self.first_attempt.take() {
                        let _ = notify.send(Ok(()));
                    }

                    self.resubscribe_all().await;

                    match self.run_message_loop().await {
                        LoopExit::Shutdown => {
                            *self.state.write().await = ConnectionState::Closing;
                            self.handle_connection_lost(None).await;
                            *self.state.write().await = ConnectionState::Closed;
                            break;
                        }
                        LoopExit::Lost { error, expected } => {
                            if expected {
                                log::info!("connection closed cleanly: {error}");
                                self.handle_connection_lost(None).await;
                            } else {
                                self.handle_connection_lost(Some(error)).await;
                            }
                        }
                    }
                }
                Err(err) => {
                    log::warn!("handshake failed: {err}");
                    if let Some(notify) = self.first_attempt.take() {
                        let _ = notify.send(Err(err.clone()));
                    }
                    self.transport.close().await;
                    self.sync_transport_open();
                }
            }

            if !self.config.reconnect_enabled {
                *self.state.write().await = ConnectionState::Disconnected;
                break;
            }

            if let Some(max) = self.config.reconnect_max_attempts {
                if reconnect.attempt >= max {
                    log::warn!("reconnect attempts exhausted ({max}), giving up");
                    *self.state.write().await = ConnectionState::Closed;
                    if let Some(on_disconnect) = &self.on_disconnect {
                        on_disconnect(Some(Error::Connection(format!(
                            "reconnect attempts exhausted ({max})"
                        ))));
                    }
                    break;
                }
            }

            let delay = compute_backoff(&reconnect, rand::random::<f64>());
            *self.state.write().await = ConnectionState::Reconnecting {
                attempt: reconnect.attempt,
            };
            log::info!("reconnecting in {:.2}s (attempt {})", delay.as_secs_f64(), reconnect.attempt);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                command = self.command_rx.recv() => {
                    if matches!(command, Some(Command::Disconnect) | None) {
                        *self.state.write().await = ConnectionState::Closed;
                        break;
                    }
                }
            }

            reconnect.attempt += 1;
        }
    }

    /// Open the transport and wait for exactly one
    /// `pusher:connection_established` envelope (spec §4.5).
    async fn handshake(&mut self) -> Result<String> {
        let url = self.url();
        self.transport.open(&url).await?;
        self.sync_transport_open();

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.transport.recv())
            .await
            .map_err(|_| Error::Protocol("handshake timed out waiting for connection_established".to_string()))??;

        let Received::Text(text) = first else {
            return Err(Error::Protocol("transport closed during handshake".to_string()));
        };

        let envelope = codec::decode(&text)?;
        if envelope.event != "pusher:connection_established" {
            return Err(Error::Protocol(format!(
                "expected pusher:connection_established, got {}",
                envelope.event
            )));
        }

        envelope
            .data
            .get("socket_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("connection_established missing socket_id".to_string()))
    }

    /// Re-send a subscribe for every channel already known to the registry,
    /// in creation order, after a (re)connect (spec §4.5, §8 scenario 5).
    async fn resubscribe_all(&mut self) {
        let names = self.registry.lock().unwrap().snapshot_names();
        for name in names {
            let user_data = self
                .registry
                .lock()
                .unwrap()
                .get(&name)
                .and_then(|c| c.user_data().cloned());
            if let Err(err) = self.send_subscribe(&name, user_data).await {
                log::warn!("resubscribe failed for {name}: {err}");
            }
        }
    }

    async fn run_message_loop(&mut self) -> LoopExit {
        let ping_interval = Duration::from_secs_f64(self.config.ping_interval);
        let mut ticker = tokio::time::interval(ping_interval);
        let mut last_activity = Instant::now();
        let mut sent_idle_ping = false;

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(Command::Disconnect) | None => return LoopExit::Shutdown,
                        Some(command) => {
                            self.handle_command(command).await;
                        }
                    }
                }

                received = self.transport.recv() => {
                    last_activity = Instant::now();
                    sent_idle_ping = false;
                    self.sync_transport_open();

                    match received {
                        Ok(Received::Text(text)) => {
                            if let Err(error) = self.handle_incoming(&text).await {
                                return LoopExit::Lost { error, expected: false };
                            }
                        }
                        Ok(Received::Closed { code, reason }) => {
                            // Clean server close (1000 "normal" / 1001 "going
                            // away") vs. any other code — spec §4.5
                            // "Termination paths".
                            let expected = matches!(code, 1000 | 1001);
                            return LoopExit::Lost {
                                error: Error::Connection(format!(
                                    "server closed connection: {code} {reason}"
                                )),
                                expected,
                            };
                        }
                        Err(error) => return LoopExit::Lost { error, expected: false },
                    }
                }

                _ = ticker.tick() => {
                    let idle = last_activity.elapsed();
                    if idle > ping_interval * 2 {
                        return LoopExit::Lost {
                            error: Error::Connection(
                                "no activity within 2x ping_interval, treating as half-open".to_string(),
                            ),
                            expected: false,
                        };
                    } else if idle > ping_interval && !sent_idle_ping {
                        if let Err(error) = self.send_envelope(&ping_envelope()).await {
                            return LoopExit::Lost { error, expected: false };
                        }
                        sent_idle_ping = true;
                    }
                }
            }
        }
    }

    /// Handle a façade-issued command. Send failures are reported to the
    /// command's own responder, if any, rather than killing the message
    /// loop directly — a broken transport will also surface on the next
    /// `recv` branch of the `select!` above. Resyncs `transport_open`
    /// unconditionally afterward so a write failure is reflected in
    /// `is_connected()` immediately rather than waiting for that next `recv`.
    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { name, user_data, responder } => {
                match self.send_subscribe(&name, user_data).await {
                    Ok(()) => {
                        self.subscribe_waiters.insert(name, responder);
                    }
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                }
            }
            Command::Unsubscribe { name } => {
                let _ = self
                    .send_envelope(&Envelope::for_channel("pusher:unsubscribe", name, Value::Null))
                    .await;
            }
            Command::Trigger { channel, event, data, responder } => {
                let result = self
                    .send_envelope(&Envelope::for_channel(event, channel, data))
                    .await;
                let _ = responder.send(result);
            }
            Command::Disconnect => {}
        }
        self.sync_transport_open();
    }

    async fn send_subscribe(&mut self, name: &str, user_data: Option<Value>) -> Result<()> {
        let kind = ChannelKind::from_name(name);
        let socket_id = self
            .state
            .read()
            .await
            .socket_id()
            .map(str::to_string)
            .unwrap_or_default();

        let data = match kind {
            ChannelKind::Public => serde_json::json!({ "channel": name }),
            ChannelKind::Private => {
                let admission = signer::sign_private(
                    &self.config.app_key,
                    &self.config.app_secret,
                    &socket_id,
                    name,
                )?;
                serde_json::json!({ "channel": name, "auth": admission.auth })
            }
            ChannelKind::Presence => {
                let admission = signer::sign_presence(
                    &self.config.app_key,
                    &self.config.app_secret,
                    &socket_id,
                    name,
                    user_data.as_ref(),
                )?;
                serde_json::json!({
                    "channel": name,
                    "auth": admission.auth,
                    "channel_data": admission.channel_data,
                })
            }
        };

        self.send_envelope(&Envelope::for_channel("pusher:subscribe", name, data))
            .await
    }

    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let bytes = codec::encode(envelope)?;
        self.transport.send(&bytes).await
    }

    async fn handle_incoming(&mut self, text: &str) -> Result<()> {
        let envelope = match codec::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!("dropping malformed envelope: {err}");
                return Ok(());
            }
        };

        match envelope.event.as_str() {
            "pusher:ping" => {
                self.send_envelope(&pong_envelope()).await?;
            }
            "pusher:pong" => {
                // Liveness is already recorded by the `last_activity` reset
                // in the `select!` loop's receive branch; spec §4.5 step 3
                // says only to "note liveness and continue" — never hand a
                // pong to the registry for user dispatch.
            }
            "pusher:error" => {
                self.handle_server_error(&envelope);
            }
            "pusher_internal:subscription_succeeded" => {
                self.registry.lock().unwrap().dispatch(&envelope);
                if let Some(channel) = &envelope.channel {
                    if let Some(waiter) = self.subscribe_waiters.remove(channel) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            _ => {
                self.registry.lock().unwrap().dispatch(&envelope);
            }
        }

        Ok(())
    }

    /// `pusher:error` never terminates the connection (spec §9, resolved
    /// open question); it is dispatched as a global `error` event, and if it
    /// names a channel with a pending subscribe waiter, rejects that waiter.
    fn handle_server_error(&mut self, envelope: &Envelope) {
        let message = envelope
            .data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown server error")
            .to_string();

        if let Some(channel) = &envelope.channel {
            if let Some(waiter) = self.subscribe_waiters.remove(channel) {
                let err = if message.to_lowercase().contains("auth") {
                    Error::authentication(channel, message.clone())
                } else {
                    Error::subscription(channel, message.clone())
                };
                let _ = waiter.send(Err(err));
            }
        }

        let error_envelope = Envelope {
            event: "error".to_string(),
            channel: envelope.channel.clone(),
            data: envelope.data.clone(),
        };
        self.registry.lock().unwrap().dispatch(&error_envelope);
    }

    /// Converge both receive-loop termination paths on one routine (spec §9).
    /// Only called once a handshake has actually succeeded and the message
    /// loop later ends — a failed handshake attempt never reaches here, so
    /// `on_disconnect` does not fire for reconnect attempts that never
    /// established a connection. `on_disconnect` itself fires last, after
    /// every other effect of this close has already landed — the ordering
    /// spec §8 requires.
    async fn handle_connection_lost(&mut self, cause: Option<Error>) {
        if let Some(err) = &cause {
            log::warn!("connection lost: {err}");
        }
        self.transport.close().await;
        self.sync_transport_open();
        self.registry.lock().unwrap().mark_all_unsubscribed();

        for (_, waiter) in self.subscribe_waiters.drain() {
            let _ = waiter.send(Err(Error::Connection("connection lost before subscription resolved".to_string())));
        }

        if let Some(on_disconnect) = &self.on_disconnect {
            on_disconnect(cause);
        }
    }
}

/// `pusher:ping` with an empty data object, per spec §4.5/§6 — mirrors
/// `create_ping_event`'s `.with_json_data(json!({}))` in the pack's
/// Pusher-protocol reference crate rather than sending no `data` at all.
fn ping_envelope() -> Envelope {
    Envelope {
        event: "pusher:ping".to_string(),
        channel: None,
        data: Value::Object(serde_json::Map::new()),
    }
}

/// `pusher:pong{}` — see [`ping_envelope`].
fn pong_envelope() -> Envelope {
    Envelope {
        event: "pusher:pong".to_string(),
        channel: None,
        data: Value::Object(serde_json::Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(attempt: u32) -> ReconnectState {
        ReconnectState {
            attempt,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_frac: 0.25,
        }
    }

    #[test]
    fn nominal_backoff_sequence_matches_scenario() {
        // spec §8 scenario 5: 1,2,4,8,16,30,30 before jitter.
        let expected = [1.0, 2.0, 4.0, 8.0, 16.0, 30.0, 30.0];
        for (attempt, expected_secs) in expected.iter().enumerate() {
            let delay = compute_backoff(&state(attempt as u32), 0.0);
            assert!(
                (delay.as_secs_f64() - expected_secs).abs() < 1e-9,
                "attempt {attempt}: expected {expected_secs}, got {}",
                delay.as_secs_f64()
            );
        }
    }

    #[test]
    fn ping_and_pong_carry_empty_data_object() {
        assert_eq!(ping_envelope().data, Value::Object(serde_json::Map::new()));
        assert_eq!(pong_envelope().data, Value::Object(serde_json::Map::new()));
    }

    #[test]
    fn backoff_stays_within_jittered_bounds() {
        for attempt in 0..10 {
            for jitter in [0.0, 0.3, 0.7, 0.999] {
                let s = state(attempt);
                let delay = compute_backoff(&s, jitter).as_secs_f64();
                assert!(delay >= s.base_delay.as_secs_f64().min(delay));
                assert!(delay <= s.max_delay.as_secs_f64() * (1.0 + s.jitter_frac) + 1e-9);
            }
        }
    }

    #[test]
    fn backoff_is_monotonic_up_to_cap() {
        let mut previous = 0.0;
        for attempt in 0..8 {
            let delay = compute_backoff(&state(attempt), 0.0).as_secs_f64();
            assert!(delay >= previous);
            previous = delay;
        }
    }
}
