//! Client façade (spec §4.6).
//!
//! Method surface named after `qualipsolutions-pusher-rs`'s `PusherClient`
//! (`connect`/`disconnect`/`subscribe`/`unsubscribe`/`bind`/`trigger`/
//! `get_socket_id`/`is_connected`), composed with the teacher's
//! `ActionCableChannelBuilder` pattern for constructing the façade from a
//! `Config`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::channel::{ChannelKind, Handler};
use crate::config::Config;
use crate::connection::{Command, ConnectionController, ConnectionHandle, ConnectionState, DisconnectHandler};
use crate::error::{Error, Result};
use crate::registry::ErrorReporter;
use crate::transport::{Transport, WsTransport};

/// The client-facing entry point: owns a connection controller task and
/// exposes subscribe/unsubscribe/bind/unbind/trigger/listen (spec §4.6).
pub struct PusherClient {
    config: Config,
    handle: Option<ConnectionHandle>,
    join_handle: Option<tokio::task::JoinHandle<()>>,
    on_disconnect: Option<DisconnectHandler>,
    error_reporter: Option<Arc<dyn ErrorReporter>>,
}

impl std::fmt::Debug for PusherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PusherClient")
            .field("connected", &self.is_connected_sync())
            .finish()
    }
}

impl PusherClient {
    /// Build a client from `config`. Does not connect; call [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handle: None,
            join_handle: None,
            on_disconnect: None,
            error_reporter: None,
        }
    }

    /// Register a callback invoked once per connection loss — explicit
    /// `disconnect()` (`cause` is `None`), a dropped/reset socket, or
    /// reconnect attempts exhausting (`cause` is `Some`). Call before
    /// `connect`; a later call replaces the previous callback (spec §4.5).
    pub fn on_disconnect(&mut self, handler: impl Fn(Option<Error>) + Send + Sync + 'static) {
        self.on_disconnect = Some(Arc::new(handler));
    }

    /// Replace the default logging sink for panicking handlers (spec §6,
    /// "Error-reporting interface"). Call before `connect`.
    pub fn set_error_reporter(&mut self, reporter: Arc<dyn ErrorReporter>) {
        self.error_reporter = Some(reporter);
    }

    /// Open the connection using the default `tokio-tungstenite` transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if required config is missing, or
    /// whatever error the first handshake attempt produced
    /// ([`Error::Connection`]/[`Error::Protocol`]/[`Error::Timeout`]).
    /// Later, internal reconnect attempts after this call succeeds are not
    /// surfaced here — only the first attempt propagates synchronously
    /// (spec §7 propagation policy).
    pub async fn connect(&mut self) -> Result<()> {
        self.connect_with_transport(Box::new(WsTransport::new())).await
    }

    /// Like [`connect`](Self::connect) but with a caller-supplied transport
    /// — the seam integration tests use to drive the controller against a
    /// mock instead of a real socket (spec §2.4).
    pub async fn connect_with_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        self.config.validate()?;

        let (controller, handle, first_attempt) = ConnectionController::new(
            self.config.clone(),
            transport,
            self.on_disconnect.clone(),
            self.error_reporter.clone(),
        );
        let join_handle = tokio::spawn(controller.run());

        self.handle = Some(handle);
        self.join_handle = Some(join_handle);

        first_attempt
            .await
            .map_err(|_| Error::Connection("controller task ended before connecting".to_string()))?
    }

    /// Disconnect and stop the controller task. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = &self.handle {
            let _ = handle.command_tx.send(Command::Disconnect).await;
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
        self.handle = None;
    }

    /// Block until the controller task ends — explicit `disconnect` or
    /// exhausted reconnection attempts (spec §4.6).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] if called before `connect`.
    pub async fn listen(&mut self) -> Result<()> {
        let join_handle = self
            .join_handle
            .take()
            .ok_or_else(|| Error::Precondition("listen called before connect".to_string()))?;
        let _ = join_handle.await;
        Ok(())
    }

    /// Subscribe to `channel`, signing admission for restricted channels.
    /// `user_data` is required for presence channels (spec §4.2, §4.5).
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if `subscription_succeeded` does not arrive
    /// within `config.subscription_timeout`; [`Error::Authentication`] or
    /// [`Error::Subscription`] if the broker rejects the request;
    /// [`Error::Connection`] if not currently connected.
    pub async fn subscribe(&self, channel: &str, user_data: Option<Value>) -> Result<()> {
        let handle = self.handle()?;

        {
            let mut registry = handle.registry.lock().unwrap();
            registry.get_or_create(channel, user_data.clone());
        }

        let (responder, rx) = oneshot::channel();
        handle
            .command_tx
            .send(Command::Subscribe {
                name: channel.to_string(),
                user_data,
                responder,
            })
            .await
            .map_err(|_| Error::Connection("controller task is not running".to_string()))?;

        let timeout = std::time::Duration::from_secs_f64(self.config.subscription_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection("controller dropped the subscribe waiter".to_string())),
            Err(_) => Err(Error::Timeout(format!("subscribe({channel}) timed out"))),
        }
    }

    /// Unsubscribe from `channel`. Removes it from the registry regardless
    /// of server acknowledgement (spec §4.5).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if not currently connected.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let handle = self.handle()?;
        handle.registry.lock().unwrap().drop_channel(channel);
        handle
            .command_tx
            .send(Command::Unsubscribe { name: channel.to_string() })
            .await
            .map_err(|_| Error::Connection("controller task is not running".to_string()))
    }

    /// Register `handler` for `event` on `channel`, or globally if `channel`
    /// is `None`. Returns the handler so it can later be passed to
    /// [`unbind`](Self::unbind).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if not currently connected.
    pub fn bind(&self, channel: Option<&str>, event: &str, handler: Handler) -> Result<()> {
        let handle = self.handle()?;
        let mut registry = handle.registry.lock().unwrap();
        match channel {
            Some(channel) => registry.bind(channel, event, handler),
            None => registry.bind_global(event, handler),
        }
        Ok(())
    }

    /// Unregister `handler` for `event` on `channel`, or globally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if not currently connected.
    pub fn unbind(&self, channel: Option<&str>, event: &str, handler: &Handler) -> Result<()> {
        let handle = self.handle()?;
        let mut registry = handle.registry.lock().unwrap();
        match channel {
            Some(channel) => registry.unbind(channel, event, handler),
            None => registry.unbind_global(event, handler),
        }
        Ok(())
    }

    /// Emit a client event on a restricted, subscribed channel (spec §4.5).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] if `channel` is public or not yet
    /// subscribed, or [`Error::Connection`] if not currently connected.
    pub async fn trigger(&self, channel: &str, event: &str, data: Value) -> Result<()> {
        let handle = self.handle()?;

        {
            let registry = handle.registry.lock().unwrap();
            let entry = registry
                .get(channel)
                .ok_or_else(|| Error::Precondition(format!("trigger on unknown channel {channel}")))?;
            if !entry.kind().is_restricted() {
                return Err(Error::Precondition(format!(
                    "trigger not permitted on public channel {channel}"
                )));
            }
            if !entry.is_subscribed() {
                return Err(Error::Precondition(format!(
                    "trigger on unsubscribed channel {channel}"
                )));
            }
        }

        let event = if event.starts_with("client-") {
            event.to_string()
        } else {
            format!("client-{event}")
        };

        let (responder, rx) = oneshot::channel();
        handle
            .command_tx
            .send(Command::Trigger {
                channel: channel.to_string(),
                event,
                data,
                responder,
            })
            .await
            .map_err(|_| Error::Connection("controller task is not running".to_string()))?;

        rx.await
            .map_err(|_| Error::Connection("controller dropped the trigger responder".to_string()))?
    }

    /// The server-assigned socket id, if currently connected.
    pub async fn socket_id(&self) -> Option<String> {
        match &self.handle {
            Some(handle) => handle.state.read().await.socket_id().map(str::to_string),
            None => None,
        }
    }

    /// `true` iff the controller reports `Connected` state *and* the
    /// transport's own `is_open()` agreed as of the last point the
    /// controller checked it — the cached state alone is not authoritative,
    /// since keepalive or a peer close can transition the socket before the
    /// receive loop has returned (spec §4.6, §9 "Half-open detection").
    pub async fn is_connected(&self) -> bool {
        match &self.handle {
            Some(handle) => {
                matches!(*handle.state.read().await, ConnectionState::Connected { .. })
                    && handle.transport_open.load(std::sync::atomic::Ordering::Relaxed)
            }
            None => false,
        }
    }

    fn is_connected_sync(&self) -> bool {
        self.handle.is_some()
    }

    /// Names of every known channel (subscribed or pending).
    pub fn channels(&self) -> Result<Vec<String>> {
        let handle = self.handle()?;
        Ok(handle.registry.lock().unwrap().snapshot_names())
    }

    fn handle(&self) -> Result<&ConnectionHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::Connection("not connected".to_string()))
    }
}

/// Derive a channel's kind without going through a live client — useful for
/// callers deciding ahead of time whether `user_data` is required.
#[must_use]
pub fn channel_kind(name: &str) -> ChannelKind {
    ChannelKind::from_name(name)
}

/// RAII guard that disconnects the wrapped client when dropped is not
/// possible for an async teardown, so the scoped-acquisition form is a
/// function instead: run `body` with a connected client and always
/// disconnect afterward, success or error (spec §4.6, "scoped acquisition").
pub async fn with_connection<F, Fut, T>(config: Config, body: F) -> Result<T>
where
    F: FnOnce(Arc<tokio::sync::Mutex<PusherClient>>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let client = Arc::new(tokio::sync::Mutex::new(PusherClient::new(config)));
    client.lock().await.connect().await?;

    let result = body(client.clone()).await;

    client.lock().await.disconnect().await;
    result
}
