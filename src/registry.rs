//! Channel registry: creation, dispatch, and internal protocol-event
//! handling (spec §4.3).
//!
//! Generalized from the teacher's `subscriptions: HashMap<String,
//! mpsc::Sender<Value>>` + `handle_text_message` routing-by-`identifier`
//! (`hub/action_cable_connection.rs`) into per-channel + global handler
//! tables with exact-then-wildcard dispatch order and internal
//! protocol-event handling ahead of user dispatch.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::channel::{Channel, ChannelKind, Handler, HandlerTable};
use crate::codec::Envelope;

/// Names of the protocol events the registry intercepts before user
/// dispatch (spec §4.3).
mod internal_event {
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const MEMBER_REMOVED: &str = "pusher_internal:member_removed";
}

/// A pluggable sink for handler panics/errors (spec §6, "Error-reporting
/// interface"). Default implementation logs and continues.
pub trait ErrorReporter: Send + Sync {
    /// Called when a user handler panics while processing `event` on
    /// `channel` (`None` for global-scope dispatch).
    fn report(&self, event: &str, channel: Option<&str>, message: &str);
}

/// Default [`ErrorReporter`]: logs via the `log` facade and continues,
/// matching the teacher's `log::error!` convention throughout
/// `action_cable_connection.rs`.
#[derive(Debug, Default)]
pub struct LoggingErrorReporter;

impl ErrorReporter for LoggingErrorReporter {
    fn report(&self, event: &str, channel: Option<&str>, message: &str) {
        match channel {
            Some(channel) => log::error!("handler for {event} on {channel} panicked: {message}"),
            None => log::error!("global handler for {event} panicked: {message}"),
        }
    }
}

/// Owns every known channel plus the global (client-level) handler table.
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
    /// Names in the order they were first created — `HashMap` iteration
    /// order is unspecified, but `snapshot_names` must return creation
    /// order (spec §4.5 resubscribe-after-reconnect), so that order is
    /// tracked explicitly here rather than read off `channels.keys()`.
    order: Vec<String>,
    global: HandlerTable,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.order)
            .finish()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
            order: Vec::new(),
            global: HandlerTable::default(),
            error_reporter: Arc::new(LoggingErrorReporter),
        }
    }
}

impl ChannelRegistry {
    /// Build a registry with a custom [`ErrorReporter`].
    #[must_use]
    pub fn with_error_reporter(error_reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            channels: HashMap::new(),
            order: Vec::new(),
            global: HandlerTable::default(),
            error_reporter,
        }
    }

    /// Get the channel named `name`, creating it (in the unsubscribed
    /// state) if absent. `user_data` seeds presence channel admission and
    /// is only stored on first creation; subsequent calls leave an existing
    /// channel's stored `user_data` untouched unless `user_data` is `Some`.
    pub fn get_or_create(&mut self, name: &str, user_data: Option<Value>) -> &mut Channel {
        if !self.channels.contains_key(name) {
            self.order.push(name.to_string());
        }
        let channel = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name, user_data.clone()));
        if let Some(user_data) = user_data {
            channel.set_user_data(user_data);
        }
        channel
    }

    /// Look up a channel without creating it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Remove a channel from the registry irrespective of server
    /// acknowledgement (spec §4.5, unsubscribe).
    pub fn drop_channel(&mut self, name: &str) -> Option<Channel> {
        self.order.retain(|n| n != name);
        self.channels.remove(name)
    }

    /// Bind a handler on a specific channel's table. No-op if the channel
    /// does not exist.
    pub fn bind(&mut self, channel: &str, event: &str, handler: Handler) {
        if let Some(channel) = self.channels.get_mut(channel) {
            channel.handlers_mut().bind(event, handler);
        }
    }

    /// Unbind a handler from a specific channel's table.
    pub fn unbind(&mut self, channel: &str, event: &str, handler: &Handler) {
        if let Some(channel) = self.channels.get_mut(channel) {
            channel.handlers_mut().unbind(event, handler);
        }
    }

    /// Bind a handler on the global (client-level) table.
    pub fn bind_global(&mut self, event: &str, handler: Handler) {
        self.global.bind(event, handler);
    }

    /// Unbind a handler from the global table.
    pub fn unbind_global(&mut self, event: &str, handler: &Handler) {
        self.global.unbind(event, handler);
    }

    /// Names of every known channel, in creation order — used to
    /// re-subscribe after a reconnect (spec §4.5).
    #[must_use]
    pub fn snapshot_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Mark every channel unsubscribed and clear presence rosters, but keep
    /// each presence channel's `me` record so a subsequent reconnect can
    /// re-derive the roster (spec §4.3).
    pub fn mark_all_unsubscribed(&mut self) {
        for channel in self.channels.values_mut() {
            channel.set_subscribed(false);
            if let Some(roster) = channel.roster_mut() {
                roster.clear_members();
            }
        }
    }

    /// Route a decoded envelope: handle internal protocol events first,
    /// then dispatch to the channel's table (if any) and always to the
    /// global table (spec §4.3).
    pub fn dispatch(&mut self, envelope: &Envelope) {
        if let Some(channel_name) = &envelope.channel {
            self.handle_internal_event(channel_name, envelope);
        }

        if let Some(channel_name) = &envelope.channel {
            if let Some(channel) = self.channels.get(channel_name) {
                let handlers = channel.handlers().handlers_for(&envelope.event);
                self.invoke_all(&handlers, &envelope.event, Some(channel_name), &envelope.data);
            }
        }

        let handlers = self.global.handlers_for(&envelope.event);
        self.invoke_all(&handlers, &envelope.event, envelope.channel.as_deref(), &envelope.data);
    }

    fn handle_internal_event(&mut self, channel_name: &str, envelope: &Envelope) {
        let Some(channel) = self.channels.get_mut(channel_name) else {
            return;
        };

        match envelope.event.as_str() {
            internal_event::SUBSCRIPTION_SUCCEEDED => {
                channel.set_subscribed(true);
                if matches!(channel.kind(), ChannelKind::Presence) {
                    if let Some(hash) = envelope.data.get("hash").and_then(Value::as_object) {
                        let hash: HashMap<String, Value> =
                            hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                        if let Some(roster) = channel.roster_mut() {
                            roster.seed(&hash);
                        }
                    }
                    if let Some(user_data) = channel.user_data().cloned() {
                        if let (Some(user_id), roster) =
                            (user_data.get("user_id").and_then(Value::as_str).map(str::to_string), channel.roster_mut())
                        {
                            if let Some(roster) = roster {
                                let user_info = user_data
                                    .get("user_info")
                                    .cloned()
                                    .unwrap_or(Value::Null);
                                roster.me = Some((user_id, user_info));
                            }
                        }
                    }
                }
            }
            internal_event::MEMBER_ADDED => {
                if let Some(roster) = channel.roster_mut() {
                    if let (Some(user_id), user_info) = (
                        envelope.data.get("user_id").and_then(Value::as_str),
                        envelope.data.get("user_info").cloned().unwrap_or(Value::Null),
                    ) {
                        roster.add(user_id, user_info);
                    }
                }
            }
            internal_event::MEMBER_REMOVED => {
                if let Some(roster) = channel.roster_mut() {
                    if let Some(user_id) = envelope.data.get("user_id").and_then(Value::as_str) {
                        roster.remove(user_id);
                    }
                }
            }
            _ => {}
        }
    }

    fn invoke_all(&self, handlers: &[Handler], event: &str, channel: Option<&str>, data: &Value) {
        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(event, data, channel)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                self.error_reporter.report(event, channel, &message);
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn get_or_create_derives_kind() {
        let mut registry = ChannelRegistry::default();
        let channel = registry.get_or_create("presence-chat.1", None);
        assert_eq!(channel.kind(), ChannelKind::Presence);
    }

    #[test]
    fn snapshot_names_preserves_creation_order() {
        // HashMap iteration order is unspecified; this would be flaky if
        // snapshot_names() read straight off `channels.keys()` instead of
        // the tracked `order` vec (spec §4.5 resubscribe-after-reconnect
        // requires "in the order they were first created").
        let mut registry = ChannelRegistry::default();
        let names = ["zeta", "alpha", "private-room.7", "mu", "presence-chat.1"];
        for name in names {
            registry.get_or_create(name, None);
        }
        // Re-creating an already-known channel must not move or duplicate it.
        registry.get_or_create("alpha", None);
        assert_eq!(registry.snapshot_names(), names.to_vec());
    }

    #[test]
    fn dropped_channel_is_removed_from_creation_order() {
        let mut registry = ChannelRegistry::default();
        registry.get_or_create("a", None);
        registry.get_or_create("b", None);
        registry.get_or_create("c", None);
        registry.drop_channel("b");
        assert_eq!(registry.snapshot_names(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn subscription_succeeded_sets_subscribed_and_seeds_roster() {
        let mut registry = ChannelRegistry::default();
        registry.get_or_create(
            "presence-chat.1",
            Some(json!({"user_id": "u1", "user_info": {"name": "alice"}})),
        );

        let envelope = Envelope::for_channel(
            "pusher_internal:subscription_succeeded",
            "presence-chat.1",
            json!({"hash": {"u1": {"name": "alice"}}}),
        );
        registry.dispatch(&envelope);

        let channel = registry.get("presence-chat.1").unwrap();
        assert!(channel.is_subscribed());
        let roster = channel.roster().unwrap();
        assert_eq!(roster.members().get("u1"), Some(&json!({"name": "alice"})));
        assert_eq!(roster.me, Some(("u1".to_string(), json!({"name": "alice"}))));
    }

    #[test]
    fn member_lifecycle_via_dispatch() {
        let mut registry = ChannelRegistry::default();
        registry.get_or_create("presence-chat.1", None);
        registry.dispatch(&Envelope::for_channel(
            "pusher_internal:subscription_succeeded",
            "presence-chat.1",
            json!({"hash": {"u1": {"name": "alice"}}}),
        ));
        registry.dispatch(&Envelope::for_channel(
            "pusher_internal:member_added",
            "presence-chat.1",
            json!({"user_id": "u2", "user_info": {"name": "bob"}}),
        ));
        registry.dispatch(&Envelope::for_channel(
            "pusher_internal:member_removed",
            "presence-chat.1",
            json!({"user_id": "u1"}),
        ));

        let roster = registry.get("presence-chat.1").unwrap().roster().unwrap();
        let mut expected = HashMap::new();
        expected.insert("u2".to_string(), json!({"name": "bob"}));
        assert_eq!(roster.members(), &expected);
    }

    #[test]
    fn dispatch_reaches_exact_then_wildcard_then_global() {
        let mut registry = ChannelRegistry::default();
        registry.get_or_create("orders", None);

        let order: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        registry.bind("orders", "shipped", Arc::new(move |_, _, _| o1.lock().unwrap().push("channel-exact")));
        let o2 = order.clone();
        registry.bind("orders", "*", Arc::new(move |_, _, _| o2.lock().unwrap().push("channel-wildcard")));
        let o3 = order.clone();
        registry.bind_global("shipped", Arc::new(move |_, _, _| o3.lock().unwrap().push("global")));

        registry.dispatch(&Envelope::for_channel("shipped", "orders", Value::Null));

        assert_eq!(
            *order.lock().unwrap(),
            vec!["channel-exact", "channel-wildcard", "global"]
        );
    }

    #[test]
    fn mark_all_unsubscribed_clears_members_but_keeps_me() {
        let mut registry = ChannelRegistry::default();
        registry.get_or_create("presence-chat.1", Some(json!({"user_id": "u1", "user_info": {}})));
        registry.dispatch(&Envelope::for_channel(
            "pusher_internal:subscription_succeeded",
            "presence-chat.1",
            json!({"hash": {"u1": {}}}),
        ));

        registry.mark_all_unsubscribed();

        let channel = registry.get("presence-chat.1").unwrap();
        assert!(!channel.is_subscribed());
        let roster = channel.roster().unwrap();
        assert!(roster.members().is_empty());
        assert!(roster.me.is_some());
    }

    #[test]
    fn handler_panic_does_not_stop_subsequent_handlers() {
        let mut registry = ChannelRegistry::default();
        registry.get_or_create("orders", None);

        let calls = Arc::new(AtomicUsize::new(0));
        registry.bind("orders", "tick", Arc::new(|_, _, _| panic!("boom")));
        let calls2 = calls.clone();
        registry.bind("orders", "tick", Arc::new(move |_, _, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch(&Envelope::for_channel("tick", "orders", Value::Null));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn member_removed_for_unknown_user_is_noop() {
        let mut registry = ChannelRegistry::default();
        registry.get_or_create("presence-chat.1", None);
        registry.dispatch(&Envelope::for_channel(
            "pusher_internal:member_removed",
            "presence-chat.1",
            json!({"user_id": "ghost"}),
        ));
        assert!(registry
            .get("presence-chat.1")
            .unwrap()
            .roster()
            .unwrap()
            .members()
            .is_empty());
    }
}
