//! Per-channel state: kind derivation, handler tables, presence roster
//! (spec §3).
//!
//! Generalized from the teacher's `ChannelConfig`/`ConnectionState` shapes
//! (`channel/mod.rs`), which model one fixed per-connection channel, into a
//! named, kind-discriminated channel each with its own handler table — this
//! crate multiplexes many channels over one connection.

use std::collections::HashMap;

use serde_json::Value;

/// The three channel kinds Pusher distinguishes by name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// No authentication required to subscribe.
    Public,
    /// Requires an HMAC admission token.
    Private,
    /// Requires an HMAC admission token and carries a presence roster.
    Presence,
}

impl ChannelKind {
    /// Derive a channel's kind from its name, per the `private-`/`presence-`
    /// prefix convention.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("presence-") {
            Self::Presence
        } else if name.starts_with("private-") {
            Self::Private
        } else {
            Self::Public
        }
    }

    /// True for `Private` and `Presence` — the kinds that require an
    /// admission token to subscribe.
    #[must_use]
    pub fn is_restricted(self) -> bool {
        !matches!(self, Self::Public)
    }
}

/// A handler callback, type-erased. Owned by the caller that registered it;
/// the registry holds only `Arc` clones so unbind drops the registry's
/// reference without affecting any clone the caller kept.
pub type Handler = std::sync::Arc<
    dyn Fn(&str, &Value, Option<&str>) + Send + Sync + 'static,
>;

/// An ordered table of handlers keyed by event name, with `*` as the
/// wildcard bucket (spec §3, §4.3).
#[derive(Default)]
pub struct HandlerTable {
    exact: HashMap<String, Vec<Handler>>,
    wildcard: Vec<Handler>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("events", &self.exact.keys().collect::<Vec<_>>())
            .field("wildcard_count", &self.wildcard.len())
            .finish()
    }
}

impl HandlerTable {
    /// Register a handler for `event`, or for every event if `event == "*"`.
    pub fn bind(&mut self, event: &str, handler: Handler) {
        if event == "*" {
            self.wildcard.push(handler);
        } else {
            self.exact.entry(event.to_string()).or_default().push(handler);
        }
    }

    /// Remove every handler registered for `event` that is `Arc::ptr_eq` to
    /// `handler`. Restores the table to its prior shape (spec §8 round-trip
    /// property: `bind` then `unbind` is a no-op on the table's shape).
    pub fn unbind(&mut self, event: &str, handler: &Handler) {
        if event == "*" {
            self.wildcard.retain(|h| !std::sync::Arc::ptr_eq(h, handler));
        } else if let Some(handlers) = self.exact.get_mut(event) {
            handlers.retain(|h| !std::sync::Arc::ptr_eq(h, handler));
            if handlers.is_empty() {
                self.exact.remove(event);
            }
        }
    }

    /// Exact-match handlers for `event`, in registration order, followed by
    /// wildcard handlers in registration order (spec §4.3 dispatch rule).
    pub fn handlers_for(&self, event: &str) -> Vec<Handler> {
        let mut ordered = self.exact.get(event).cloned().unwrap_or_default();
        ordered.extend(self.wildcard.iter().cloned());
        ordered
    }
}

/// The presence roster for a `presence-` channel: currently-joined members
/// plus the local user's own record (spec §3).
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    members: HashMap<String, Value>,
    /// `(user_id, user_info)` for the local subscriber. Retained across
    /// `mark_all_unsubscribed` so a reconnect can re-derive the roster.
    pub me: Option<(String, Value)>,
}

impl PresenceRoster {
    /// Replace the roster wholesale from a `subscription_succeeded` hash.
    pub fn seed(&mut self, hash: &HashMap<String, Value>) {
        self.members = hash.clone();
    }

    /// Apply a `member_added` event.
    pub fn add(&mut self, user_id: impl Into<String>, user_info: Value) {
        self.members.insert(user_id.into(), user_info);
    }

    /// Apply a `member_removed` event. A removal for an unknown user_id is a
    /// no-op (spec §8 boundary behavior).
    pub fn remove(&mut self, user_id: &str) {
        self.members.remove(user_id);
    }

    /// Clear all members but retain `me`, per `mark_all_unsubscribed`.
    pub fn clear_members(&mut self) {
        self.members.clear();
    }

    /// Read-only view of the current members.
    #[must_use]
    pub fn members(&self) -> &HashMap<String, Value> {
        &self.members
    }
}

/// A single named channel: kind, subscription state, handler table, and
/// (for presence channels) a roster.
#[derive(Debug)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
    subscribed: bool,
    handlers: HandlerTable,
    roster: Option<PresenceRoster>,
    /// `user_data` supplied at `get_or_create` time, retained so a reconnect
    /// can re-sign the same presence payload.
    user_data: Option<Value>,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, user_data: Option<Value>) -> Self {
        let name = name.into();
        let kind = ChannelKind::from_name(&name);
        let roster = matches!(kind, ChannelKind::Presence).then(PresenceRoster::default);
        Self {
            name,
            kind,
            subscribed: false,
            handlers: HandlerTable::default(),
            roster,
            user_data,
        }
    }

    /// The channel's name, as supplied at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The channel's kind, derived from its name prefix.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Whether `subscription_succeeded` has been observed since the last
    /// `mark_all_unsubscribed` or creation.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub(crate) fn set_subscribed(&mut self, subscribed: bool) {
        self.subscribed = subscribed;
    }

    /// User data supplied when this channel was created; `None` for
    /// non-presence channels or presence channels created without it yet.
    #[must_use]
    pub fn user_data(&self) -> Option<&Value> {
        self.user_data.as_ref()
    }

    pub(crate) fn set_user_data(&mut self, user_data: Value) {
        self.user_data = Some(user_data);
    }

    /// The presence roster, if this is a presence channel.
    #[must_use]
    pub fn roster(&self) -> Option<&PresenceRoster> {
        self.roster.as_ref()
    }

    pub(crate) fn roster_mut(&mut self) -> Option<&mut PresenceRoster> {
        self.roster.as_mut()
    }

    pub(crate) fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub(crate) fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }
}
