//! HMAC-SHA256 admission signing for restricted (`private-`/`presence-`)
//! channels (spec §4.2).
//!
//! Mirrors the one existing HMAC usage in the teacher crate
//! (`relay/ratchet.rs`'s `Hmac<Sha256>`), generalized from session-ratchet
//! key derivation to the Pusher admission-string convention: sign
//! `"{socket_id}:{channel}"` (optionally with a trailing `:{channel_data}`
//! for presence channels), hex-encode, and prefix with the app key.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// An admission token and, for presence channels, the `channel_data` string
/// that must accompany it on the wire byte-for-byte as signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// `"{app_key}:{hex_hmac}"`.
    pub auth: String,
    /// Present only for presence channels; the exact string that was
    /// signed and that must be sent verbatim as `data.channel_data`.
    pub channel_data: Option<String>,
}

/// Sign a private-channel subscribe request.
///
/// # Errors
///
/// Returns [`Error::Precondition`] if `socket_id` is empty.
pub fn sign_private(app_key: &str, app_secret: &str, socket_id: &str, channel: &str) -> Result<Admission> {
    if socket_id.is_empty() {
        return Err(Error::Precondition(
            "socket_id must be known before signing a subscribe request".to_string(),
        ));
    }

    let message = format!("{socket_id}:{channel}");
    let auth = format!("{app_key}:{}", hex_hmac(app_secret, &message));

    Ok(Admission {
        auth,
        channel_data: None,
    })
}

/// Sign a presence-channel subscribe request.
///
/// `user_data` must already be in the exact key order the caller wants on
/// the wire — it is serialized once, and that same byte string is both
/// signed and returned as `channel_data`. It is never re-serialized or
/// re-ordered between signing and sending (spec §9, "presence signing
/// order").
///
/// # Errors
///
/// Returns [`Error::Precondition`] if `socket_id` is empty, or
/// [`Error::Configuration`] if `user_data` is `None`.
pub fn sign_presence(
    app_key: &str,
    app_secret: &str,
    socket_id: &str,
    channel: &str,
    user_data: Option<&Value>,
) -> Result<Admission> {
    if socket_id.is_empty() {
        return Err(Error::Precondition(
            "socket_id must be known before signing a subscribe request".to_string(),
        ));
    }

    let user_data = user_data.ok_or_else(|| {
        Error::Configuration(format!("presence channel {channel} requires user_data"))
    })?;

    let channel_data = serde_json::to_string(user_data)
        .map_err(|e| Error::Configuration(format!("user_data is not serializable: {e}")))?;

    let message = format!("{socket_id}:{channel}:{channel_data}");
    let auth = format!("{app_key}:{}", hex_hmac(app_secret, &message));

    Ok(Admission {
        auth,
        channel_data: Some(channel_data),
    })
}

fn hex_hmac(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
