// Library modules
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod signer;
pub mod transport;

// Re-export commonly used types
pub use channel::{Channel, ChannelKind, Handler, PresenceRoster};
pub use client::PusherClient;
pub use codec::Envelope;
pub use config::Config;
pub use connection::{ConnectionState, DisconnectHandler};
pub use error::{Error, Result};
pub use registry::{ChannelRegistry, ErrorReporter};
pub use signer::{sign_presence, sign_private, Admission};
pub use transport::{Received, Transport, WsTransport};
