//! Shared data model and wire protocol for the exposer control plane.
//!
//! The agent and the edge server exchange [`Message`] values over a
//! persistent TCP connection using a length-prefixed JSON framing
//! ([`codec`]). [`Connection`] wraps the agent side of that link and
//! serializes concurrent senders; [`Backoff`] drives reconnection.

pub mod codec;
pub mod connection;
pub mod reconnect;
pub mod service;

pub use codec::{read_message, write_message, CodecError, MAX_FRAME_LEN};
pub use connection::{Connection, ConnectionError};
pub use reconnect::{Backoff, ReconnectConfig};
pub use service::{
    ExposedService, Message, MessageKind, PortMapping, Protocol, ValidationError,
};
