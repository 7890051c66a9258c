//! Embedded TCP message relay.
//!
//! Clients connect over TCP and exchange JSON objects terminated by `<E>`.
//! The embedding host publishes a message to one connected client, chosen by
//! name or as the oldest live connection, and can wait for the client's
//! correlated `reply`. Each module owns one concern:
//!
//! - [`frame`] splits the byte stream into messages and writes them back out.
//! - [`message`] wraps the JSON object and its control fields.
//! - [`connection`] runs the read and write paths of one socket.
//! - [`registry`] tracks live connections in accept order.
//! - [`reply`] correlates reply-requested sends with their replies.
//! - [`dispatcher`] routes the single outbound queue to connections.
//! - [`relay`] is the host-facing facade: `initialize`, `shutdown`, `send`.
//! - [`cli`], [`host`] and [`client`] back the `socket_relay` binary: a
//!   console host that sends stdin lines, and a demo client.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod host;
pub mod message;
pub mod registry;
pub mod relay;
pub mod reply;

pub use config::RelayConfig;
pub use error::{RelayError, SendError};
pub use message::Message;
pub use relay::{ConnectionInfo, InboundMessage, Relay};
