//! Broadcast chat server driven by a single readiness event loop.
//!
//! One thread waits on a `mio` poll for the listening socket and every
//! accepted client. New connections get a display name of the form
//! `<peer address>@<accept time in epoch millis>`; whatever a client sends is
//! relayed to every other connected client as `"<name> says: <text>"`.
//!
//! There is no framing on the wire. A "message" is whatever bytes were
//! available when the server handled one readiness notification, so message
//! boundaries are unreliable: several quick writes can arrive as one
//! message and one large write can arrive as two.
//!
//! - [`server`] owns the poll instance, the listener and the start/stop
//!   lifecycle.
//! - [`dispatch`] classifies readiness events and runs accept or
//!   read-and-broadcast behind a failure boundary.
//! - [`registry`] is the concurrent map of live connections.
//! - [`transport`] drains a non-blocking socket into one text chunk.
//! - [`broadcast`] fans a message out and evicts targets whose writes fail.
//! - [`executor`] is the optional worker pool for event handling.
//! - [`config`], [`cli`] and [`error`] hold settings, flags and errors.
//! - [`client`] is the interactive terminal client.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod registry;
pub mod server;
pub mod transport;
