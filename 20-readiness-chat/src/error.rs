use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failures the server surfaces to its caller.
///
/// Only resource setup (`Resolve`, `Bind`, `Poll`, `Spawn`) is fatal. The
/// per-connection variants are produced by event handlers and stop at the
/// dispatcher, which logs them and keeps the loop running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to resolve bind address {target}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("readiness poll failed")]
    Poll(#[source] io::Error),

    #[error("failed to subscribe connection for readiness")]
    Register(#[source] io::Error),

    #[error("failed to accept connection")]
    Accept(#[source] io::Error),

    #[error("failed to spawn event loop thread")]
    Spawn(#[source] io::Error),
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
