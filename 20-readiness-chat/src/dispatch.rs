//! Turning readiness events into accepts and broadcasts.
//!
//! Every handler runs behind [`guarded`], which is the failure boundary of
//! the event loop: an error or a panic while handling one event is logged
//! and goes no further.

use std::{
    any::Any,
    io::{self, ErrorKind, Write},
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use mio::{event::Event, net::TcpListener, net::TcpStream, Registry, Token};
use tracing::{debug, error, info, trace, warn};

use crate::{
    broadcast::{broadcast, format_message, Delivery},
    error::{Result, ServerError},
    registry::{ConnectionId, ConnectionRecord, ConnectionRegistry, ReadClaim, LISTENER},
    transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Acceptable,
    Readable(ConnectionId),
    Ignored,
}

impl EventKind {
    /// `readable` should already fold in hang-up and error readiness, which
    /// are only discovered by reading.
    pub fn classify(token: Token, readable: bool) -> Self {
        if !readable {
            return Self::Ignored;
        }
        if token == LISTENER {
            return Self::Acceptable;
        }
        ConnectionId::from_token(token).map_or(Self::Ignored, Self::Readable)
    }

    pub fn of(event: &Event) -> Self {
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        Self::classify(event.token(), readable)
    }
}

/// State shared by every handler, whichever thread it runs on.
pub(crate) struct ServerContext {
    pub(crate) listener: TcpListener,
    /// Registration handle cloned from the loop's poll instance.
    pub(crate) selector: Registry,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) read_buffer: usize,
}

impl ServerContext {
    pub(crate) fn new(
        listener: TcpListener,
        selector: Registry,
        connections: Arc<ConnectionRegistry>,
        read_buffer: usize,
    ) -> Self {
        Self {
            listener,
            selector,
            connections,
            read_buffer,
        }
    }

    fn drop_connection(&self, id: ConnectionId) {
        if self.connections.unregister(id, &self.selector).is_none() {
            trace!(%id, "connection already gone");
        }
    }
}

impl Delivery for ServerContext {
    fn deliver(&self, target: ConnectionId, payload: &[u8]) -> io::Result<()> {
        self.connections
            .with_stream(target, |stream| write_payload(stream, payload))
            .unwrap_or_else(|| Err(ErrorKind::NotConnected.into()))
    }

    fn evict(&self, target: ConnectionId) {
        self.drop_connection(target);
    }
}

/// One write per message. Only a write that accepted nothing may report
/// `WouldBlock`; a short write leaves a torn message on the wire and is
/// reported as a failure so the target gets dropped.
fn write_payload(mut stream: &TcpStream, payload: &[u8]) -> io::Result<()> {
    loop {
        match stream.write(payload) {
            Ok(written) if written == payload.len() => return Ok(()),
            Ok(written) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    format!("short write: {written} of {} bytes", payload.len()),
                ))
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn dispatch(ctx: &ServerContext, kind: EventKind) {
    match kind {
        EventKind::Acceptable => {
            guarded("accept", || accept(ctx));
        }
        EventKind::Readable(id) => {
            guarded("read", || read_and_broadcast(ctx, id));
        }
        EventKind::Ignored => {}
    }
}

/// Runs `handler`, logging instead of propagating its error or panic.
/// Returns whether it completed cleanly.
pub(crate) fn guarded<F>(event: &str, handler: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!(event, error = ?err, "event handling failed");
            false
        }
        Err(payload) => {
            error!(event, panic = panic_message(&*payload), "event handler panicked");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Accepts pending connections until the listener would block.
///
/// Readiness is edge-triggered, so stopping after one accept could leave a
/// queued connection without a further notification.
fn accept(ctx: &ServerContext) -> Result<()> {
    loop {
        match ctx.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = admit(ctx, stream, peer) {
                    warn!(%peer, error = ?err, "dropping accepted connection");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                ) =>
            {
                warn!(error = ?err, "transient accept error");
            }
            Err(err) => return Err(ServerError::Accept(err)),
        }
    }
}

fn admit(ctx: &ServerContext, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    // Sockets handed out by the mio listener are already non-blocking.
    let id = ctx.connections.next_id();
    let record = ConnectionRecord::accepted_now(peer);
    ctx.connections
        .register(id, stream, peer, record, &ctx.selector)
        .map_err(ServerError::Register)?;
    Ok(())
}

/// Reads for one connection never overlap: a handler that finds another one
/// mid-read leaves it a note and returns, and the owner drains again before
/// letting go. Messages from one sender are therefore broadcast in the
/// order they arrived, with or without a worker pool.
fn read_and_broadcast(ctx: &ServerContext, id: ConnectionId) -> Result<()> {
    match ctx.connections.claim_read(id) {
        None => {
            debug!(%id, "readiness for a connection that is already gone");
            return Ok(());
        }
        Some(ReadClaim::Deferred) => {
            trace!(%id, "read in progress elsewhere, handing over");
            return Ok(());
        }
        Some(ReadClaim::Owner) => {}
    }

    while read_once(ctx, id) && ctx.connections.finish_read(id) {}
    Ok(())
}

/// Drains and broadcasts once. Returns whether the connection is still
/// registered.
fn read_once(ctx: &ServerContext, id: ConnectionId) -> bool {
    let drained = ctx
        .connections
        .with_stream(id, |stream| transport::drain(stream, ctx.read_buffer));

    let chunk = match drained {
        None => return false,
        Some(Err(err)) => {
            debug!(%id, error = ?err, "read failed");
            ctx.drop_connection(id);
            return false;
        }
        Some(Ok(chunk)) if chunk.end_of_stream => {
            debug!(%id, discarded = chunk.text.len(), "peer closed the connection");
            ctx.drop_connection(id);
            return false;
        }
        Some(Ok(chunk)) => chunk,
    };

    if chunk.is_empty() {
        trace!(%id, "spurious wakeup, nothing to read");
        return true;
    }

    // Evicted between the read and this lookup: same as a disconnect.
    let Some(sender) = ctx.connections.display_name(id) else {
        ctx.drop_connection(id);
        return false;
    };

    let targets = ctx.connections.peers_of(id);
    if targets.is_empty() {
        debug!(%sender, "no other clients online, message not broadcast");
        return true;
    }

    info!(%sender, targets = targets.len(), text = %chunk.text, "broadcasting message");
    let message = format_message(&sender, &chunk.text);
    let report = broadcast(&message, &targets, ctx);
    debug!(%sender, ?report, "broadcast finished");
    true
}
