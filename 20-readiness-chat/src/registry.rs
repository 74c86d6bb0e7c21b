//! Live connections, keyed by their readiness token.
//!
//! The registry owns each accepted socket together with its record. A
//! connection is present exactly while it holds a read subscription: it is
//! inserted in the same step that subscribes it and removed in the same step
//! that cancels the subscription. Handlers running on different workers may
//! hit the map concurrently, so it is a sharded [`DashMap`] and every lookup
//! miss is read as "already gone".

use std::{
    fmt,
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use dashmap::{mapref::entry::Entry, DashMap};
use mio::{net::TcpStream, Interest, Registry, Token};
use tracing::{debug, info, warn};

/// Token reserved for the listening socket.
pub const LISTENER: Token = Token(0);
/// Token reserved for the waker that interrupts a blocked poll.
pub const WAKER: Token = Token(usize::MAX);

/// Opaque handle for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub fn token(self) -> Token {
        Token(self.0)
    }

    /// Maps a readiness token back to a connection, rejecting reserved ones.
    pub fn from_token(token: Token) -> Option<Self> {
        (token != LISTENER && token != WAKER).then_some(Self(token.0))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    display_name: String,
    status: ConnectionStatus,
}

impl ConnectionRecord {
    pub fn new(peer: SocketAddr, accepted_at_millis: i64) -> Self {
        Self {
            display_name: display_name(peer, accepted_at_millis),
            status: ConnectionStatus::Online,
        }
    }

    /// Record stamped with the current wall-clock time.
    pub fn accepted_now(peer: SocketAddr) -> Self {
        Self::new(peer, chrono::Utc::now().timestamp_millis())
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Only [`ConnectionRegistry::register`] and
    /// [`ConnectionRegistry::unregister`] move a record between states.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }
}

/// `<peer>@<epoch millis>`; unique per peer address as long as two accepts
/// from the same address land on different milliseconds.
pub fn display_name(peer: SocketAddr, accepted_at_millis: i64) -> String {
    format!("{peer}@{accepted_at_millis}")
}

/// Outcome of [`ConnectionRegistry::claim_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadClaim {
    /// The caller now owns reads for the connection and must hand them back
    /// with [`ConnectionRegistry::finish_read`].
    Owner,
    /// Another handler is reading; it will drain again on our behalf.
    Deferred,
}

const READ_IDLE: u8 = 0;
const READ_BUSY: u8 = 1;
const READ_PENDING: u8 = 2;

/// Serializes reads on one connection across workers.
struct ReadGate(AtomicU8);

impl ReadGate {
    fn new() -> Self {
        Self(AtomicU8::new(READ_IDLE))
    }

    fn claim(&self) -> ReadClaim {
        loop {
            let claimed = match self.0.load(Ordering::Acquire) {
                READ_IDLE => self.swap_if(READ_IDLE, READ_BUSY).then_some(ReadClaim::Owner),
                READ_BUSY => self.swap_if(READ_BUSY, READ_PENDING).then_some(ReadClaim::Deferred),
                _ => Some(ReadClaim::Deferred),
            };
            if let Some(claim) = claimed {
                return claim;
            }
        }
    }

    /// Returns true when another readiness arrived meanwhile; the owner keeps
    /// the claim and must read again.
    fn finish(&self) -> bool {
        loop {
            match self.0.load(Ordering::Acquire) {
                READ_PENDING => {
                    if self.swap_if(READ_PENDING, READ_BUSY) {
                        return true;
                    }
                }
                READ_BUSY => {
                    if self.swap_if(READ_BUSY, READ_IDLE) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    fn swap_if(&self, current: u8, new: u8) -> bool {
        self.0
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    record: ConnectionRecord,
    reads: ReadGate,
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            // 0 is the listener; ids count up from 1.
            next_id: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribes `stream` for read-readiness and stores it under `id`.
    ///
    /// Create-if-absent: an existing entry is never replaced and the
    /// duplicate socket is closed, reported as `Ok(false)`. The same happens
    /// once the registry is [closed](Self::close). If the subscription fails
    /// the socket is closed and nothing is stored.
    pub fn register(
        &self,
        id: ConnectionId,
        mut stream: TcpStream,
        peer: SocketAddr,
        record: ConnectionRecord,
        selector: &Registry,
    ) -> io::Result<bool> {
        match self.connections.entry(id) {
            Entry::Occupied(_) => {
                debug!(%id, %peer, "connection already registered, closing duplicate");
                Ok(false)
            }
            // Checked under the shard lock: `close` flags first and then
            // visits every shard, so it either sees this entry or we see
            // the flag.
            Entry::Vacant(_) if self.closed.load(Ordering::SeqCst) => {
                warn!(%id, %peer, "registry closed, refusing connection");
                Ok(false)
            }
            Entry::Vacant(vacant) => {
                // The shard stays locked until the insert below, so a handler
                // woken by this subscription waits for the entry instead of
                // missing it.
                selector.register(&mut stream, id.token(), Interest::READABLE)?;
                info!(%id, name = %record.display_name, status = record.status.as_str(), "client online");
                vacant.insert(Connection {
                    stream,
                    peer,
                    record,
                    reads: ReadGate::new(),
                });
                Ok(true)
            }
        }
    }

    /// Evicts `id`, cancels its subscription and closes its socket.
    ///
    /// Returns the final record, marked offline, or `None` when the
    /// connection was already gone.
    pub fn unregister(&self, id: ConnectionId, selector: &Registry) -> Option<ConnectionRecord> {
        let (_, mut connection) = self.connections.remove(&id)?;
        if let Err(error) = selector.deregister(&mut connection.stream) {
            debug!(%id, ?error, "failed to cancel subscription");
        }
        connection.record.status = ConnectionStatus::Offline;
        info!(
            %id,
            peer = %connection.peer,
            name = %connection.record.display_name,
            status = connection.record.status.as_str(),
            "client offline"
        );
        Some(connection.record)
    }

    /// Unregisters every connection; returns how many were evicted.
    pub fn unregister_all(&self, selector: &Registry) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.unregister(id, selector))
            .count()
    }

    /// Refuses all further registrations and unregisters everything present.
    pub fn close(&self, selector: &Registry) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.unregister_all(selector)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Takes the read claim for `id`, or leaves a note for the current owner.
    /// `None` when the connection is gone.
    pub fn claim_read(&self, id: ConnectionId) -> Option<ReadClaim> {
        self.connections
            .get(&id)
            .map(|connection| connection.reads.claim())
    }

    /// Releases the claim taken by [`claim_read`](Self::claim_read). Returns
    /// true if the caller must read again before releasing, false once the
    /// claim is released or the connection is gone.
    pub fn finish_read(&self, id: ConnectionId) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|connection| connection.reads.finish())
    }

    /// Runs `f` against the socket of `id`.
    ///
    /// The map shard is held while `f` runs: `f` must not call back into the
    /// registry.
    pub fn with_stream<T>(&self, id: ConnectionId, f: impl FnOnce(&TcpStream) -> T) -> Option<T> {
        self.connections.get(&id).map(|connection| f(&connection.stream))
    }

    pub fn record(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections
            .get(&id)
            .map(|connection| connection.record.clone())
    }

    pub fn display_name(&self, id: ConnectionId) -> Option<String> {
        self.connections
            .get(&id)
            .map(|connection| connection.record.display_name.clone())
    }

    pub fn display_name_of(&self, peer: SocketAddr) -> Option<String> {
        self.connections
            .iter()
            .find(|entry| entry.peer == peer)
            .map(|entry| entry.record.display_name.clone())
    }

    pub fn display_names(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.record.display_name.clone())
            .collect()
    }

    /// Every registered connection except `sender`.
    pub fn peers_of(&self, sender: ConnectionId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| *id != sender)
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
