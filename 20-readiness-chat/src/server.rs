//! The readiness-driven event loop.
//!
//! One thread owns the [`Poll`] instance and does nothing but wait for
//! readiness, take each ready event out of the ready set, and hand it to the
//! dispatcher, either inline or through the configured [`Executor`]. The
//! iteration contract is:
//!
//! 1. wait, bounded by the configured timeout (or forever);
//! 2. an empty wait is not an error: check the lifecycle and go again;
//! 3. otherwise classify every ready event once and dispatch it.
//!
//! Shutdown is cooperative. [`ServerHandle::stop`] flips the lifecycle and
//! wakes the poll; handlers already running finish undisturbed. Whatever way
//! [`EventLoop::run`] exits, the registry is closed: every connection is
//! unregistered, and an accept still running on a worker cannot add one
//! afterwards. The listener and poll instance are then released.

use std::{
    io::ErrorKind,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use mio::{net::TcpListener, Events, Interest, Poll, Waker};
use tracing::{debug, info};

use crate::{
    config::ServerConfig,
    dispatch::{dispatch, EventKind, ServerContext},
    error::{Result, ServerError},
    executor::Executor,
    registry::{ConnectionRegistry, LISTENER, WAKER},
};

const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopped,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotStarted,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// `NotStarted -> Running -> Stopped`, or straight to `Stopped` when a stop
/// arrives first. Never goes back.
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::NotStarted as u8))
    }

    fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Enters `Running`; fails if a stop was already requested.
    fn begin(&self) -> bool {
        self.0
            .compare_exchange(
                LifecycleState::NotStarted as u8,
                LifecycleState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Returns the state before the call.
    fn stop(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.swap(LifecycleState::Stopped as u8, Ordering::SeqCst))
    }
}

/// Cloneable control surface for a bound event loop.
#[derive(Clone)]
pub struct ServerHandle {
    lifecycle: Arc<Lifecycle>,
    waker: Arc<Waker>,
    connections: Arc<ConnectionRegistry>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Requests a cooperative shutdown. Idempotent, and harmless before the
    /// loop has started (it then exits as soon as it is run).
    pub fn stop(&self) {
        if self.lifecycle.stop() != LifecycleState::Stopped {
            info!(addr = %self.local_addr, "server stop requested");
        }
        if let Err(error) = self.waker.wake() {
            debug!(?error, "failed to wake event loop");
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn display_names(&self) -> Vec<String> {
        self.connections.display_names()
    }

    /// Display name of the client connected from `peer`, if it is online.
    pub fn display_name_of(&self, peer: SocketAddr) -> Option<String> {
        self.connections.display_name_of(peer)
    }
}

pub struct EventLoop {
    poll: Poll,
    context: Arc<ServerContext>,
    handle: ServerHandle,
    poll_timeout: Option<Duration>,
    executor: Option<Arc<dyn Executor>>,
}

impl EventLoop {
    /// Binds the listener and prepares the poll instance without running it.
    ///
    /// Nothing is left behind on failure: whatever was opened is dropped
    /// before the error is returned.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let addr = resolve(&config)?;
        let poll = Poll::new().map_err(ServerError::Poll)?;
        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::Register)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(ServerError::Poll)?);
        let selector = poll.registry().try_clone().map_err(ServerError::Poll)?;

        let connections = Arc::new(ConnectionRegistry::new());
        let context = Arc::new(ServerContext::new(
            listener,
            selector,
            Arc::clone(&connections),
            config.read_buffer,
        ));
        debug!(%local_addr, ?config, "listener bound");

        Ok(Self {
            poll,
            context,
            handle: ServerHandle {
                lifecycle: Arc::new(Lifecycle::new()),
                waker,
                connections,
                local_addr,
            },
            poll_timeout: config.effective_poll_timeout(),
            executor: config.executor,
        })
    }

    /// Binds and runs on the calling thread until stopped.
    pub fn start(config: ServerConfig) -> Result<()> {
        Self::bind(config)?.run()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    /// Runs the loop until [`ServerHandle::stop`] is called or the poll fails.
    pub fn run(self) -> Result<()> {
        let EventLoop {
            mut poll,
            context,
            handle,
            poll_timeout,
            executor,
        } = self;
        let _teardown = Teardown {
            context: context.as_ref(),
            lifecycle: handle.lifecycle.as_ref(),
        };

        if !handle.lifecycle.begin() {
            info!("stop requested before start, event loop not entered");
            return Ok(());
        }
        info!(
            addr = %handle.local_addr,
            timeout = ?poll_timeout,
            pooled = executor.is_some(),
            "event loop started"
        );

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while handle.lifecycle.get() == LifecycleState::Running {
            match poll.poll(&mut events, poll_timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ServerError::Poll(err)),
            }
            if events.is_empty() {
                continue;
            }

            // `Events` is cleared by the next poll, so each event is seen once.
            for event in events.iter() {
                let kind = EventKind::of(event);
                if kind == EventKind::Ignored {
                    continue;
                }
                match executor.as_deref() {
                    None => dispatch(&context, kind),
                    Some(executor) => {
                        let context = Arc::clone(&context);
                        executor.execute(Box::new(move || dispatch(&context, kind)));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Runs on every exit from [`EventLoop::run`], unwinding included.
struct Teardown<'a> {
    context: &'a ServerContext,
    lifecycle: &'a Lifecycle,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.lifecycle.stop();
        let evicted = self
            .context
            .connections
            .close(&self.context.selector);
        info!(evicted, "event loop stopped");
    }
}

/// Binds on the calling thread, so bind errors surface here, then runs the
/// loop on a dedicated `chat-event-loop` thread.
pub fn spawn(config: ServerConfig) -> Result<(ServerHandle, JoinHandle<Result<()>>)> {
    let event_loop = EventLoop::bind(config)?;
    let handle = event_loop.handle();
    let thread = thread::Builder::new()
        .name("chat-event-loop".to_string())
        .spawn(move || event_loop.run())
        .map_err(ServerError::Spawn)?;
    Ok((handle, thread))
}

fn resolve(config: &ServerConfig) -> Result<SocketAddr> {
    let target = config.bind_target();
    (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|source| ServerError::Resolve {
            target: target.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| ServerError::Resolve {
            target,
            source: ErrorKind::AddrNotAvailable.into(),
        })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig::default()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_poll_timeout(Some(Duration::from_millis(50)))
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn stop_before_run_exits_immediately() {
        let event_loop = EventLoop::bind(local_config()).expect("bind");
        let handle = event_loop.handle();
        assert_eq!(handle.state(), LifecycleState::NotStarted);

        handle.stop();
        handle.stop();
        event_loop.run().expect("run");

        assert_eq!(handle.state(), LifecycleState::Stopped);
        assert_eq!(handle.connection_count(), 0);
    }

    #[test]
    fn stop_is_observed_within_a_wait_interval() {
        let (handle, thread) = spawn(local_config()).expect("spawn");
        assert!(wait_until(Duration::from_secs(2), || handle.is_running()));

        handle.stop();
        assert!(wait_until(Duration::from_secs(2), || thread.is_finished()));
        thread.join().expect("join").expect("loop result");
        handle.stop();
        assert_eq!(handle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn infinite_wait_still_stops_promptly() {
        let (handle, thread) =
            spawn(local_config().with_poll_timeout(None)).expect("spawn");
        assert!(wait_until(Duration::from_secs(2), || handle.is_running()));

        handle.stop();
        assert!(wait_until(Duration::from_secs(2), || thread.is_finished()));
        thread.join().expect("join").expect("loop result");
    }

    #[test]
    fn occupied_port_is_a_bind_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = occupied.local_addr().expect("addr").port();

        let result = EventLoop::bind(local_config().with_port(port));
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}
