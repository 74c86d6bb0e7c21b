use std::{
    collections::HashSet,
    net::SocketAddr,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use readiness_chat::{
    config::ServerConfig,
    error::ServerError,
    executor,
    server::{self, LifecycleState, ServerHandle},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(300);

/// A server running on an ephemeral localhost port.
struct TestServer {
    handle: ServerHandle,
    thread: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    fn start(config: ServerConfig) -> Result<Self> {
        let (handle, thread) = server::spawn(
            config
                .with_host("127.0.0.1")
                .with_port(0)
                .with_poll_timeout(Some(Duration::from_millis(50))),
        )?;
        Ok(Self { handle, thread })
    }

    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr()).await?)
    }

    /// Waits until exactly `count` clients are registered.
    async fn wait_for_connections(&self, count: usize) -> Result<()> {
        let deadline = Instant::now() + READ_TIMEOUT;
        while Instant::now() < deadline {
            if self.handle.connection_count() == count {
                return Ok(());
            }
            sleep(Duration::from_millis(10)).await;
        }
        bail!(
            "expected {count} connections, server has {}",
            self.handle.connection_count()
        )
    }

    fn name_of(&self, client: &TcpStream) -> Result<String> {
        let local = client.local_addr()?;
        self.handle
            .display_name_of(local)
            .ok_or_else(|| anyhow!("no record for {local}"))
    }

    fn shutdown(self) -> Result<()> {
        self.handle.stop();
        self.thread
            .join()
            .map_err(|_| anyhow!("event loop panicked"))??;
        Ok(())
    }
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    timeout(READ_TIMEOUT, stream.read_exact(&mut buf)).await??;
    Ok(String::from_utf8(buf)?)
}

async fn assert_silent(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 256];
    match timeout(SILENCE, stream.read(&mut buf)).await {
        Err(_) => Ok(()),
        Ok(Ok(read)) => bail!(
            "expected silence, got {:?}",
            String::from_utf8_lossy(&buf[..read])
        ),
        Ok(Err(err)) => Err(err.into()),
    }
}

#[tokio::test]
async fn broadcast_reaches_every_client_except_the_sender() -> Result<()> {
    let server = TestServer::start(ServerConfig::default())?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;
    let mut carol = server.connect().await?;
    server.wait_for_connections(3).await?;
    let alice_name = server.name_of(&alice)?;

    alice.write_all(b"hi").await?;

    let expected = format!("{alice_name} says: hi");
    assert_eq!(read_exactly(&mut bob, expected.len()).await?, expected);
    assert_eq!(read_exactly(&mut carol, expected.len()).await?, expected);
    assert_silent(&mut alice).await?;

    server.shutdown()
}

#[tokio::test]
async fn abruptly_closed_client_is_evicted() -> Result<()> {
    let server = TestServer::start(ServerConfig::default())?;
    let alice = server.connect().await?;
    let mut bob = server.connect().await?;
    server.wait_for_connections(2).await?;
    let alice_addr = alice.local_addr()?;

    drop(alice);
    server.wait_for_connections(1).await?;
    assert_eq!(server.handle.display_name_of(alice_addr), None);

    bob.write_all(b"ping").await?;
    assert_silent(&mut bob).await?;
    assert_eq!(server.handle.connection_count(), 1);

    server.shutdown()
}

#[tokio::test]
async fn lone_client_hears_nothing_back() -> Result<()> {
    let server = TestServer::start(ServerConfig::default())?;
    let mut alice = server.connect().await?;
    server.wait_for_connections(1).await?;

    alice.write_all(b"anyone?").await?;
    assert_silent(&mut alice).await?;

    server.shutdown()
}

#[tokio::test]
async fn worker_pool_handles_events_concurrently() -> Result<()> {
    let pool = executor::worker_pool(4)?;
    let server = TestServer::start(ServerConfig::default().with_executor(pool))?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;
    let mut carol = server.connect().await?;
    server.wait_for_connections(3).await?;
    let bob_name = server.name_of(&bob)?;

    bob.write_all(b"from the pool").await?;

    let expected = format!("{bob_name} says: from the pool");
    assert_eq!(read_exactly(&mut alice, expected.len()).await?, expected);
    assert_eq!(read_exactly(&mut carol, expected.len()).await?, expected);
    assert_silent(&mut bob).await?;

    server.shutdown()
}

#[tokio::test]
async fn worker_pool_keeps_one_senders_messages_in_order() -> Result<()> {
    let pool = executor::worker_pool(4)?;
    let server = TestServer::start(ServerConfig::default().with_executor(pool))?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;
    server.wait_for_connections(2).await?;
    let prefix = format!("{} says: ", server.name_of(&bob)?);

    let sent: String = (1..=40).map(|n| format!("{n};")).collect();
    for n in 1..=40 {
        bob.write_all(format!("{n};").as_bytes()).await?;
        sleep(Duration::from_millis(2)).await;
    }

    // Writes may be coalesced into fewer messages; only the order counts.
    let mut received = String::new();
    let mut buf = [0u8; 1024];
    while received.replace(&prefix, "").len() < sent.len() {
        let read = timeout(READ_TIMEOUT, alice.read(&mut buf)).await??;
        if read == 0 {
            bail!("server closed the connection");
        }
        received.push_str(std::str::from_utf8(&buf[..read])?);
    }
    assert_eq!(received.replace(&prefix, ""), sent);

    server.shutdown()
}

#[tokio::test]
async fn online_clients_have_distinct_names() -> Result<()> {
    let server = TestServer::start(ServerConfig::default())?;
    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(server.connect().await?);
        // Keep accept times at least a millisecond apart.
        sleep(Duration::from_millis(2)).await;
    }
    server.wait_for_connections(5).await?;

    let names = server.handle.display_names();
    let unique: HashSet<&String> = names.iter().collect();
    assert_eq!(unique.len(), 5);
    for client in &clients {
        let local = client.local_addr()?;
        assert!(server.name_of(client)?.starts_with(&format!("{local}@")));
    }

    server.shutdown()
}

#[tokio::test]
async fn stopping_releases_connections_and_listener() -> Result<()> {
    let server = TestServer::start(ServerConfig::default())?;
    let mut alice = server.connect().await?;
    server.wait_for_connections(1).await?;
    let addr = server.addr();
    let handle = server.handle.clone();

    server.shutdown()?;
    handle.stop();
    assert_eq!(handle.state(), LifecycleState::Stopped);
    assert_eq!(handle.connection_count(), 0);

    let mut buf = [0u8; 16];
    let read = timeout(READ_TIMEOUT, alice.read(&mut buf)).await??;
    assert_eq!(read, 0, "client should see end-of-stream");
    assert!(TcpStream::connect(addr).await.is_err());

    Ok(())
}
