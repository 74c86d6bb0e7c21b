use std::{fmt, sync::Arc, time::Duration};

use crate::executor::Executor;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_READ_BUFFER: usize = 1024;

/// Settings for one event loop instance.
///
/// Built with `ServerConfig::default()` and the chained `with_*` setters,
/// the way the binary maps its command-line flags onto it:
///
/// ```
/// use std::time::Duration;
/// use readiness_chat::config::ServerConfig;
///
/// let config = ServerConfig::default()
///     .with_host("127.0.0.1")
///     .with_port(0)
///     .with_poll_timeout(Some(Duration::from_millis(100)));
/// assert_eq!(config.bind_target(), "127.0.0.1:0");
/// ```
#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on a single readiness wait. `None` or zero blocks until at
    /// least one event (or a stop request) arrives.
    pub poll_timeout: Option<Duration>,
    /// Capacity of the buffer used for each bounded read.
    pub read_buffer: usize,
    /// When present, ready events are handed to this executor instead of
    /// being handled on the loop thread.
    pub executor: Option<Arc<dyn Executor>>,
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = bytes.max(1);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Timeout actually passed to the poll; zero is normalised to "forever".
    pub(crate) fn effective_poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout.filter(|timeout| !timeout.is_zero())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            poll_timeout: Some(DEFAULT_POLL_TIMEOUT),
            read_buffer: DEFAULT_READ_BUFFER,
            executor: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("poll_timeout", &self.poll_timeout)
            .field("read_buffer", &self.read_buffer)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bind_target() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_target(), "localhost:8888");
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.read_buffer, 1024);
        assert!(config.executor.is_none());
    }

    #[test]
    fn zero_timeout_means_block_indefinitely() {
        let config = ServerConfig::default().with_poll_timeout(Some(Duration::ZERO));
        assert_eq!(config.effective_poll_timeout(), None);

        let config = ServerConfig::default().with_poll_timeout(None);
        assert_eq!(config.effective_poll_timeout(), None);

        let config = ServerConfig::default().with_poll_timeout(Some(Duration::from_millis(20)));
        assert_eq!(
            config.effective_poll_timeout(),
            Some(Duration::from_millis(20))
        );
    }
}
