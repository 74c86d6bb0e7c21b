use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{ServerConfig, DEFAULT_HOST, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server and broadcast every message to the other clients.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host name or IP address to bind.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// TCP port to bind. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Upper bound on one readiness wait, in milliseconds. 0 waits forever.
    #[arg(long, default_value_t = 500)]
    pub timeout_ms: u64,

    /// Worker threads for event handling. 0 handles events on the loop thread.
    #[arg(long, default_value_t = 0)]
    pub workers: usize,
}

impl ServerArgs {
    /// Config without an executor; the caller attaches one when `workers > 0`.
    pub fn to_config(&self) -> ServerConfig {
        ServerConfig::default()
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_poll_timeout(Some(Duration::from_millis(self.timeout_ms)))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or IP address of the server.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// TCP port of the server.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}
