use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use readiness_chat::{
    cli::{Cli, Command, ServerArgs},
    client, executor, server,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let mut config = args.to_config();
    if args.workers > 0 {
        config = config.with_executor(executor::worker_pool(args.workers)?);
    }

    let (handle, event_loop) = server::spawn(config).context("failed to start server")?;
    info!("server listening on {}", handle.local_addr());

    let mut event_loop = tokio::task::spawn_blocking(move || event_loop.join());
    let joined = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            handle.stop();
            event_loop.await
        }
        joined = &mut event_loop => joined,
    };

    match joined.context("failed to wait for event loop")? {
        Ok(result) => result.context("event loop exited with error"),
        Err(_) => anyhow::bail!("event loop thread panicked"),
    }
}
