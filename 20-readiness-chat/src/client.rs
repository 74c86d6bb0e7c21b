//! Terminal front-end: stdin lines go to the server as raw bytes, whatever
//! the server sends back is printed as it arrives.

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, config::DEFAULT_READ_BUFFER};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let target = format!("{}:{}", args.host, args.port);
    let stream = TcpStream::connect(&target)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    let peer = stream.peer_addr().context("connected socket has no peer")?;

    info!(%peer, "connected");
    write_stdout(&format!("*** connected to {peer}")).await?;

    Ok(stream.into_split())
}

async fn run_client_loop(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    let mut buffer = vec![0u8; DEFAULT_READ_BUFFER];
    loop {
        input.clear();
        select! {
            bytes_read = reader.read(&mut buffer) => {
                if !handle_server_bytes(bytes_read, &buffer).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_bytes(bytes_read: io::Result<usize>, buffer: &[u8]) -> Result<bool> {
    let bytes_read = match bytes_read {
        Ok(0) => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        Ok(bytes_read) => bytes_read,
        Err(error) => {
            warn!(?error, "lost connection to server");
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    };

    // No framing on the wire: print each chunk as it arrives.
    let chunk = String::from_utf8_lossy(&buffer[..bytes_read]);
    write_stdout(&chunk).await?;
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
