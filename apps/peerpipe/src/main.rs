mod config;
mod display;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use peerpipe_transfer::{
    ByteSource, DirectorySink, TransferSink, WriterSink, run_receiver, run_sender,
};
use peerpipe_transport::{PeerId, Transport, WsTransport};

use config::Config;

#[derive(Parser)]
#[command(name = "peerpipe", version)]
#[command(about = "Send one file to one peer over a direct connection")]
struct Cli {
    /// Configuration file (default: ~/.config/peerpipe/config.json)
    #[arg(long, global = true, env = "PEERPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Payload bytes per chunk
    #[arg(long, global = true)]
    chunk_size: Option<u32>,

    /// Seconds to wait for the other side to connect
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Do not print progress
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for a receiver and send a file (stdin when no path is given)
    Send {
        path: Option<PathBuf>,
        /// Name announced to the receiver
        #[arg(long)]
        name: Option<String>,
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,
        /// Host to advertise in the printed peer id
        #[arg(long)]
        advertise: Option<String>,
    },
    /// Connect to a sender and save what it sends ("-" writes to stdout)
    Receive {
        #[arg(value_parser = PeerId::from_str)]
        peer: PeerId,
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(size) = cli.chunk_size {
        config.chunk_size = size;
    }
    if let Some(secs) = cli.timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }
    tracing::debug!(path = %config.file_path().display(), "configuration loaded");

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    match cli.command {
        Command::Send {
            path,
            name,
            listen,
            advertise,
        } => {
            if let Some(addr) = listen {
                config.listen_addr = addr;
            }
            if advertise.is_some() {
                config.advertise_host = advertise;
            }
            send(&config, path, name, cli.quiet, &cancel).await
        }
        Command::Receive { peer, output } => {
            receive(&config, peer, output, cli.quiet, &cancel).await
        }
    }
}

async fn send(
    config: &Config,
    path: Option<PathBuf>,
    name: Option<String>,
    quiet: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let file_name = match (name, &path) {
        (Some(name), _) => name,
        (None, Some(path)) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?,
        (None, None) => "stdin".to_string(),
    };
    let source = path.map_or_else(ByteSource::stdin, ByteSource::File);

    let transport = WsTransport::bind(config.listen_addr.as_str(), config.advertise_host.as_deref())
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
    eprintln!("waiting for receiver: peerpipe receive {}", transport.local_identity());

    let (progress, display) = progress_channel(quiet);
    let result = run_sender(
        &transport,
        source,
        &file_name,
        &config.transfer_options(),
        cancel,
        progress,
    )
    .await;
    finish_display(display).await;

    let confirmation = result?;
    eprintln!(
        "sent {} ({} bytes) to {}",
        confirmation.file_name, confirmation.total_size, confirmation.peer
    );
    Ok(())
}

async fn receive(
    config: &Config,
    peer: PeerId,
    output: Option<PathBuf>,
    quiet: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let to_stdout = output.as_deref().is_some_and(|o| o.as_os_str() == "-");
    let mut sink: Box<dyn TransferSink> = if to_stdout {
        Box::new(WriterSink::stdout())
    } else {
        Box::new(DirectorySink::new(
            output.unwrap_or_else(|| config.output_dir.clone()),
        ))
    };

    let transport = WsTransport::dialer();
    let (progress, display) = progress_channel(quiet);
    let result = run_receiver(
        &transport,
        &peer,
        sink.as_mut(),
        &config.transfer_options(),
        cancel,
        progress,
    )
    .await;
    finish_display(display).await;

    let received = result?;
    match received.saved_to {
        Some(path) => eprintln!("saved {} ({} bytes)", path.display(), received.bytes.len()),
        None => tracing::debug!(bytes = received.bytes.len(), "payload written to stdout"),
    }
    Ok(())
}

type ProgressChannel = (
    Option<mpsc::Sender<peerpipe_transfer::TransferProgress>>,
    Option<tokio::task::JoinHandle<()>>,
);

fn progress_channel(quiet: bool) -> ProgressChannel {
    if quiet {
        return (None, None);
    }
    let (tx, rx) = mpsc::channel(32);
    (Some(tx), Some(tokio::spawn(display::show_progress(rx))))
}

async fn finish_display(display: Option<tokio::task::JoinHandle<()>>) {
    if let Some(handle) = display {
        if let Err(e) = handle.await {
            tracing::warn!("progress display failed: {e}");
        }
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("interrupted, cancelling transfer");
            cancel.cancel();
        }
        Err(e) => tracing::warn!("failed to listen for ctrl-c: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_without_path_reads_stdin() {
        let cli = Cli::try_parse_from(["peerpipe", "send", "--name", "notes.txt"]).unwrap();
        match cli.command {
            Command::Send { path, name, .. } => {
                assert_eq!(path, None);
                assert_eq!(name.as_deref(), Some("notes.txt"));
            }
            Command::Receive { .. } => panic!("expected send"),
        }
    }

    #[test]
    fn receive_parses_peer_and_output() {
        let cli =
            Cli::try_parse_from(["peerpipe", "receive", "10.0.0.5:4000", "-", "--timeout", "5"])
                .unwrap();
        assert_eq!(cli.timeout, Some(5));
        match cli.command {
            Command::Receive { peer, output } => {
                assert_eq!(peer.as_str(), "10.0.0.5:4000");
                assert_eq!(output, Some(PathBuf::from("-")));
            }
            Command::Send { .. } => panic!("expected receive"),
        }
    }

    #[test]
    fn receive_rejects_empty_peer() {
        assert!(Cli::try_parse_from(["peerpipe", "receive", " "]).is_err());
        assert!(Cli::try_parse_from(["peerpipe", "receive", ""]).is_err());
    }

    #[test]
    fn receive_trims_peer() {
        let cli = Cli::try_parse_from(["peerpipe", "receive", "  10.0.0.5:4000 "]).unwrap();
        match cli.command {
            Command::Receive { peer, .. } => assert_eq!(peer.as_str(), "10.0.0.5:4000"),
            Command::Send { .. } => panic!("expected receive"),
        }
    }
}
