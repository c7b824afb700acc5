//! netplex: A multi-protocol network endpoint
//!
//! Serves three protocols side by side:
//! - Line echo over a stream (TCP) listener
//! - Acknowledged datagrams over UDP
//! - Echo over a WebSocket route
//!
//! Also bundles clients for the first two plus one-shot network operations
//! (HTTP fetch, name resolution, ICMP probe), usable from the command line
//! or as startup tasks.
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod error;
mod oneshot;
mod protocols;
mod server;
mod supervisor;

use clap::Parser;
use config::{CliArgs, Command, Config};
use supervisor::{shutdown_signal, Supervisor};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    // Load configuration
    let config = Config::load(&cli)?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let command = cli.command.clone().unwrap_or(Command::Serve);
    runtime.block_on(run(command, config)).inspect_err(|e| {
        error!(error = %e, "Command failed");
    })
}

async fn run(command: Command, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Serve => serve(config).await,
        Command::StreamClient { addr, message } => match message {
            Some(message) => {
                print!("{}", client::stream_exchange(&addr, &message).await?);
                Ok(())
            }
            None => Ok(client::run_interactive(&addr).await?),
        },
        Command::DatagramClient { addr, message } => {
            let reply =
                client::datagram_exchange(&addr, message.as_bytes(), client::REPLY_TIMEOUT)
                    .await?;
            print!("{}", String::from_utf8_lossy(&reply));
            Ok(())
        }
        Command::Fetch { url } => {
            let response = oneshot::fetch(&url, config.timeouts.fetch).await?;
            info!(
                url = %url,
                status = response.status.as_u16(),
                bytes = response.body.len(),
                "Fetched URL"
            );
            println!("{}", String::from_utf8_lossy(&response.body));
            if response.is_success() {
                Ok(())
            } else {
                Err(format!("{url} returned {}", response.status).into())
            }
        }
        Command::Resolve { domain } => {
            for addr in oneshot::resolve_host(&domain, config.timeouts.resolve).await? {
                println!("{addr}");
            }
            Ok(())
        }
        Command::Probe { host } => {
            let reply =
                oneshot::probe(&host, config.timeouts.probe, config.timeouts.resolve).await?;
            println!("Probe to {} took {:?}", reply.addr, reply.rtt);
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        stream = config.stream_listen.as_deref().unwrap_or("disabled"),
        datagram = config.datagram_listen.as_deref().unwrap_or("disabled"),
        websocket = config.websocket_listen.as_deref().unwrap_or("disabled"),
        websocket_path = %config.websocket_path,
        max_connections = config.max_connections,
        "Starting netplex"
    );

    let supervisor = Supervisor::start(config).await;
    if supervisor.services().is_empty() && !supervisor.bind_failures().is_empty() {
        let failed = supervisor.bind_failures().len();
        supervisor.shutdown().await;
        return Err(format!("all {failed} services failed to bind").into());
    }
    for service in supervisor.services() {
        info!(
            transport = %service.transport,
            addr = %service.local_addr,
            "Service listening"
        );
    }

    supervisor.run_until(shutdown_signal()).await;
    Ok(())
}
