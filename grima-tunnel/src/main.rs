#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use grima_tunnel_lib::{forge, forward, load_from_path, Client, Config, Role, Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "TCP-masquerading tunnel over a packet capture device")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the role configured in the config file (client or server)
    Run {
        /// Path to configuration TOML file
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Send a single raw TCP-framed packet with a custom payload
    Ping {
        /// Path to configuration TOML file
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// The string payload to send in the packet
        #[arg(long, default_value = "PING")]
        payload: String,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Ping { config, payload } => ping(&config, &payload),
    }
}

async fn run(config: &PathBuf) {
    let cfg = match load_from_path(config) {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = match cfg.role {
        Role::Client => run_client(cfg, cancel).await,
        Role::Server => Server::new(cfg).run(cancel).await,
    };
    if let Err(err) = result {
        error!(%err, "fatal error");
        std::process::exit(1);
    }
}

async fn run_client(
    cfg: Arc<Config>,
    cancel: CancellationToken,
) -> grima_tunnel_lib::Result<()> {
    let client = Client::start(cfg.clone(), cancel.clone()).await?;
    forward::run_all(cfg, client, cancel).await?;
    info!("client shutdown complete");
    Ok(())
}

fn ping(config: &PathBuf, payload: &str) {
    let cfg = match load_from_path(config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if cfg.role != Role::Client {
        error!("ping requires a client configuration");
        std::process::exit(1);
    }
    let Some(server) = cfg.server.as_ref() else {
        error!("ping requires server.addr");
        std::process::exit(1);
    };

    info!(
        server = %server.addr,
        interface = %cfg.network.interface.name,
        bytes = payload.len(),
        "sending packet"
    );
    if let Err(err) = forge::send_raw(&cfg.network, server.addr, payload.as_bytes()) {
        error!(%err, "failed to send packet");
        std::process::exit(1);
    }
    info!("packet sent");
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    error!(%err, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    info!("shutdown signal received");
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received, draining");
        cancel.cancel();
    });
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
