use clap::Parser;
use log::{error, info, warn};
use std::process;

use rusty_chat::config::ServerConfig;
use rusty_chat::core::Server;
use rusty_chat::signals::{self, InterruptListener};

/// Multi-client TCP chat server
#[derive(Parser, Debug)]
#[command(name = "rusty_chat", version, about)]
struct Args {
    /// Numeric IPv4/IPv6 address to listen on
    #[arg(short, long)]
    address: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum number of simultaneously connected clients
    #[arg(short = 'm', long)]
    max_connections: Option<usize>,
}

fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    }

    let args = Args::parse();

    if let Err(e) = run(args) {
        if e.is_fatal() {
            error!("Unable to start server: {}", e);
        } else {
            error!("Server stopped with error: {}", e);
        }
        process::exit(1);
    }
}

fn run(args: Args) -> rusty_chat::Result<()> {
    let mut config = ServerConfig::from_env()?;
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }

    info!(
        "Configuration: address={}, port={}, max_connections={}",
        config.address, config.port, config.max_connections
    );

    signals::ignore_sigpipe();
    let mut interrupts = InterruptListener::install()?;

    let mut server = Server::bind(config)?;
    server.start()?;
    info!("Rusty Chat listening on {}, press Ctrl-C to stop", server.local_addr());

    if let Some(signal) = interrupts.wait() {
        info!("Signal {} received, shutting down", signal);
    }

    server.stop()
}
