//! SOCKS Tunnel Client
//!
//! Exposes a local SOCKS5 endpoint and forwards every CONNECT through an
//! authenticated, encrypted tunnel to the server.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use socks_tunnel::{
    client::ClientHandler,
    config::{generate_example_config, Config},
    console::Command,
    reactor::Reactor,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// SOCKS Tunnel Client - local SOCKS5 endpoint forwarding through the tunnel
#[derive(Parser, Debug)]
#[command(name = "tunnel-client")]
#[command(about = "SOCKS Tunnel Client - local SOCKS5 endpoint forwarding through the tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local SOCKS5 listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", toml::to_string_pretty(&generate_example_config())?);
        return Ok(());
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    let client_config = config
        .client
        .as_mut()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(listen) = args.listen {
        client_config.listen = listen;
    }
    let client_config = client_config.clone();
    config.validate().context("Invalid configuration")?;

    let handler = ClientHandler::from_config(&client_config, &config.crypto)
        .context("Failed to initialize client")?;
    let mut reactor = Reactor::new(client_config.listen_addr()?, &config.reactor, handler)
        .context("Failed to create reactor")?;
    reactor.start().context("Failed to start reactor")?;

    info!(
        "SOCKS5 proxy listening on {}, tunnelling to {} ({} cipher)",
        reactor.local_addr(),
        client_config.server,
        config.crypto.cipher
    );
    if client_config.local_dns_resolve {
        info!("Domain names are resolved locally");
    }
    info!("Type q and press enter to quit");

    run_console().await?;

    reactor.shutdown().context("Failed to stop reactor")?;
    info!("Client stopped");
    Ok(())
}

/// Wait for `q` on stdin or Ctrl-C
async fn run_console() -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    debug!("stdin closed, waiting for Ctrl-C");
                    stdin_open = false;
                    continue;
                };
                match Command::parse(&line) {
                    Command::Quit => break,
                    Command::Empty => {}
                    command if command.is_key_management() => {
                        info!("Key management is only available on the server");
                    }
                    _ => info!("Unknown command: {}", line.trim()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    match format {
        "compact" => builder.compact().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.init(),
    }
}
