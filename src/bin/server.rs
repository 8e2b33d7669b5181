//! SOCKS Tunnel Server
//!
//! Accepts tunnel clients, authenticates their tokens, connects to the
//! requested targets and relays decrypted traffic. Keys can be managed at
//! runtime from stdin.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use socks_tunnel::{
    config::{generate_example_config, Config},
    console::Command,
    crypto::TokenAuthenticator,
    reactor::Reactor,
    server::ServerHandler,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// SOCKS Tunnel Server - authenticated, encrypted tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "tunnel-server")]
#[command(about = "SOCKS Tunnel Server - authenticated, encrypted tunnel endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Listen address (overrides config)
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

    let server_config = config
        .server
        .as_mut()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    let server_config = server_config.clone();
    config.validate().context("Invalid configuration")?;

    if server_config.keys.is_empty() {
        warn!("No keys configured; every tunnel client will be rejected until one is added");
    }

    let (handler, authenticator) = ServerHandler::from_config(&server_config, &config.crypto)
        .context("Failed to initialize server")?;
    let mut reactor = Reactor::new(server_config.listen_addr()?, &config.reactor, handler)
        .context("Failed to create reactor")?;
    reactor.start().context("Failed to start reactor")?;

    info!(
        "Tunnel server listening on {} ({} cipher, {} keys)",
        reactor.local_addr(),
        config.crypto.cipher,
        authenticator.list_keys().len()
    );
    info!("Type a command and press enter: add <key>, remove <key>, list, q");

    run_console(authenticator.as_ref()).await?;

    reactor.shutdown().context("Failed to stop reactor")?;
    info!("Server stopped");
    Ok(())
}

/// Serve stdin commands until `q` or Ctrl-C
async fn run_console(authenticator: &dyn TokenAuthenticator) -> Result<()> {
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
                    Command::Add(key) => {
                        if authenticator.add(&key) {
                            info!("Key {} added", key);
                        } else {
                            info!("Key {} already registered", key);
                        }
                    }
                    Command::Remove(key) => {
                        if authenticator.remove(&key) {
                            info!("Key {} removed", key);
                        } else {
                            info!("Key {} is not registered", key);
                        }
                    }
                    Command::List => {
                        let keys = authenticator.list_keys();
                        info!("{} keys registered: {}", keys.len(), keys.join(", "));
                    }
                    Command::Empty => {}
                    Command::Unknown(line) => info!("Unknown command: {}", line),
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
