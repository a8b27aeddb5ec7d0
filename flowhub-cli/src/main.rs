//! flowhub-cli - Command-line interface for flowhub
//!
//! One-shot commands against a hub, plus a listener that prints incoming frames.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use flowhub_client::{Client, ConnectionConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowhub-cli")]
#[command(about = "Command-line interface for the flowhub device hub")]
#[command(version)]
struct Cli {
    /// Hub WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:7800/ws", env = "FLOWHUB_URL")]
    server: String,

    /// Device UID to log in as
    #[arg(short, long, env = "FLOWHUB_UID")]
    uid: Option<u64>,

    /// Device secret
    #[arg(long, env = "FLOWHUB_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Manager token (used when no device credentials are given)
    #[arg(short = 't', long, env = "FLOWHUB_MANAGER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a keepalive to the hub
    Ping,

    /// Check credentials and print the resulting identity
    Login,

    /// Register a new device and print its UID and secret
    Register {
        /// Hardware identifier of the new device
        hardware_id: String,
    },

    /// List devices visible to the logged-in identity
    Nodes,

    /// Send a message to one device
    Send {
        /// Target device UID
        target: u64,

        /// Message body (prefix with hex: for raw bytes)
        message: String,
    },

    /// Send a message to every device
    Broadcast {
        /// Message body (prefix with hex: for raw bytes)
        message: String,
    },

    /// Print frames delivered to this identity until Ctrl+C
    Listen,

    /// Generate SHA-256 hash of a secret or token for config files
    HashSecret {
        /// The secret to hash
        secret: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Handle hash-secret locally (no hub connection needed)
    if let Commands::HashSecret { secret } = &cli.command {
        println!("{}", commands::hash_secret(secret));
        return Ok(());
    }

    let config = ConnectionConfig::new(cli.server.clone())
        .with_request_timeout(Duration::from_secs(cli.timeout))
        .with_user_agent(concat!("flowhub-cli/", env!("CARGO_PKG_VERSION")));
    let client = Client::new(config);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    if let Err(e) = login(&client, &cli).await {
        eprintln!("{}: {}", "Login failed".red(), e);
        std::process::exit(1);
    }

    match cli.command {
        Commands::HashSecret { .. } => unreachable!(), // Already handled above
        Commands::Listen => {
            let mut frames = client.subscribe();
            eprintln!(
                "{} as uid {}",
                "Listening".green(),
                client.device_uid().to_string().cyan()
            );
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            loop {
                tokio::select! {
                    frame = frames.recv() => {
                        match frame {
                            Ok(frame) => println!("{}", commands::format_frame(&frame)),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                eprintln!("{}: lagged {} frames", "Warning".yellow(), n);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                eprintln!("{}", "Connection closed".red());
                                break;
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping...".dimmed());
                        break;
                    }
                }
            }
        }
        cmd => match commands::execute(&client, cmd).await {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}

async fn login(client: &Client, cli: &Cli) -> Result<(), flowhub_client::ClientError> {
    match (cli.uid, cli.secret.as_deref(), cli.token.as_deref()) {
        (Some(uid), Some(secret), _) => client.authenticate(uid, secret).await,
        (_, _, Some(token)) => client.manager_auth(token).await.map(|_| ()),
        _ => Ok(()),
    }
}
