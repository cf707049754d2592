//! mwrpc - Command-line interface for the middleware daemon
//!
//! One-shot method calls, job waiting and event watching over a single
//! WebSocket connection.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use mwrpc_client::{RpcClient, Unsolicited};
use mwrpc_protocol::JobHandle;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mwrpc")]
#[command(about = "Command-line client for the middleware daemon's WebSocket API")]
#[command(version)]
struct Cli {
    /// Daemon WebSocket URL, e.g. wss://nas.local/websocket
    #[arg(short, long)]
    url: Option<String>,

    /// Path to YAML config file
    #[arg(short, long, env = "MWRPC_CONFIG")]
    config: Option<PathBuf>,

    // ===== TLS Options =====
    /// Path to CA certificate for server verification
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Per-call timeout in seconds
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Delay between job status queries in milliseconds
    #[arg(long)]
    poll_interval: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Check that the daemon answers
    Ping,

    /// Invoke a method
    Call {
        /// Method name, e.g. system.info
        method: String,

        /// Parameters JSON (or @file.json to read from file)
        params: Option<String>,

        /// Wait for the job if the method starts one
        #[arg(short, long)]
        wait: bool,

        /// Maximum time to wait for the job, in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Print compact JSON
        #[arg(long)]
        raw: bool,
    },

    /// Wait for a job to finish
    AwaitJob {
        /// Job ID
        id: JobHandle,

        /// Maximum time to wait, in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Show the current status of a job
    Job {
        /// Job ID
        id: JobHandle,
    },

    /// Print pushed events until Ctrl+C
    Watch,
}

impl Cli {
    /// Applies command-line overrides on top of file and env configuration.
    fn apply_to(&self, config: &mut Config) {
        if let Some(ref url) = self.url {
            config.connection.url = url.clone();
        }
        if let Some(ref path) = self.ca_cert {
            config.tls.ca_cert = Some(path.clone());
        }
        if self.insecure {
            config.tls.insecure = true;
        }
        if let Some(secs) = self.request_timeout {
            config.connection.request_timeout_secs = secs;
        }
        if let Some(ms) = self.poll_interval {
            config.jobs.poll_interval_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_to(&mut config);
    config.validate()?;

    let client = RpcClient::new(config.client_config());
    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    tracing::debug!("connected to {}", config.connection.url);

    match cli.command {
        Commands::Watch => watch(&client).await?,
        cmd => match commands::execute(&client, &config, cmd).await {
            Ok(output) => {
                println!("{}", output);
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                let _ = client.close().await;
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}

/// Streams pushed events to stdout until Ctrl+C or disconnect.
async fn watch(client: &RpcClient) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = client.subscribe_events();
    eprintln!("{}", "Watching events. Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(Unsolicited::Event(e)) => {
                        println!("{}", commands::format_event(&e));
                    }
                    Ok(Unsolicited::Unmatched(response)) => {
                        tracing::debug!("ignoring unmatched response id={}", response.id);
                    }
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => {
                        eprintln!("{}", "Connection closed".red());
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping watch...".dimmed());
                break;
            }
        }
    }
    Ok(())
}
