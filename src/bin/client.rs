//! Tunnel client binary.
//!
//! Connects outward to a veil-tunnel server over WebSocket, keeps the
//! session alive with adaptive reconnect backoff, and forwards the
//! configured remotes.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use veil_tunnel::client::Client;
use veil_tunnel::config::Config;
use veil_tunnel::crypto::KeyPair;

/// Veil Tunnel client
#[derive(Parser, Debug)]
#[command(name = "veil-client")]
#[command(about = "Forward TCP/UDP ports over an encrypted WebSocket tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Server URL (overrides config), e.g. wss://example.com:8443
    #[arg(short, long)]
    server: Option<String>,

    /// Server public key (base64, overrides config)
    #[arg(long)]
    server_key: Option<String>,

    /// Remotes in mini-syntax form (override config), e.g. 8080:127.0.0.1:80
    remotes: Vec<String>,

    /// Generate a new keypair and exit
    #[arg(long)]
    generate_key: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.clone())
        .init();

    if args.generate_key {
        return generate_keypair();
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<veil_tunnel::Error>()
                .map(veil_tunnel::Error::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut file = match &args.config {
        Some(path) => Config::load(path).context("failed to load configuration")?,
        None => Config::default(),
    };
    let mut client_config = file.client.clone().unwrap_or_default();

    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(key) = args.server_key {
        client_config.server_public_key = key;
    }
    if !args.remotes.is_empty() {
        client_config.remotes = args.remotes;
    }

    // first run: mint an identity and persist it when a config file is used
    if client_config.private_key.is_empty() {
        info!("no keypair configured, generating one");
        let keypair = KeyPair::generate()?;
        client_config.private_key = keypair.private.to_base64();
        client_config.public_key = keypair.public.to_base64();
        info!("client public key: {}", keypair.public);
        if let Some(path) = &args.config {
            file.client = Some(client_config.clone());
            file.save(path)?;
            info!("saved new keypair to {}", path);
        }
    }

    info!("veil-client v{}", veil_tunnel::VERSION);
    let client = Client::new(client_config)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    client.run(&cancel).await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn generate_keypair() -> ExitCode {
    match KeyPair::generate() {
        Ok(keypair) => {
            println!("public key (share with the server admin):");
            println!("  {}", keypair.public.to_base64());
            println!();
            println!("private key (keep secret, set as private_key in the client config):");
            println!("  {}", keypair.private.to_base64());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("key generation failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
