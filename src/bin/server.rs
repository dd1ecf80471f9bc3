//! Tunnel server binary.
//!
//! Listens for WebSocket upgrades, authenticates clients against the
//! allowed-keys list, and serves one tunnel per connected client.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use veil_tunnel::config::Config;
use veil_tunnel::crypto::KeyPair;
use veil_tunnel::server::Server;

/// Veil Tunnel server
#[derive(Parser, Debug)]
#[command(name = "veil-server")]
#[command(about = "Accept encrypted WebSocket tunnels and forward ports for clients")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address (overrides config), e.g. 0.0.0.0:8443
    #[arg(short, long)]
    listen: Option<String>,

    /// Allow clients to declare reverse remotes (overrides config)
    #[arg(long)]
    reverse: bool,

    /// Enable the embedded SOCKS5 backend (overrides config)
    #[arg(long)]
    socks5: bool,

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
    let mut server_config = file.server.clone().unwrap_or_default();

    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if args.reverse {
        server_config.reverse = true;
    }
    if args.socks5 {
        server_config.socks5 = true;
    }

    // first run: mint an identity and persist it when a config file is used
    if server_config.private_key.is_empty() {
        info!("no keypair configured, generating one");
        let keypair = KeyPair::generate()?;
        server_config.private_key = keypair.private.to_base64();
        server_config.public_key = keypair.public.to_base64();
        info!("server public key: {}", keypair.public);
        if let Some(path) = &args.config {
            file.server = Some(server_config.clone());
            file.save(path)?;
            info!("saved new keypair to {}", path);
        }
    }

    info!("veil-server v{}", veil_tunnel::VERSION);
    let server = Server::new(server_config)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    server.run(&cancel).await?;
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
            println!("public key (share with clients as server_public_key):");
            println!("  {}", keypair.public.to_base64());
            println!();
            println!("private key (keep secret, set as private_key in the server config):");
            println!("  {}", keypair.private.to_base64());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("key generation failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
