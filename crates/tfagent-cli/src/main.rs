//! tfagent command line: runs the broker and signs AUTH challenges.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::net::SocketAddr;
use std::path::PathBuf;
use tfagent_broker::config::load_config;
use tfagent_broker::crypto::{sign_challenge, signing_key_from_hex};
use tokio::sync::watch;
use tracing::{error, info};
use zeroize::Zeroizing;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Broker { listen } => cmd_broker(cli.config, listen),
        Commands::Sign { seed } => cmd_sign(seed),
    }
}

fn cmd_broker(config_path: Option<PathBuf>, listen: Option<SocketAddr>) {
    let mut config = load_config(config_path.as_deref());
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broker = tfagent_broker::launch(&config, shutdown_rx).await?;
        info!(
            listen = %broker.local_addr(),
            peer = %broker.identity(),
            "Broker is running. Press Ctrl+C to stop."
        );

        let mut accept = tokio::spawn(broker.wait());
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                }
                info!("Shutting down");
                let _ = shutdown_tx.send(true);
                match accept.await {
                    Ok(result) => result,
                    Err(e) => Err(tfagent_broker::ServerError::Task(e.to_string())),
                }
            }
            finished = &mut accept => {
                let _ = shutdown_tx.send(true);
                match finished {
                    Ok(result) => result,
                    Err(e) => Err(tfagent_broker::ServerError::Task(e.to_string())),
                }
            }
        }
    });

    if let Err(e) = result {
        error!(error = %e, "Broker stopped");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn cmd_sign(seed: Option<String>) {
    let seed = seed.map(Zeroizing::new);
    let key = match seed.as_deref() {
        Some(seed) => match signing_key_from_hex(seed) {
            Ok(key) => key,
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
        None => {
            let key = SigningKey::generate(&mut OsRng);
            let seed = Zeroizing::new(hex::encode(key.to_bytes()));
            println!("seed:       {}", seed.as_str());
            key
        }
    };

    println!("public_key: {}", hex::encode(key.verifying_key().to_bytes()));
    println!("signature:  {}", hex::encode(sign_challenge(&key)));
}
