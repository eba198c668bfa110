//! Clap CLI definitions for tfagent.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  tfagent broker                          Run a broker with ~/.tfagent/config.toml
  tfagent broker --listen 0.0.0.0:6379    Override the client listen address
  tfagent sign                            Create a twin key and its AUTH signature
  tfagent sign --seed <hex>               AUTH signature for an existing key";

/// Authenticated message broker for digital twins.
#[derive(Parser, Debug)]
#[command(name = "tfagent", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker until interrupted.
    Broker {
        /// Client listen address (overrides the config file).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Print a twin public key and its signature over the AUTH challenge.
    Sign {
        /// Hex-encoded 32-byte Ed25519 seed. A new key is generated if omitted.
        #[arg(long)]
        seed: Option<String>,
    },
}
