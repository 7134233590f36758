//! sotto relay server.
//!
//! Rendezvous point for encrypted chat sessions. Clients open a TCP
//! connection, name a session to create or join, and from then on the
//! relay forwards ciphertext between the members. It never holds keys and
//! never sees plaintext; all state is in memory and dies with the process.

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod admission;
mod config;
mod registry;
mod router;
mod server;

use config::{RelayConfig, RelayMode};
use server::RelayServer;

/// sotto relay - forwards ciphertext between session members
#[derive(Parser)]
#[command(name = "sotto-relay")]
#[command(author, version, about)]
struct Args {
    /// Listen address; a bare `:port` binds all interfaces
    #[arg(long, default_value = ":8080")]
    addr: String,

    /// Maximum data to relay per session in MB
    #[arg(long, default_value = "50")]
    max_data_relayed: u64,

    /// Traffic handling mode
    #[arg(long, value_enum, default_value = "opaque")]
    mode: RelayMode,

    /// Member cap per session (routed mode; opaque sessions are pairs)
    #[arg(long, default_value = "256")]
    max_members: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr = if args.addr.starts_with(':') {
        format!("0.0.0.0{}", args.addr)
    } else {
        args.addr.clone()
    };

    let config = RelayConfig {
        mode: args.mode,
        max_members: args.max_members,
        max_session_bytes: args.max_data_relayed * 1024 * 1024,
        ..RelayConfig::default()
    };

    let listener = TcpListener::bind(&addr).await?;
    let server = RelayServer::new(config);
    server.run(listener).await?;

    Ok(())
}
