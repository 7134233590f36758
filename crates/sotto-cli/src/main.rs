//! sotto terminal client.
//!
//! Connects to a relay, creates or joins a session, and drives an
//! encrypted chat from stdin. The heavy lifting lives in `sotto-core`;
//! this binary is argument parsing, a line-based prompt, and an event
//! printer.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

/// sotto - end-to-end encrypted chat through an untrusted relay
#[derive(Parser)]
#[command(name = "sotto")]
#[command(author, version, about)]
pub struct Args {
    /// Relay server address. TLS is used automatically unless the
    /// address starts with `localhost:`
    #[arg(long, default_value = "localhost:8080")]
    pub relay_server_addr: String,

    /// Session id to join; omit to create a new session
    #[arg(long)]
    pub session_id: Option<String>,

    /// Nickname shown to the peer
    #[arg(long, default_value = "anonymous")]
    pub nickname: String,

    /// Maximum file size to offer or accept, in MB
    #[arg(long, default_value = "10")]
    pub max_file_size: u64,

    /// Directory incoming files are saved to
    #[arg(long, default_value = ".")]
    pub download_dir: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = commands::run(args).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
