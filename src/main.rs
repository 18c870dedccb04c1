//! ferryd: a rate-limited HTTP/1.0 file transfer daemon
//!
//! Clients GET files out of a serving root or PUT files into it. The server
//! provides:
//! - A single-threaded readiness event loop owning all socket I/O
//! - A pool of disk worker threads so slow disks never stall the loop
//! - Double-mapped per-connection ring buffers bridging the two
//! - An inode-keyed open-file cache shared across concurrent downloads
//! - A per-connection one-second send-rate window and idle timeouts
//! - Configuration via CLI arguments, a TOML file, and SIGUSR1 reload

mod config;
mod filecache;
mod http;
mod runtime;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        root = %config.root_path.display(),
        port = config.port,
        send_rate = config.send_rate,
        "Starting ferryd"
    );

    // Create and run the server
    let server = Server::new(config);
    server.run()?;

    Ok(())
}
