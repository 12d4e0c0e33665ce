//! threaded-server: a thread-per-connection TCP echo server
//!
//! Serves each client on its own thread and shuts down gracefully on
//! SIGINT/SIGTERM, waiting for connected clients to finish.

use threaded_server::config::Config;
use threaded_server::runtime::{install_signal_handlers, TERMINATION};
use threaded_server::{logging, server};
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    logging::init(&config);
    config.log_summary();

    install_signal_handlers()?;

    info!(
        port = config.port,
        max_clients = config.max_clients,
        "Starting threaded server"
    );

    match server::run(config, &TERMINATION) {
        Ok(()) => {
            info!("Server exited");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            Err(e.into())
        }
    }
}
