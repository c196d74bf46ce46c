//! wirechan-echo: length-framed TCP echo server
//!
//! Serves the echo handler on the configured address until stdin reaches
//! end of file, then closes every connection and exits.

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wirechan::config::Config;
use wirechan::protocols::EchoHandler;
use wirechan::{ServerChannel, SharedHandler};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.channel.worker_count(),
        max_frame_size = config.channel.max_frame_size,
        compressor = ?config.channel.compressor,
        "Starting wirechan-echo"
    );

    let echo = Arc::new(EchoHandler::new());
    let server = ServerChannel::bind(
        config.listen.as_str(),
        SharedHandler::new(Arc::clone(&echo)),
        config.channel,
    )?;
    info!(addr = %server.local_addr(), "Ready; close stdin to stop");

    // Block until stdin is closed.
    std::io::copy(&mut std::io::stdin().lock(), &mut std::io::sink())?;

    server.close();
    info!(echoed = echo.echoed(), "Stopped");
    Ok(())
}
