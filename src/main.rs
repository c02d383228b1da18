//! avserv binary
//!
//! Brings up the configured endpoints and serves until SIGINT or SIGTERM.

use std::sync::Arc;

use avserv::{CliArgs, Server};
use signal_hook::consts::{SIGINT, SIGTERM};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let cli = CliArgs::parse(&args);

    // Initialize logging (-d raises the default filter; RUST_LOG still wins)
    let debug = cli.as_ref().map(|c| c.debug).unwrap_or(false);
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if debug { "debug" } else { "info" }),
    )
    .init();

    let cli = cli?;
    if cli.help {
        print!("{}", avserv::config::USAGE);
        return Ok(());
    }

    log::info!("avserv starting...");
    for spec in &cli.config.endpoints {
        log::info!("  Endpoint:  {}", spec);
    }
    log::info!("  Accept:    {:?}", cli.config.accept_timeout);
    match cli.config.handshake_timeout {
        Some(t) => log::info!("  Handshake: {:?} per step", t),
        None => log::info!("  Handshake: unbounded"),
    }

    let mut server = Server::bind(cli.config)?;

    let shutdown = server.shutdown_handle();
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let metrics = server.metrics();
    server.run()?;

    log::info!("Final metrics:\n{}", metrics.render());
    Ok(())
}
