//! Master Server
//!
//! A UDP rendezvous process that:
//! - Keeps a table of session hosts alive through periodic re-registration
//! - Answers host list requests from searching clients
//! - Brokers NAT introductions between a client and a registered host
//!
//! Usage: `master-server [port] [app-id]`

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use peer_session::settings::{DEFAULT_GAME_APP_ID, DEFAULT_MASTER_SERVER_PORT};
use peer_session::{NetworkSettings, QuicConfig, QuicTransport};

mod registry;
mod server;

use server::MasterServer;

// ============================================================================
// Constants
// ============================================================================

/// Longest the loop sleeps waiting for traffic before sweeping again
const TICK_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let port = if args.len() > 1 {
        args[1].parse().unwrap_or(DEFAULT_MASTER_SERVER_PORT)
    } else {
        DEFAULT_MASTER_SERVER_PORT
    };
    let app_id = args.get(2).cloned().unwrap_or_else(|| DEFAULT_GAME_APP_ID.to_string());

    let settings = NetworkSettings {
        game_app_id: app_id,
        master_server_port: port,
        ..NetworkSettings::default()
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let transport = QuicTransport::bind(QuicConfig::client(bind_addr, &settings.game_app_id))?;
    let mut server = MasterServer::new(Box::new(transport), &settings);

    log::info!("Press Ctrl+C to stop");

    server.run(&shutdown, TICK_INTERVAL);
    server.shutdown("master server stopping");
    Ok(())
}
