//! Room Chat Server - Entry Point
//!
//! Starts the TCP listener and RoomHub actor, accepting connections.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use room_chat::{handle_connection, Config, InMemoryRepository, RoomHub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // e.g., RUST_LOG=debug or RUST_LOG=room_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("room_chat=info")),
        )
        .init();

    let config = Config::from_env();

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Room chat server listening on {}", config.bind_addr);

    // Storage is external; the in-memory repository stands in for it
    let repository = Arc::new(InMemoryRepository::open());
    let (hub, _hub_task) = RoomHub::start(repository, config.hub_capacity);

    info!("RoomHub actor started");

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let hub = hub.clone();
                let mailbox_capacity = config.mailbox_capacity;

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, hub, mailbox_capacity).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
