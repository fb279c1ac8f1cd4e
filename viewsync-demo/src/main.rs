//! viewsync demo: serves the counter application over WebSocket.
//!
//! ```text
//! viewsync-demo          serve on VIEWSYNC_BIND (default 127.0.0.1:9090)
//! viewsync-demo tour     serve on a free port and drive it with a client
//! ```
//!
//! `VIEWSYNC_DATA` enables RocksDB persistence at the given path.
//! Log filtering follows `RUST_LOG` (default `info`).

mod app;

use app::CounterApp;
use log::{error, info};
use std::sync::Arc;
use viewsync_collab::{ClientError, ServerConfig, SyncClient, SyncServer};
use viewsync_core::CommandInstruction;

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("VIEWSYNC_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(path) = std::env::var("VIEWSYNC_DATA") {
        config.storage_path = Some(path.into());
    }
    config
}

/// Run a few commands through a real client and print the mirrored graph.
async fn tour(server: SyncServer) -> Result<(), ClientError> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind: {e}");
            return Ok(());
        }
    };
    let url = match listener.local_addr() {
        Ok(addr) => format!("ws://{addr}"),
        Err(e) => {
            error!("Failed to read local address: {e}");
            return Ok(());
        }
    };
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!("Server stopped: {e}");
        }
    });

    let client = SyncClient::connect(&url).await?;
    client.open(Some("tour")).await?;
    let counter = {
        let mirror = client.mirror().await;
        mirror
            .get(mirror.root(), "counter")
            .and_then(|v| v.as_node())
            .and_then(|key| mirror.id_of(key))
    };
    let Some(counter) = counter else {
        error!("Snapshot has no counter");
        return Ok(());
    };

    for name in ["increment", "increment", "decrement", "increment"] {
        let status = client.execute(CommandInstruction::new(name, counter)).await?;
        info!("{name}: {status:?}");
    }
    let mirror = client.mirror().await;
    println!("{:#}", mirror.to_json(mirror.root()));
    drop(mirror);
    client.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    let server = match SyncServer::new(config, Arc::new(CounterApp::new("viewsync counter"))) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    if std::env::args().nth(1).as_deref() == Some("tour") {
        if let Err(e) = tour(server).await {
            error!("Tour failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    info!("Starting viewsync demo on {}", server.bind_addr());
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
