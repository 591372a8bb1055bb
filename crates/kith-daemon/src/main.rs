//! kithd: runs the Me backend of this device.
//!
//! Devices are reached through an in-process hub; a network transport plugs
//! in behind the same `Transport` trait.

mod config;

use std::sync::Arc;

use kith_me::{Backend, Services};
use kith_transport::Hub;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = DaemonConfig::load()?;

    // 2. Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("kith={}", config.logging.level).parse()?),
        )
        .init();

    info!("kith daemon starting");

    let me_config = config.me_config();
    std::fs::create_dir_all(&me_config.data_dir)?;
    info!(data_dir = %me_config.data_dir.display(), "data directory");

    // 3. Bind this device to the transport
    let node_id = Backend::load_node_id(&me_config)?;
    let hub = Hub::new();
    let (endpoint, incoming) = hub.connect(node_id);

    // 4. Open and start the backend
    let backend = Backend::new(me_config, Arc::new(endpoint), incoming, Services::memory())?;
    backend.start()?;
    match backend.get() {
        Ok(info) => info!(id = %info.id, status = %info.status, node_id = %node_id, "identity loaded"),
        Err(e) => warn!(error = %e, "no current identity"),
    }

    // 5. Follow identity events
    if config.logging.events {
        let mut events = backend.events().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => info!(
                        event = %event.event_type,
                        id = %event.entity_id,
                        payload = %event.payload,
                        "identity event"
                    ),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // 6. Run until Ctrl-C
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("unable to listen for Ctrl-C: {}", e);
    }
    info!("Ctrl-C received, shutting down");

    backend.stop();
    info!("kith daemon stopped");
    Ok(())
}
