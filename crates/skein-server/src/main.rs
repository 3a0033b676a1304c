use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use skein_server::config::Args;
use skein_server::filelog::{spawn_flusher, FileLog};
use skein_server::http::{self, AppState};
use skein_server::store::MySqlMessageStore;
use skein_server::{cluster, hub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Args::parse().resolve()?;
    info!(server = %config.server.addr, "skein-server starting");

    // Persistence is optional; the hub routes without it.
    let message_log = match &config.db_source {
        Some(source) => {
            if config.db_driver_supported() {
                let store = Arc::new(MySqlMessageStore::connect(source).await?);
                let (log, intake) = FileLog::open(&config.message_log_path)?;
                spawn_flusher(intake, store);
                Some(log)
            } else {
                warn!("unsupported db driver, persistence disabled");
                None
            }
        }
        None => None,
    };

    let (hub_handle, _queue_task, _dispatch_task) = hub::start(
        config.server.clone(),
        hub::HubOptions {
            group_buffer_size: config.group_buffer_size,
            message_log,
        },
    );

    let state = AppState {
        hub: hub_handle.clone(),
        peer_cfg: config.peer.clone(),
        origins: config.origins.clone(),
    };
    let listen_host = config.listen_host.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve(&listen_host, state).await {
            warn!(error = %e, "http: server exited");
        }
    });

    cluster::bootstrap(&hub_handle, &config).await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    hub_handle.close().await;
    Ok(())
}
