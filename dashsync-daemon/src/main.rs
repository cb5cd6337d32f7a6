//! dashsync daemon - serves the WebSocket sync endpoint.
//!
//! Opens the store named by `DASHSYNC_DATA_DIR` (in memory when unset),
//! accepts device sessions on `DASHSYNC_BIND` and periodically drops
//! backups past the retention window.

mod config;

use log::{error, info, warn};
use std::sync::Arc;

use dashsync_core::now_millis;
use dashsync_server::engine::{EngineConfig, SyncEngine};
use dashsync_server::storage::{MemoryStore, RocksStore, StoreConfig};
use dashsync_server::{StaticTokenAuthenticator, SyncServer};

use config::DaemonConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn build_engine(config: &DaemonConfig) -> Result<SyncEngine, BoxError> {
    let engine_config = EngineConfig {
        backup_cadence: config.backup_cadence,
    };
    let engine = match &config.data_dir {
        Some(dir) => {
            let store = Arc::new(RocksStore::open(StoreConfig::at(dir))?);
            info!("Using RocksDB store at {}", dir.display());
            SyncEngine::new(store.clone(), store, engine_config)
        }
        None => {
            warn!("DASHSYNC_DATA_DIR not set, dashboards are kept in memory only");
            let store = Arc::new(MemoryStore::new());
            SyncEngine::new(store.clone(), store, engine_config)
        }
    };
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = DaemonConfig::from_env()?;
    let authenticator = StaticTokenAuthenticator::parse(&config.tokens)?;
    if authenticator.is_empty() {
        warn!("DASHSYNC_TOKENS is empty, every session will be refused");
    }

    let engine = Arc::new(build_engine(&config)?);
    let server = Arc::new(SyncServer::new(
        config.server_config(),
        engine.clone(),
        Arc::new(authenticator),
    ));

    // Retention sweep, followed by a stats line
    let sweep_server = server.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_server.engine().purge_expired_backups(now_millis()) {
                warn!("Backup retention sweep failed: {e}");
            }

            let stats = sweep_server.stats().await;
            info!(
                "{} active connections ({} total), {} users live, {} fan-out messages, {} malformed frames",
                stats.active_connections,
                stats.total_connections,
                stats.broadcast.active_groups,
                stats.broadcast.messages_sent,
                stats.malformed_messages
            );
        }
    });

    info!(
        "dashsync daemon starting on {} (backup cadence {})",
        config.bind_addr, config.backup_cadence
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {e}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
