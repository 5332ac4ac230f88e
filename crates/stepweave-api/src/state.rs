//! Application state wiring the engine to its adapters.

use std::sync::Arc;

use stepweave_core::event::EventBus;
use stepweave_core::flow::Orchestrator;
use stepweave_infra::sqlite::pool::database_url_for;
use stepweave_infra::sqlite::{DatabasePool, SqliteSnapshotStore};
use stepweave_types::config::{EngineConfig, StoreConfig};

use crate::cli::progress;

/// Concrete services shared by the command handlers.
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: SqliteSnapshotStore,
}

impl AppState {
    /// Open the snapshot database and build the orchestrator.
    ///
    /// With `show_progress`, step lifecycle events are printed as they
    /// happen.
    pub async fn init(config: EngineConfig, show_progress: bool) -> anyhow::Result<Self> {
        ensure_store_dir(&config.store).await?;
        let db_pool = DatabasePool::new(&database_url_for(&config.store)).await?;

        let mut orchestrator = Orchestrator::new(config);
        if show_progress {
            let bus = EventBus::new(256);
            progress::spawn_printer(bus.subscribe());
            orchestrator = orchestrator.with_emitter(Arc::new(bus));
        }

        Ok(Self {
            orchestrator,
            store: SqliteSnapshotStore::new(db_pool),
        })
    }
}

async fn ensure_store_dir(store: &StoreConfig) -> anyhow::Result<()> {
    let dir = match &store.database_path {
        Some(path) => path.parent().map(|p| p.to_path_buf()),
        None => Some(stepweave_infra::sqlite::pool::default_data_dir()),
    };
    if let Some(dir) = dir.filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(&dir).await?;
    }
    Ok(())
}
