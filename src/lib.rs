pub mod config;
pub mod error;
pub mod state;
pub mod db;
pub mod models;
pub mod store;
pub mod integrity;
pub mod policy;
pub mod stats;
pub mod telemetry;
pub mod audit;
pub mod revert;
pub mod trace;

use std::sync::Arc;

use crate::config::Config;
use crate::state::{LedgerState, SharedState};
use crate::store::{MemoryStore, PgStore, StoreError};

/// Load `.env` and config from the environment, start tracing, connect to Postgres and run
/// migrations.
pub async fn connect_from_env() -> Result<SharedState, StoreError> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(StoreError::Unavailable)?;
    telemetry::init_tracing(&config);

    let store = PgStore::connect(&config).await?;
    tracing::info!("Ledger connected");

    Ok(LedgerState::new(Arc::new(store), config).shared())
}

/// Ledger over an in-process store. Nothing is persisted.
pub fn in_memory(config: Config) -> (SharedState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = LedgerState::new(store.clone(), config).shared();
    (state, store)
}
