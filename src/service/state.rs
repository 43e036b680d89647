//! Shared server state.

use std::sync::Arc;

use crate::db::ChatStore;
use crate::service::config::Config;
use crate::service::registry::SessionRegistry;
use crate::service::transfer::TransferCoordinator;
use crate::{Error, Result};

/// State shared by every connection task and the transfer port.
pub struct ServerState {
    pub config: Config,
    pub sessions: SessionRegistry,
    pub transfers: TransferCoordinator,
    pub store: Arc<dyn ChatStore>,
}

impl ServerState {
    pub fn new(config: Config, store: Arc<dyn ChatStore>) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(),
            transfers: TransferCoordinator::new(),
            store,
        }
    }

    /// Run a store call on the blocking thread pool.
    pub async fn db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ChatStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| Error::Unavailable(format!("storage task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;

    fn state() -> ServerState {
        let store = SqliteStore::open_in_memory().unwrap();
        ServerState::new(Config::default(), Arc::new(store))
    }

    #[tokio::test]
    async fn test_db_runs_store_calls() {
        let state = state();
        state
            .db(|store| store.create_group("team", "alice"))
            .await
            .unwrap();
        assert!(state.db(|store| store.group_exists("team")).await.unwrap());
        let again = state.db(|store| store.create_group("team", "bob")).await;
        assert!(matches!(again, Err(Error::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_db_reports_a_panicked_call() {
        let state = state();
        let result: Result<()> = state.db(|_| panic!("boom")).await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }
}

pub type SharedState = Arc<ServerState>;
