use crate::config::AppConfig;
use crate::core::StorageClient;
use crate::db::StateStore;
use std::sync::Arc;

/// Everything a run needs, passed explicitly rather than held in globals.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub state: StateStore,
    pub storage: Arc<dyn StorageClient>,
}

impl AppContext {
    pub fn new(config: AppConfig, state: StateStore, storage: Arc<dyn StorageClient>) -> Self {
        Self {
            config: Arc::new(config),
            state,
            storage,
        }
    }
}
