use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::StorageClient;

pub mod drive;
pub mod simulated;

pub fn get_storage(config: &AppConfig) -> anyhow::Result<Arc<dyn StorageClient>> {
    if config.simulation {
        return Ok(Arc::new(simulated::SimulatedStorage::seeded()));
    }

    let client = drive::DriveClient::new(&config.drive, config.call_timeout())?;
    Ok(Arc::new(client))
}
