/*!
# packetstore core

Storage for hierarchical packet records behind interchangeable backends.

This crate provides:

- The [`CloudPacket`] / [`UserPacket`] record model
- The [`PacketStore`] contract: full-replace `save`, ordered `load`, id-assigning `create`
- [`LocalFileStore`]: the whole record set as one JSON document
- [`RelationalStore`]: two related tables with bounded-retry connections and a read-through cache
- [`BackupScheduler`]: periodic snapshot-then-reset of the active store

## Usage

```rust,no_run
use packetstore_core::{open_store, AppConfig, BackupScheduler};

# async fn demo() -> packetstore_core::Result<()> {
let config = AppConfig::load_or_default("config/config.json");
let store = open_store(&config).await?;

let packets = store.load().await?;
store.save(&packets).await?;

let scheduler = BackupScheduler::new(store.clone(), &config.backup).spawn();
scheduler.shutdown().await;
# Ok(())
# }
```
*/

pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod observability;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use config::{AppConfig, BackupConfig, RelationalConfig, StorageMedia};
pub use error::{ErrorKind, Result, StoreError};
pub use model::{CloudPacket, UserPacket};
pub use observability::{init_default_observability, init_observability};
#[cfg(feature = "metrics")]
pub use observability::StoreMetrics;
pub use scheduler::{BackupScheduler, SchedulerHandle, TickReport, TickStage};
pub use storage::{LocalFileStore, PacketStore};
#[cfg(feature = "relational")]
pub use storage::{ConnectionManager, PoolSettings, RelationalSettings, RelationalStore};

/// Open the backend selected by `config.storage_media`
///
/// # Errors
/// * `StoreError::ConfigurationMissing` - the relational backend has no primary URL,
///   or was selected in a build without the `relational` feature
/// * `StoreError::Connectivity` - the database stayed unreachable for the whole retry schedule
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn PacketStore>> {
    match config.storage_media {
        StorageMedia::LocalFile => {
            let path = config.packets_file();
            tracing::info!(path = %path.display(), "Using local file store");
            Ok(Arc::new(LocalFileStore::new(path)))
        }
        #[cfg(feature = "relational")]
        StorageMedia::Relational => {
            let store = RelationalStore::connect(&config.relational).await?;
            tracing::info!("Using relational store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "relational"))]
        StorageMedia::Relational => Err(StoreError::configuration_missing(
            "relational storage requested but the `relational` feature is disabled",
        )),
    }
}
