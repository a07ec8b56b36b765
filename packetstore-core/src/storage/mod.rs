/*!
Storage backends for packet records.

This module defines the storage contract (port) and its concrete backends
(adapters). Callers hold an `Arc<dyn PacketStore>` and never need to know
whether records live in a JSON document or in a relational database.
*/

#[cfg(feature = "relational")]
pub mod connection;
pub mod local;
#[cfg(feature = "relational")]
pub mod relational;

use crate::{CloudPacket, Result};
use async_trait::async_trait;

/// Storage contract shared by every backend
///
/// All operations work on whole record sets. Implementations must be safe to
/// call concurrently from many tasks.
#[async_trait]
pub trait PacketStore: Send + Sync {
    /// Short backend label used in logs
    fn name(&self) -> &'static str;

    /// Replace the stored record set with `packets`
    ///
    /// This is a full replace, never a merge. Either the whole new set becomes
    /// visible or, on error, the previous set is left untouched.
    async fn save(&self, packets: &[CloudPacket]) -> Result<()>;

    /// Load the complete record set
    ///
    /// Packets are ascending by id, and so are each packet's user packets.
    async fn load(&self) -> Result<Vec<CloudPacket>>;

    /// Append one packet under a store-assigned id and return the stored packet
    ///
    /// The caller's id is ignored. The new id is one past the current maximum,
    /// or 1 for an empty store.
    async fn create(&self, packet: CloudPacket) -> Result<CloudPacket>;

    /// Empty the store
    async fn reset(&self) -> Result<()> {
        self.save(&[]).await
    }

    /// Remove the packets a snapshot just exported, keeping anything stored since
    ///
    /// Packets are matched by id. Records created or saved after the snapshot's
    /// `load` under ids it did not contain survive. Runs as one atomic step.
    async fn remove_exported(&self, exported: &[CloudPacket]) -> Result<()>;

    /// Backend-specific backup hook, run after the scheduler exports a snapshot
    async fn backup(&self) -> Result<()> {
        Ok(())
    }
}

// Re-export types for convenience
#[cfg(feature = "relational")]
pub use connection::{ConnectionManager, PoolSettings};
pub use local::LocalFileStore;
#[cfg(feature = "relational")]
pub use relational::{RelationalSettings, RelationalStore};

/// Memory-based store for testing
///
/// Keeps the record set in a mutex and can be told to fail loads or saves,
/// which lets scheduler tests exercise their error paths.
#[cfg(test)]
pub struct MemoryStore {
    data: std::sync::Mutex<Vec<CloudPacket>>,
    pub fail_loads: std::sync::atomic::AtomicBool,
    pub fail_saves: std::sync::atomic::AtomicBool,
    pub fail_backups: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new(packets: Vec<CloudPacket>) -> Self {
        Self {
            data: std::sync::Mutex::new(crate::model::normalize_packets(packets)),
            fail_loads: std::sync::atomic::AtomicBool::new(false),
            fail_saves: std::sync::atomic::AtomicBool::new(false),
            fail_backups: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn injected_failure(flag: &std::sync::atomic::AtomicBool, op: &str) -> Result<()> {
        if flag.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected {op} failure"),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl PacketStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, packets: &[CloudPacket]) -> Result<()> {
        Self::injected_failure(&self.fail_saves, "save")?;
        *self.data.lock().unwrap() = crate::model::normalize_packets(packets.to_vec());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<CloudPacket>> {
        Self::injected_failure(&self.fail_loads, "load")?;
        Ok(self.data.lock().unwrap().clone())
    }

    async fn create(&self, mut packet: CloudPacket) -> Result<CloudPacket> {
        Self::injected_failure(&self.fail_saves, "create")?;
        let mut data = self.data.lock().unwrap();
        packet.id = crate::model::next_id(&data)?;
        packet.normalize();
        data.push(packet.clone());
        Ok(packet)
    }

    async fn remove_exported(&self, exported: &[CloudPacket]) -> Result<()> {
        Self::injected_failure(&self.fail_saves, "remove_exported")?;
        let exported = crate::model::id_set(exported);
        self.data.lock().unwrap().retain(|p| !exported.contains(&p.id));
        Ok(())
    }

    async fn backup(&self) -> Result<()> {
        Self::injected_failure(&self.fail_backups, "backup")
    }
}
