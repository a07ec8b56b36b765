/*!
Local filesystem store: the whole record set as one JSON document.
*/

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::PacketStore;
use crate::model::{check_unique_ids, id_set, id_space_exhausted, max_id, normalize_packets};
use crate::{CloudPacket, Result, StoreError};

/// Id sequence owned by the store
///
/// `None` until first recovered from the document. Once set it only moves
/// forward, so ids handed out before a reset are not reissued afterwards.
/// Kept as `i64` so a stored `i32::MAX` can be recorded without overflow.
#[derive(Debug, Default)]
struct IdSequence {
    next: Option<i64>,
}

impl IdSequence {
    fn issue(&mut self, stored: &[CloudPacket]) -> Result<i32> {
        let floor = max_id(stored).map_or(1, |max| i64::from(max) + 1);
        let id = self.next.map_or(floor, |next| next.max(floor));
        let issued = i32::try_from(id).map_err(|_| id_space_exhausted())?;
        self.next = Some(id + 1);
        Ok(issued)
    }

    fn advance_past(&mut self, stored: &[CloudPacket]) {
        if let Some(max) = max_id(stored) {
            self.next = Some(self.next.unwrap_or(1).max(i64::from(max) + 1));
        }
    }
}

/// File-backed packet store
///
/// Every operation goes through one reader/writer lock: `load` takes the read
/// side, `save`, `create` and `reset` take the write side. Writes land in a
/// temporary file next to the target and are renamed over it, so a reader
/// never sees a partially written document.
///
/// # Example
/// ```rust,no_run
/// use packetstore_core::{LocalFileStore, PacketStore};
///
/// # async fn demo() -> packetstore_core::Result<()> {
/// let store = LocalFileStore::new("/var/lib/packets/packets.json");
/// let packets = store.load().await?; // empty on first run
/// store.save(&packets).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LocalFileStore {
    path: PathBuf,
    sequence: RwLock<IdSequence>,
}

impl LocalFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            sequence: RwLock::new(IdSequence::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the document; a missing or blank file is an empty set
    async fn read_document(&self) -> Result<Vec<CloudPacket>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Packet file missing, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let packets: Vec<CloudPacket> = serde_json::from_slice(&bytes)?;
        Ok(normalize_packets(packets))
    }

    /// Replace the document atomically
    async fn write_document(&self, packets: &[CloudPacket]) -> Result<()> {
        let bytes = serde_json::to_vec(packets)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| StoreError::write(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::write(path, e))?;
    temp.write_all(bytes).map_err(|e| StoreError::write(path, e))?;
    temp.as_file().sync_all().map_err(|e| StoreError::write(path, e))?;
    temp.persist(path).map_err(|e| StoreError::write(path, e.error))?;
    Ok(())
}

#[async_trait]
impl PacketStore for LocalFileStore {
    fn name(&self) -> &'static str {
        "lfs"
    }

    async fn save(&self, packets: &[CloudPacket]) -> Result<()> {
        check_unique_ids(packets)?;
        let packets = normalize_packets(packets.to_vec());

        let mut sequence = self.sequence.write().await;
        self.write_document(&packets).await?;
        sequence.advance_past(&packets);

        debug!(path = %self.path.display(), count = packets.len(), "Saved packet file");
        Ok(())
    }

    async fn load(&self) -> Result<Vec<CloudPacket>> {
        let _guard = self.sequence.read().await;
        self.read_document().await
    }

    async fn create(&self, mut packet: CloudPacket) -> Result<CloudPacket> {
        let mut sequence = self.sequence.write().await;
        let mut packets = self.read_document().await?;

        packet.id = sequence.issue(&packets)?;
        packet.normalize();
        packets.push(packet.clone());
        self.write_document(&packets).await?;

        info!(id = packet.id, uploader = %packet.uploader, "Created packet");
        Ok(packet)
    }

    async fn reset(&self) -> Result<()> {
        let _guard = self.sequence.write().await;
        self.write_document(&[]).await?;
        info!(path = %self.path.display(), "Reset packet file");
        Ok(())
    }

    async fn remove_exported(&self, exported: &[CloudPacket]) -> Result<()> {
        let exported = id_set(exported);
        let _guard = self.sequence.write().await;

        let mut packets = self.read_document().await?;
        let before = packets.len();
        packets.retain(|p| !exported.contains(&p.id));
        self.write_document(&packets).await?;

        info!(
            path = %self.path.display(),
            removed = before - packets.len(),
            kept = packets.len(),
            "Removed exported packets"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserPacket;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn packet(id: i32, user_ids: &[i32]) -> CloudPacket {
        CloudPacket {
            id,
            region: "r1".to_string(),
            name: format!("n{id}"),
            channel: "c1".to_string(),
            uploader: "u1".to_string(),
            time: "t1".to_string(),
            user_packets: user_ids
                .iter()
                .map(|&uid| UserPacket {
                    id: uid,
                    name: "x".to_string(),
                    content: format!("content-{uid}"),
                    size: 1,
                    send_timing: "z".to_string(),
                })
                .collect(),
        }
    }

    fn store_in(dir: &TempDir) -> LocalFileStore {
        LocalFileStore::new(dir.path().join("packets.json"))
    }

    #[tokio::test]
    async fn test_cold_start_missing_and_blank_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        assert!(store.load().await.unwrap().is_empty());

        std::fs::write(store.path(), "  \n").unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);

        store
            .save(&[packet(2, &[7, 3]), packet(1, &[1])])
            .await
            .unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], packet(1, &[1]));
        assert_eq!(loaded[1].id, 2);
        let nested: Vec<i32> = loaded[1].user_packets.iter().map(|p| p.id).collect();
        assert_eq!(nested, vec![3, 7]);
    }

    #[tokio::test]
    async fn test_save_rejects_duplicate_ids_and_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        store.save(&[packet(1, &[])]).await.unwrap();

        let err = store
            .save(&[packet(5, &[]), packet(5, &[])])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert_eq!(store.load().await.unwrap(), vec![packet(1, &[])]);
    }

    #[tokio::test]
    async fn test_create_assigns_monotonic_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);

        let first = store.create(packet(99, &[1])).await.unwrap();
        assert_eq!(first.id, 1);
        let second = store.create(packet(99, &[])).await.unwrap();
        assert_eq!(second.id, 2);

        store.save(&[packet(10, &[])]).await.unwrap();
        assert_eq!(store.create(packet(0, &[])).await.unwrap().id, 11);

        store.reset().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
        assert_eq!(store.create(packet(0, &[])).await.unwrap().id, 12);
    }

    #[tokio::test]
    async fn test_sequence_recovered_from_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("packets.json");
        std::fs::write(&path, serde_json::to_vec(&vec![packet(41, &[])]).unwrap()).unwrap();

        let store = LocalFileStore::new(&path);
        assert_eq!(store.create(packet(0, &[])).await.unwrap().id, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_get_distinct_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&temp_dir));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.create(packet(0, &[])).await.unwrap().id })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=16).collect::<Vec<_>>());
        assert_eq!(store.load().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_max_id_is_storable_but_not_extendable() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);

        store.save(&[packet(i32::MAX, &[1])]).await.unwrap();
        assert_eq!(store.load().await.unwrap()[0].id, i32::MAX);

        let err = store.create(packet(0, &[])).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert_eq!(store.load().await.unwrap().len(), 1);

        // A fresh store recovering the same document refuses as well.
        let reopened = store_in(&temp_dir);
        assert!(reopened.create(packet(0, &[])).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_exported_keeps_later_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        store.save(&[packet(1, &[1]), packet(2, &[2])]).await.unwrap();

        let exported = store.load().await.unwrap();
        let late = store.create(packet(0, &[3])).await.unwrap();
        store.remove_exported(&exported).await.unwrap();

        assert_eq!(store.load().await.unwrap(), vec![late]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        std::fs::write(store.path(), "[{\"id\":").unwrap();

        let err = store.load().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Json);
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_to_caller() {
        let temp_dir = TempDir::new().unwrap();
        // The target is an existing directory, so the final rename fails.
        let store = LocalFileStore::new(temp_dir.path());

        let err = store.save(&[packet(1, &[])]).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Write);
    }

    #[tokio::test]
    async fn test_nested_directories_are_created() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path().join("data/cloud/packets"));

        store.save(&[packet(1, &[])]).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }
}
