/*!
Relational store: packets in two related tables behind a read-through cache.

`cloud_packets` holds one row per packet and `user_packets` one row per
nested payload, linked by `cloud_packet_id` with cascading update and delete.
Reads are served from a short-lived in-process snapshot when it is fresh;
writes replace both tables inside one transaction and refresh the snapshot.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::{QueryBuilder, Transaction};
use tracing::{debug, info, warn};

use super::connection::{ConnectionManager, PoolSettings};
use super::PacketStore;
use crate::cache::ReadCache;
use crate::config::RelationalConfig;
use crate::model::{check_unique_ids, id_set, id_space_exhausted, normalize_packets, UserPacket};
use crate::{CloudPacket, Result, StoreError};

/// Rows per multi-row INSERT; keeps bind parameters well under SQLite's limit
const INSERT_BATCH_ROWS: usize = 500;
/// Parent ids per `IN (...)` child lookup
const CHILD_LOOKUP_BATCH: usize = 900;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cloud_packets (
        id INTEGER PRIMARY KEY,
        region VARCHAR(32) NOT NULL DEFAULT '',
        name VARCHAR(64) NOT NULL DEFAULT '',
        channel VARCHAR(32) NOT NULL DEFAULT '',
        uploader VARCHAR(64) NOT NULL DEFAULT '',
        time VARCHAR(32) NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_region ON cloud_packets(region)",
    "CREATE INDEX IF NOT EXISTS idx_channel ON cloud_packets(channel)",
    "CREATE INDEX IF NOT EXISTS idx_uploader ON cloud_packets(uploader)",
    "CREATE INDEX IF NOT EXISTS idx_time ON cloud_packets(time)",
    "CREATE INDEX IF NOT EXISTS idx_uploader_time ON cloud_packets(uploader, time)",
    r#"
    CREATE TABLE IF NOT EXISTS user_packets (
        id INTEGER PRIMARY KEY,
        cloud_packet_id INTEGER NOT NULL
            REFERENCES cloud_packets(id) ON UPDATE CASCADE ON DELETE CASCADE,
        name VARCHAR(64) NOT NULL DEFAULT '',
        content TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL DEFAULT 0,
        send_timing VARCHAR(32) NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cloud_packet_id ON user_packets(cloud_packet_id)",
];

#[derive(Debug, sqlx::FromRow)]
struct CloudPacketRow {
    id: i32,
    region: String,
    name: String,
    channel: String,
    uploader: String,
    time: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UserPacketRow {
    id: i32,
    cloud_packet_id: i32,
    name: String,
    content: String,
    size: i32,
    send_timing: String,
}

impl From<UserPacketRow> for UserPacket {
    fn from(row: UserPacketRow) -> Self {
        UserPacket {
            id: row.id,
            name: row.name,
            content: row.content,
            size: row.size,
            send_timing: row.send_timing,
        }
    }
}

/// Timing knobs for the relational store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationalSettings {
    /// How long a loaded snapshot may be served from memory
    pub cache_ttl: Duration,
    /// Loads slower than this are logged as warnings
    pub slow_query_threshold: Duration,
    /// Deadline for every load, save and create
    pub query_timeout: Duration,
}

impl Default for RelationalSettings {
    fn default() -> Self {
        Self::from(&RelationalConfig::default())
    }
}

impl From<&RelationalConfig> for RelationalSettings {
    fn from(config: &RelationalConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            slow_query_threshold: config.slow_query_threshold(),
            query_timeout: config.query_timeout(),
        }
    }
}

/// Relational packet store
pub struct RelationalStore {
    write: SqlitePool,
    read: SqlitePool,
    settings: RelationalSettings,
    cache: ReadCache<Vec<CloudPacket>>,
    /// Orders writes with their cache updates
    writer: tokio::sync::Mutex<()>,
    backend_reads: AtomicU64,
}

impl RelationalStore {
    /// Connect using the standard retry schedule
    pub async fn connect(config: &RelationalConfig) -> Result<Self> {
        Self::connect_with(&ConnectionManager::new(), config).await
    }

    /// Connect through an explicit [`ConnectionManager`]
    ///
    /// # Errors
    /// * `StoreError::ConfigurationMissing` - no primary URL is configured
    /// * `StoreError::Connectivity` - the primary could not be reached
    pub async fn connect_with(manager: &ConnectionManager, config: &RelationalConfig) -> Result<Self> {
        let primary = config.primary_url().ok_or_else(|| {
            StoreError::configuration_missing("no primary database URL configured")
        })?;

        let pools = manager
            .connect_pair(primary, config.read_url(), &PoolSettings::from(config))
            .await?;

        Self::from_pools(pools.write, pools.read, RelationalSettings::from(config)).await
    }

    /// Build a store over already-open pools and provision the schema on the write pool
    pub async fn from_pools(
        write: SqlitePool,
        read: SqlitePool,
        settings: RelationalSettings,
    ) -> Result<Self> {
        provision_schema(&write).await?;

        Ok(Self {
            write,
            read,
            cache: ReadCache::new(settings.cache_ttl),
            settings,
            writer: tokio::sync::Mutex::new(()),
            backend_reads: AtomicU64::new(0),
        })
    }

    /// Number of loads that went to the database instead of the cache
    pub fn backend_reads(&self) -> u64 {
        self.backend_reads.load(Ordering::Relaxed)
    }

    /// Force the next load to query the database
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    /// Close both pools
    pub async fn close(&self) {
        self.write.close().await;
        self.read.close().await;
    }

    async fn with_deadline<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let timeout = self.settings.query_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = timeout.as_millis() as u64, "Query deadline exceeded");
                Err(StoreError::QueryTimeout { operation, timeout })
            }
        }
    }

    async fn query_packets(&self) -> Result<Vec<CloudPacket>> {
        let parents: Vec<CloudPacketRow> = sqlx::query_as(
            "SELECT id, region, name, channel, uploader, time FROM cloud_packets ORDER BY id ASC",
        )
        .fetch_all(&self.read)
        .await?;

        if parents.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i32> = parents.iter().map(|p| p.id).collect();
        let mut children: HashMap<i32, Vec<UserPacket>> = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(CHILD_LOOKUP_BATCH) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT id, cloud_packet_id, name, content, size, send_timing \
                 FROM user_packets WHERE cloud_packet_id IN (",
            );
            let mut list = builder.separated(", ");
            for id in chunk {
                list.push_bind(*id);
            }
            list.push_unseparated(") ORDER BY id ASC");

            let rows: Vec<UserPacketRow> = builder.build_query_as().fetch_all(&self.read).await?;
            for row in rows {
                children
                    .entry(row.cloud_packet_id)
                    .or_default()
                    .push(UserPacket::from(row));
            }
        }

        let packets = parents
            .into_iter()
            .map(|row| CloudPacket {
                user_packets: children.remove(&row.id).unwrap_or_default(),
                id: row.id,
                region: row.region,
                name: row.name,
                channel: row.channel,
                uploader: row.uploader,
                time: row.time,
            })
            .collect();

        Ok(normalize_packets(packets))
    }

    async fn replace_all(&self, packets: &[CloudPacket]) -> Result<()> {
        let mut tx = self.write.begin().await.map_err(StoreError::transaction)?;

        sqlx::query("DELETE FROM user_packets")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::transaction)?;
        sqlx::query("DELETE FROM cloud_packets")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::transaction)?;

        for chunk in packets.chunks(INSERT_BATCH_ROWS) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO cloud_packets (id, region, name, channel, uploader, time) ",
            );
            builder.push_values(chunk, |mut row, p| {
                row.push_bind(p.id)
                    .push_bind(p.region.as_str())
                    .push_bind(p.name.as_str())
                    .push_bind(p.channel.as_str())
                    .push_bind(p.uploader.as_str())
                    .push_bind(p.time.as_str());
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(StoreError::transaction)?;
        }

        let nested: Vec<(i32, &UserPacket)> = packets
            .iter()
            .flat_map(|p| p.user_packets.iter().map(move |u| (p.id, u)))
            .collect();
        insert_user_packets(&mut tx, &nested).await?;

        tx.commit().await.map_err(StoreError::transaction)
    }

    async fn insert_one(&self, packet: &CloudPacket) -> Result<i32> {
        let mut tx = self.write.begin().await.map_err(StoreError::transaction)?;

        // Computing the id inside the INSERT takes the write lock up front, so
        // concurrent creates serialize instead of racing on MAX(id). No row is
        // inserted once the next id would leave the i32 range.
        let inserted: Option<(i32,)> = sqlx::query_as(
            "INSERT INTO cloud_packets (id, region, name, channel, uploader, time) \
             SELECT next_id, ?, ?, ?, ?, ? \
             FROM (SELECT COALESCE(MAX(id), 0) + 1 AS next_id FROM cloud_packets) \
             WHERE next_id <= 2147483647 \
             RETURNING id",
        )
        .bind(packet.region.as_str())
        .bind(packet.name.as_str())
        .bind(packet.channel.as_str())
        .bind(packet.uploader.as_str())
        .bind(packet.time.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::transaction)?;
        let Some((id,)) = inserted else {
            return Err(id_space_exhausted());
        };

        let nested: Vec<(i32, &UserPacket)> = packet.user_packets.iter().map(|u| (id, u)).collect();
        insert_user_packets(&mut tx, &nested).await?;

        tx.commit().await.map_err(StoreError::transaction)?;
        Ok(id)
    }

    async fn delete_ids(&self, ids: &[i32]) -> Result<u64> {
        let mut tx = self.write.begin().await.map_err(StoreError::transaction)?;
        let mut removed = 0;

        for chunk in ids.chunks(CHILD_LOOKUP_BATCH) {
            delete_in(&mut tx, "DELETE FROM user_packets WHERE cloud_packet_id IN (", chunk).await?;
            removed += delete_in(&mut tx, "DELETE FROM cloud_packets WHERE id IN (", chunk).await?;
        }

        tx.commit().await.map_err(StoreError::transaction)?;
        Ok(removed)
    }
}

async fn delete_in(tx: &mut Transaction<'_, Sqlite>, head: &str, ids: &[i32]) -> Result<u64> {
    let mut builder = QueryBuilder::<Sqlite>::new(head);
    let mut list = builder.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");

    let result = builder
        .build()
        .execute(&mut **tx)
        .await
        .map_err(StoreError::transaction)?;
    Ok(result.rows_affected())
}

async fn insert_user_packets(
    tx: &mut Transaction<'_, Sqlite>,
    nested: &[(i32, &UserPacket)],
) -> Result<()> {
    for chunk in nested.chunks(INSERT_BATCH_ROWS) {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO user_packets (id, cloud_packet_id, name, content, size, send_timing) ",
        );
        builder.push_values(chunk, |mut row, (parent_id, u)| {
            row.push_bind(u.id)
                .push_bind(*parent_id)
                .push_bind(u.name.as_str())
                .push_bind(u.content.as_str())
                .push_bind(u.size)
                .push_bind(u.send_timing.as_str());
        });
        builder
            .build()
            .execute(&mut **tx)
            .await
            .map_err(StoreError::transaction)?;
    }
    Ok(())
}

async fn provision_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("Packet schema provisioned");
    Ok(())
}

#[async_trait]
impl PacketStore for RelationalStore {
    fn name(&self) -> &'static str {
        "relational"
    }

    async fn save(&self, packets: &[CloudPacket]) -> Result<()> {
        check_unique_ids(packets)?;
        let packets = normalize_packets(packets.to_vec());

        let _writer = self.writer.lock().await;
        self.with_deadline("save", self.replace_all(&packets)).await?;

        #[cfg(feature = "metrics")]
        crate::observability::StoreMetrics::global().record_write();

        debug!(count = packets.len(), "Replaced packet tables");
        self.cache.put(packets);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<CloudPacket>> {
        if let Some(cached) = self.cache.get_fresh() {
            #[cfg(feature = "metrics")]
            crate::observability::StoreMetrics::global().record_cache_hit();
            return Ok(cached.as_ref().clone());
        }

        #[cfg(feature = "metrics")]
        crate::observability::StoreMetrics::global().record_cache_miss();

        self.backend_reads.fetch_add(1, Ordering::Relaxed);
        let ticket = self.cache.begin_read();
        let started = Instant::now();
        let packets = self.with_deadline("load", self.query_packets()).await?;
        let elapsed = started.elapsed();

        #[cfg(feature = "metrics")]
        crate::observability::StoreMetrics::global().record_query_latency(elapsed);

        if elapsed > self.settings.slow_query_threshold {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.settings.slow_query_threshold.as_millis() as u64,
                count = packets.len(),
                "Slow packet load"
            );
        }

        Ok(self.cache.fill(ticket, packets).as_ref().clone())
    }

    async fn create(&self, mut packet: CloudPacket) -> Result<CloudPacket> {
        packet.normalize();
        let _writer = self.writer.lock().await;
        let inserted = self.with_deadline("create", self.insert_one(&packet)).await;
        self.cache.invalidate();
        packet.id = inserted?;

        info!(id = packet.id, uploader = %packet.uploader, "Created packet");
        Ok(packet)
    }

    async fn remove_exported(&self, exported: &[CloudPacket]) -> Result<()> {
        let ids: Vec<i32> = id_set(exported).into_iter().collect();
        if ids.is_empty() {
            return Ok(());
        }

        let _writer = self.writer.lock().await;
        let removed = self.with_deadline("remove_exported", self.delete_ids(&ids)).await;
        self.cache.invalidate();
        let removed = removed?;

        info!(removed, exported = ids.len(), "Removed exported packets");
        Ok(())
    }

    async fn backup(&self) -> Result<()> {
        // Snapshots are exported by the scheduler through `load`.
        Ok(())
    }
}
