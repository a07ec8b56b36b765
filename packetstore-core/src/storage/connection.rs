/*!
Connection establishment for the relational backend.

Pools are opened on a fixed backoff schedule and each attempt must pass a
short liveness ping. When the schedule runs out the caller gets
[`StoreError::Connectivity`] instead of waiting forever.
*/

use std::str::FromStr;
use std::time::Duration;

use packetstore_retry::{retry_with_backoff, transient_error, FixedBackoff, RetryError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Connection;
use tracing::{info, warn};

use crate::config::RelationalConfig;
use crate::{Result, StoreError};

/// Upper bound on a single connect-and-ping attempt
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Pool sizing, fixed for the lifetime of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum open connections
    pub max_open: u32,
    /// Connections kept warm in the pool
    pub max_idle: u32,
    /// Connections older than this are recycled
    pub max_lifetime: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&RelationalConfig::default())
    }
}

impl From<&RelationalConfig> for PoolSettings {
    fn from(config: &RelationalConfig) -> Self {
        Self {
            max_open: config.max_open(),
            max_idle: config.max_idle(),
            max_lifetime: config.conn_max_lifetime(),
        }
    }
}

/// Write pool plus the pool reads should use
#[derive(Debug, Clone)]
pub struct ConnectedPools {
    pub write: SqlitePool,
    pub read: SqlitePool,
    /// True when reads share the write pool
    pub read_is_primary: bool,
}

/// Opens database pools with bounded retry
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    backoff: FixedBackoff,
    ping_timeout: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Manager using the standard 200ms/500ms/1s/2s/5s schedule
    pub fn new() -> Self {
        Self {
            backoff: FixedBackoff::connection_default(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn with_backoff(mut self, backoff: FixedBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// Open one pool, retrying until it answers a ping or the schedule is exhausted
    pub async fn connect(&self, url: &str, settings: &PoolSettings) -> Result<SqlitePool> {
        let connect_options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool_options = SqlitePoolOptions::new()
            .max_connections(settings.max_open.max(1))
            .min_connections(settings.max_idle.min(settings.max_open))
            .max_lifetime(settings.max_lifetime)
            .acquire_timeout(self.ping_timeout);
        let ping_timeout = self.ping_timeout;

        let result = retry_with_backoff("db_connect", self.backoff.clone(), |_attempt| {
            let connect_options = connect_options.clone();
            let pool_options = pool_options.clone();
            Box::pin(async move {
                match tokio::time::timeout(ping_timeout, open_and_ping(pool_options, connect_options))
                    .await
                {
                    Ok(Ok(pool)) => Ok(pool),
                    Ok(Err(e)) => Err(transient_error!("db_connect", e)),
                    Err(elapsed) => Err(transient_error!("db_connect", elapsed)),
                }
            })
        })
        .await;

        match result {
            Ok(pool) => {
                info!(target_db = %redact(url), max_open = settings.max_open, "Database pool ready");
                Ok(pool)
            }
            Err(err) => Err(connectivity_error(url, err)),
        }
    }

    /// Open the primary pool and, if configured, a secondary read pool
    ///
    /// The primary is required. A missing or unreachable secondary falls back to
    /// the primary pool for reads.
    pub async fn connect_pair(
        &self,
        primary: &str,
        secondary: Option<&str>,
        settings: &PoolSettings,
    ) -> Result<ConnectedPools> {
        let write = self.connect(primary, settings).await?;

        let Some(secondary) = secondary else {
            return Ok(ConnectedPools {
                read: write.clone(),
                write,
                read_is_primary: true,
            });
        };

        match self.connect(secondary, settings).await {
            Ok(read) => Ok(ConnectedPools {
                write,
                read,
                read_is_primary: false,
            }),
            Err(e) => {
                warn!(
                    target_db = %redact(secondary),
                    error = %e,
                    "Read replica unavailable, reading from primary"
                );
                Ok(ConnectedPools {
                    read: write.clone(),
                    write,
                    read_is_primary: true,
                })
            }
        }
    }
}

async fn open_and_ping(
    pool_options: SqlitePoolOptions,
    connect_options: SqliteConnectOptions,
) -> std::result::Result<SqlitePool, sqlx::Error> {
    let pool = pool_options.connect_with(connect_options).await?;

    match ping(&pool).await {
        Ok(()) => Ok(pool),
        Err(e) => {
            pool.close().await;
            Err(e)
        }
    }
}

async fn ping(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}

fn connectivity_error(url: &str, err: RetryError) -> StoreError {
    StoreError::Connectivity {
        target: redact(url),
        attempts: err.attempts().unwrap_or(1),
        source: Some(Box::new(err)),
    }
}

/// Strip credentials and query parameters from a database URL before logging it
fn redact(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    match (without_query.find("://"), without_query.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &without_query[..scheme_end], &without_query[at + 1..])
        }
        _ => without_query.to_string(),
    }
}
