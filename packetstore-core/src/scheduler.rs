/*!
Periodic snapshot-and-remove job.

Every tick exports the active store's full record set to a dated JSON file and
then removes exactly the exported packets from the store. Removal only happens
after the export is synced to disk, and a snapshot file is never overwritten:
a second tick within the same minute fails instead. A tick that fails before
removal leaves the data in place for a later tick.
*/

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::config::BackupConfig;
use crate::storage::PacketStore;
use crate::{Result, StoreError};

/// File name of the snapshot taken at `now`, e.g. `20240305-07-09-saved`
pub fn snapshot_file_name(now: DateTime<Local>) -> String {
    now.format("%Y%m%d-%H-%M-saved").to_string()
}

/// Step of a tick, used to report where a tick failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStage {
    Load,
    Encode,
    Snapshot,
    Remove,
    Backup,
}

impl TickStage {
    fn as_str(self) -> &'static str {
        match self {
            TickStage::Load => "load",
            TickStage::Encode => "encode",
            TickStage::Snapshot => "snapshot",
            TickStage::Remove => "remove",
            TickStage::Backup => "backup",
        }
    }

    fn failure_message(self) -> &'static str {
        match self {
            TickStage::Load | TickStage::Encode | TickStage::Snapshot => {
                "Snapshot tick failed, store left untouched"
            }
            TickStage::Remove => "Snapshot written but exported packets were not removed",
            TickStage::Backup => "Exported packets removed but the backup hook failed",
        }
    }
}

impl fmt::Display for TickStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn failed_at(stage: TickStage) -> impl FnOnce(StoreError) -> (TickStage, StoreError) {
    move |e| (stage, e)
}

/// Outcome of a successful tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub path: PathBuf,
    pub packets: usize,
}

/// Snapshot/reset scheduler bound to one store
pub struct BackupScheduler {
    store: Arc<dyn PacketStore>,
    snapshot_dir: PathBuf,
    interval: Duration,
}

impl BackupScheduler {
    pub fn new(store: Arc<dyn PacketStore>, config: &BackupConfig) -> Self {
        Self {
            store,
            snapshot_dir: config.snapshot_dir(),
            interval: config.interval(),
        }
    }

    pub fn with_snapshot_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.snapshot_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Run one export-then-remove cycle stamped with `now`
    ///
    /// # Errors
    /// Load, encode and snapshot write failures are returned before the store is
    /// touched; an existing snapshot file of the same name counts as a write
    /// failure. Removal and backup-hook failures are returned after the snapshot
    /// was written. Each failure is logged with the step that failed.
    pub async fn run_tick(&self, now: DateTime<Local>) -> Result<TickReport> {
        match self.export_and_remove(now).await {
            Ok(report) => Ok(report),
            Err((stage, e)) => {
                error!(
                    backend = self.store.name(),
                    stage = %stage,
                    error = %e,
                    "{}",
                    stage.failure_message()
                );
                Err(e)
            }
        }
    }

    async fn export_and_remove(
        &self,
        now: DateTime<Local>,
    ) -> std::result::Result<TickReport, (TickStage, StoreError)> {
        let packets = self.store.load().await.map_err(failed_at(TickStage::Load))?;

        let bytes = serde_json::to_vec(&packets).map_err(|e| {
            (
                TickStage::Encode,
                StoreError::serialization(format!("failed to encode snapshot: {e}")),
            )
        })?;

        let path = self.snapshot_dir.join(snapshot_file_name(now));
        write_snapshot(&self.snapshot_dir, &path, &bytes)
            .await
            .map_err(failed_at(TickStage::Snapshot))?;

        self.store
            .remove_exported(&packets)
            .await
            .map_err(failed_at(TickStage::Remove))?;
        self.store.backup().await.map_err(failed_at(TickStage::Backup))?;

        info!(
            backend = self.store.name(),
            path = %path.display(),
            packets = packets.len(),
            bytes = bytes.len(),
            "Snapshot written and exported packets removed"
        );
        Ok(TickReport {
            path,
            packets: packets.len(),
        })
    }

    /// Start ticking in the background; the first tick fires one interval from now
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs_f64(), "Backup scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failures are logged by run_tick with the failing step.
                        let _outcome = self.run_tick(Local::now()).await;

                        #[cfg(feature = "metrics")]
                        crate::observability::StoreMetrics::global().record_snapshot(_outcome.is_ok());
                    }
                    _ = stop.changed() => break,
                }
            }
            info!("Backup scheduler stopped");
        });

        SchedulerHandle { shutdown, task }
    }
}

/// Write a new snapshot file and sync it; an existing file is never replaced
async fn write_snapshot(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| StoreError::write(dir, e))?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| StoreError::write(path, e))?;

    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = written {
        drop(file);
        // Only this tick created the file, so a partial one is safe to discard.
        let _ = tokio::fs::remove_file(path).await;
        return Err(StoreError::write(path, e));
    }
    Ok(())
}

/// Handle to a running scheduler task
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the scheduler after any in-flight tick completes
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Backup scheduler task ended abnormally");
        }
    }
}
