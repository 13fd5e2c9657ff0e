use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use hookrelay_storage::Database;

use crate::{
    idempotency::{is_sqlite_busy, IdempotencyStore, StoreError},
    tap::{StageEvent, StageKind, StageMetadata, TapHub},
};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Background worker that expires idempotency records and checkpoints the WAL.
#[derive(Clone)]
pub struct MaintenanceWorker {
    store: Arc<dyn IdempotencyStore>,
    database: Option<Database>,
    tap: TapHub,
    clock: Clock,
    interval: Duration,
    retention: Duration,
}

impl MaintenanceWorker {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        tap: TapHub,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            database: None,
            tap,
            clock: Arc::new(Utc::now),
            interval,
            retention,
        }
    }

    /// Enables WAL checkpoints after each sweep.
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    /// Overrides the clock used for determining retention thresholds.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle (retention sweep + checkpoint).
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let now = (self.clock)();
        let threshold = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .ok_or(MaintenanceError::Retention(self.retention))?;

        let (deleted, busy) = match self.store.purge_expired(threshold).await {
            Ok(deleted) => (deleted, false),
            Err(err) if err.is_busy() => {
                counter!("db_busy_total", "op" => "ttl").increment(1);
                warn!(stage = "storage", error = %err, "retention sweep hit busy timeout");
                (0, true)
            }
            Err(err) => return Err(MaintenanceError::Purge(err)),
        };
        counter!("idempotency_expired_total").increment(deleted);

        info!(
            stage = "storage",
            table = "idempotency_records",
            deleted,
            busy,
            threshold = %threshold.to_rfc3339(),
            "idempotency retention sweep completed"
        );
        self.publish_storage_event(
            "ttl.idempotency_records",
            json!({
                "table": "idempotency_records",
                "deleted": deleted,
                "threshold": threshold.to_rfc3339(),
                "busy": busy,
            }),
        );

        if let Some(database) = &self.database {
            self.run_checkpoint(database).await?;
        }

        Ok(())
    }

    async fn run_checkpoint(&self, database: &Database) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        match database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                let busy = stats.busy_frames > 0;
                if busy {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
                self.publish_storage_event(
                    "wal.checkpoint",
                    json!({
                        "busy_frames": stats.busy_frames,
                        "log_frames": stats.log_frames,
                        "checkpointed_frames": stats.checkpointed_frames,
                        "busy": busy,
                    }),
                );
                Ok(())
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                self.publish_storage_event(
                    "wal.checkpoint",
                    json!({ "busy": true, "error": "database busy" }),
                );
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }

    fn publish_storage_event(&self, message: &str, out: serde_json::Value) {
        self.tap.publish(
            StageEvent::new(StageKind::Storage, (self.clock)())
                .with_meta(StageMetadata {
                    message: Some(message.to_string()),
                    ..StageMetadata::default()
                })
                .with_out(out),
        );
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("retention window {0:?} is out of range")]
    Retention(Duration),
    #[error("failed to purge expired idempotency records")]
    Purge(#[source] StoreError),
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}
