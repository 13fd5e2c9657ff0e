use std::{str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use hookrelay_core::types::{
    CheckOutcome, DeadLetter, DeadLetterKind, IdempotencyRecord, InboundEvent, Outcome,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000));

        // Shared-cache in-memory databases report table locks instead of waiting on busy_timeout.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the idempotency record table.
    pub fn idempotency(&self) -> IdempotencyRepository {
        IdempotencyRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the dead-letter table.
    pub fn dead_letters(&self) -> DeadLetterRepository {
        DeadLetterRepository {
            pool: self.pool.clone(),
        }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy_frames: row.try_get::<i64, _>(0)?,
            log_frames: row.try_get::<i64, _>(1)?,
            checkpointed_frames: row.try_get::<i64, _>(2)?,
        })
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Counters returned by a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for first-sight records keyed by event identifier.
#[derive(Clone)]
pub struct IdempotencyRepository {
    pool: SqlitePool,
}

impl IdempotencyRepository {
    /// Inserts a pending record unless one already exists.
    ///
    /// The conflict clause makes the test-and-insert a single statement, so
    /// concurrent callers racing on one identifier see exactly one `New`.
    pub async fn check_and_record(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, IdempotencyError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(
            "INSERT INTO idempotency_records (event_id, first_seen_at, outcome, updated_at) \
             VALUES (?, ?, 'pending', ?) \
             ON CONFLICT(event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(CheckOutcome::New)
        } else {
            Ok(CheckOutcome::Duplicate)
        }
    }

    /// Moves a pending record to a terminal outcome. Returns `false` when the
    /// record is missing or already terminal.
    pub async fn mark_outcome(
        &self,
        event_id: &str,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError> {
        let result = sqlx::query(
            "UPDATE idempotency_records SET outcome = ?, updated_at = ? \
             WHERE event_id = ? AND outcome = 'pending'",
        )
        .bind(outcome.as_str())
        .bind(to_rfc3339(now))
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes a record that is still pending.
    pub async fn release(&self, event_id: &str) -> Result<bool, IdempotencyError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_records WHERE event_id = ? AND outcome = 'pending'",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Loads a single record.
    pub async fn fetch(&self, event_id: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let row = sqlx::query(
            "SELECT event_id, first_seen_at, outcome, updated_at \
             FROM idempotency_records WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    /// Deletes up to `limit` records first seen before `threshold`.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM idempotency_records WHERE rowid IN ( \
                 SELECT rowid FROM idempotency_records WHERE first_seen_at < ? LIMIT ? \
             )",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<IdempotencyRecord, IdempotencyError> {
    let outcome: String = row.get("outcome");
    Ok(IdempotencyRecord {
        event_id: row.get("event_id"),
        first_seen_at: parse_rfc3339(&row.get::<String, _>("first_seen_at"))
            .map_err(IdempotencyError::Decode)?,
        outcome: outcome.parse().map_err(IdempotencyError::Decode)?,
        updated_at: parse_rfc3339(&row.get::<String, _>("updated_at"))
            .map_err(IdempotencyError::Decode)?,
    })
}

/// Errors raised by the idempotency repository.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("failed to decode idempotency record: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Dead letter as read back from storage.
#[derive(Debug, Clone)]
pub struct StoredDeadLetter {
    pub id: String,
    pub letter: DeadLetter,
}

/// Repository for events that exhausted or skipped retries.
#[derive(Clone)]
pub struct DeadLetterRepository {
    pool: SqlitePool,
}

impl DeadLetterRepository {
    /// Persists a dead letter and returns its generated identifier.
    pub async fn insert(&self, letter: &DeadLetter) -> Result<String, DeadLetterError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO dead_letters \
             (id, event_id, event_type, payload, signature, received_at, attempts, kind, last_error, dead_lettered_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&letter.event.id)
        .bind(&letter.event.event_type)
        .bind(&*letter.event.payload)
        .bind(&letter.event.signature)
        .bind(to_rfc3339(letter.event.received_at))
        .bind(i64::from(letter.attempts))
        .bind(letter.kind.as_str())
        .bind(&letter.last_error)
        .bind(to_rfc3339(letter.dead_lettered_at))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Lists the newest dead letters first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<StoredDeadLetter>, DeadLetterError> {
        let rows = sqlx::query(
            "SELECT id, event_id, event_type, payload, signature, received_at, attempts, kind, last_error, dead_lettered_at \
             FROM dead_letters ORDER BY dead_lettered_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[cfg(test)]
    pub async fn count(&self) -> Result<u64, DeadLetterError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<StoredDeadLetter, DeadLetterError> {
    let payload: Vec<u8> = row.get("payload");
    let kind: String = row.get("kind");
    let attempts: i64 = row.get("attempts");
    let received_at =
        parse_rfc3339(&row.get::<String, _>("received_at")).map_err(DeadLetterError::Decode)?;
    let dead_lettered_at = parse_rfc3339(&row.get::<String, _>("dead_lettered_at"))
        .map_err(DeadLetterError::Decode)?;

    let event = InboundEvent {
        id: row.get("event_id"),
        payload: Arc::from(payload),
        received_at,
        signature: row.get("signature"),
        event_type: row.get("event_type"),
    };

    Ok(StoredDeadLetter {
        id: row.get("id"),
        letter: DeadLetter {
            event,
            attempts: u32::try_from(attempts)
                .map_err(|_| DeadLetterError::Decode(format!("attempts out of range: {attempts}")))?,
            kind: DeadLetterKind::from_str(&kind).map_err(DeadLetterError::Decode)?,
            last_error: row.get("last_error"),
            dead_lettered_at,
        },
    })
}

/// Errors raised by the dead-letter repository.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("failed to decode dead letter: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid timestamp {value}: {err}"))
}
