use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Error as SqlxError;
use thiserror::Error;

use hookrelay_core::types::{CheckOutcome, IdempotencyRecord, Outcome};
use hookrelay_storage::{IdempotencyError, IdempotencyRepository};

const PURGE_BATCH_LIMIT: i64 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("idempotency store is busy: {0}")]
    Busy(String),
    #[error("idempotency store failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<SqlxError> for StoreError {
    fn from(err: SqlxError) -> Self {
        if is_sqlite_busy(&err) {
            Self::Busy(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

impl From<IdempotencyError> for StoreError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::Database(source) => source.into(),
            other => Self::Backend(other.to_string()),
        }
    }
}

pub(crate) fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

/// Remembers which event identifiers have been seen.
///
/// `check_and_record` must be atomic: among concurrent callers presenting the
/// same identifier, exactly one observes [`CheckOutcome::New`].
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn check_and_record(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, StoreError>;

    /// Moves a pending record to a terminal outcome. Returns `false` if the
    /// record is missing or already terminal.
    async fn mark_outcome(
        &self,
        event_id: &str,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Forgets a pending record so the sender's redelivery is accepted again.
    async fn release(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Removes records first seen before `threshold`.
    async fn purge_expired(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>, StoreError>;
}

#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, IdempotencyRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn check_and_record(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, StoreError> {
        let mut records = self.records();
        if records.contains_key(event_id) {
            return Ok(CheckOutcome::Duplicate);
        }
        records.insert(
            event_id.to_string(),
            IdempotencyRecord::pending(event_id, now),
        );
        Ok(CheckOutcome::New)
    }

    async fn mark_outcome(
        &self,
        event_id: &str,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !outcome.is_terminal() {
            return Ok(false);
        }
        let mut records = self.records();
        match records.get_mut(event_id) {
            Some(record) if record.outcome == Outcome::Pending => {
                record.outcome = outcome;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, event_id: &str) -> Result<bool, StoreError> {
        let mut records = self.records();
        if records
            .get(event_id)
            .is_some_and(|record| record.outcome == Outcome::Pending)
        {
            records.remove(event_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn purge_expired(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| record.first_seen_at >= threshold);
        Ok((before - records.len()) as u64)
    }

    async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.records().get(event_id).cloned())
    }
}

/// SQLite-backed store; records survive restarts.
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    repo: IdempotencyRepository,
}

impl SqliteIdempotencyStore {
    pub fn new(repo: IdempotencyRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn check_and_record(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, StoreError> {
        Ok(self.repo.check_and_record(event_id, now).await?)
    }

    async fn mark_outcome(
        &self,
        event_id: &str,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !outcome.is_terminal() {
            return Ok(false);
        }
        Ok(self.repo.mark_outcome(event_id, outcome, now).await?)
    }

    async fn release(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.repo.release(event_id).await?)
    }

    async fn purge_expired(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut total = 0_u64;
        loop {
            let deleted = self
                .repo
                .delete_older_than_batch(threshold, PURGE_BATCH_LIMIT)
                .await?;
            total += deleted;
            if deleted < PURGE_BATCH_LIMIT as u64 {
                break;
            }
            tokio::task::yield_now().await;
        }
        Ok(total)
    }

    async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.repo.fetch(event_id).await?)
    }
}
