use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use hookrelay_core::types::DeadLetter;
use hookrelay_storage::{DeadLetterError, DeadLetterRepository, StoredDeadLetter};

#[derive(Debug, Error)]
#[error("dead-letter sink failure: {0}")]
pub struct DeadLetterSinkError(pub(crate) String);

impl From<DeadLetterError> for DeadLetterSinkError {
    fn from(err: DeadLetterError) -> Self {
        Self(err.to_string())
    }
}

/// Final resting place for events that will not be retried.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<String, DeadLetterSinkError>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<StoredDeadLetter>, DeadLetterSinkError>;
}

#[derive(Clone)]
pub struct SqliteDeadLetterSink {
    repo: DeadLetterRepository,
}

impl SqliteDeadLetterSink {
    pub fn new(repo: DeadLetterRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<String, DeadLetterSinkError> {
        Ok(self.repo.insert(&letter).await?)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredDeadLetter>, DeadLetterSinkError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(self.repo.list_recent(limit).await?)
    }
}

#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<StoredDeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<String, DeadLetterSinkError> {
        let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        let id = format!("mem-{}", letters.len() + 1);
        letters.push(StoredDeadLetter {
            id: id.clone(),
            letter,
        });
        Ok(id)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredDeadLetter>, DeadLetterSinkError> {
        let letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}
