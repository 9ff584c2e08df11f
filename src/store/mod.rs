//! Durable rollup state.
//!
//! [`RollupStore`] is the async trait the engine and publisher use to read and
//! conditionally write per-date rollups and per-partition batch commit records.
//! [`MemoryRollupStore`] keeps everything in process; [`FileRollupStore`]
//! persists JSON documents under a state directory.

mod file;
mod memory;

pub use file::FileRollupStore;
pub use memory::MemoryRollupStore;

use crate::commit::BatchCommitRecord;
use crate::rollup::DailyRollup;
use chrono::NaiveDate;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rollup store unavailable: {0}")]
    Unavailable(String),
    #[error("rollup store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt state at {location}: {reason}")]
    Corrupt { location: String, reason: String },
}

impl StoreError {
    /// Corrupt state will not heal by retrying; everything else might.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Corrupt { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the new stored version.
    Swapped(u64),
    /// The stored version moved since the rollup was loaded.
    Conflict,
}

#[async_trait::async_trait]
pub trait RollupStore: Send + Sync {
    /// Returns the stored rollup for `date`, or an empty one at version 0.
    async fn load(&self, date: NaiveDate) -> Result<DailyRollup, StoreError>;

    /// Stores `rollup` only if the stored version still equals `rollup.version`.
    async fn compare_and_swap(&self, rollup: &DailyRollup) -> Result<CasOutcome, StoreError>;

    /// All dates with a stored rollup, ascending.
    async fn dates(&self) -> Result<Vec<NaiveDate>, StoreError>;

    async fn load_commit(&self, partition: &str) -> Result<Option<BatchCommitRecord>, StoreError>;

    async fn save_commit(&self, record: &BatchCommitRecord) -> Result<(), StoreError>;
}

/// Runs a store call, failing with [`StoreError::Timeout`] once `limit` elapses.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}
