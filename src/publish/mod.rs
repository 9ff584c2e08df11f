//! Snapshot publication.
//!
//! A snapshot is the canonical JSON rendering of one date's rollup, written
//! to `kpis/date=<YYYY-MM-DD>/kpi.json` under an optional prefix. Publishing
//! overwrites the previous snapshot, and the same rollup always renders to the
//! same bytes.

mod s3;
mod sink;

pub use s3::S3Sink;
pub use sink::{LocalDirSink, MemorySink, SnapshotSink};

use crate::rollup::{DailyRollup, FareTotals};
use crate::store::{RollupStore, StoreError, bounded};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Published KPI document. Field order is the serialized order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSnapshot {
    pub date: NaiveDate,
    pub trip_count: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_fare: Decimal,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub average_fare: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub max_fare: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub min_fare: Option<Decimal>,
}

impl KpiSnapshot {
    pub fn from_totals(date: NaiveDate, totals: &FareTotals) -> Self {
        Self {
            date,
            trip_count: totals.trip_count,
            total_fare: totals.total_fare,
            average_fare: totals.average_fare(),
            max_fare: totals.max_fare,
            min_fare: totals.min_fare,
        }
    }

    pub fn from_rollup(rollup: &DailyRollup) -> Self {
        Self::from_totals(rollup.date, &rollup.totals)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Object key of the snapshot for `date`.
pub fn snapshot_key(prefix: &str, date: NaiveDate) -> String {
    let prefix = match prefix.trim_matches('/') {
        "" => String::new(),
        p => format!("{p}/"),
    };
    format!("{prefix}kpis/date={}/kpi.json", date.format("%Y-%m-%d"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedLocation {
    pub date: NaiveDate,
    pub location: String,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("snapshot sink write failed: {0}")]
    Sink(String),
    #[error("snapshot sink write timed out after {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Store(e) => e.is_transient(),
            PublishError::Encode(_) => false,
            PublishError::Sink(_) | PublishError::Timeout(_) => true,
        }
    }
}

/// Reads rollups and writes their snapshots.
///
/// Load and write of one date happen under a per-date lock, so a snapshot
/// rendered from an older rollup can never land after a newer one.
pub struct SnapshotPublisher {
    store: Arc<dyn RollupStore>,
    sink: Arc<dyn SnapshotSink>,
    prefix: String,
    timeout: Duration,
    date_locks: Mutex<HashMap<NaiveDate, Arc<tokio::sync::Mutex<()>>>>,
}

impl SnapshotPublisher {
    pub fn new(
        store: Arc<dyn RollupStore>,
        sink: Arc<dyn SnapshotSink>,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            prefix: prefix.into(),
            timeout,
            date_locks: Mutex::new(HashMap::new()),
        }
    }

    fn date_lock(&self, date: NaiveDate) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .date_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(date).or_default().clone()
    }

    /// Drops the lock of `date` unless another publish still holds or awaits it.
    fn release_date_lock(&self, date: NaiveDate, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .date_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        if locks.get(&date).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&date);
        }
    }

    #[cfg(test)]
    fn locked_dates(&self) -> usize {
        self.date_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Renders the stored rollup for `date` and overwrites its snapshot.
    #[tracing::instrument(skip_all, fields(date = %date))]
    pub async fn publish(&self, date: NaiveDate) -> Result<PublishedLocation, PublishError> {
        let lock = self.date_lock(date);
        let result = {
            let _guard = lock.lock().await;
            match bounded(self.timeout, self.store.load(date)).await {
                Ok(rollup) => self.write(&KpiSnapshot::from_rollup(&rollup)).await,
                Err(e) => Err(e.into()),
            }
        };
        self.release_date_lock(date, lock);
        result
    }

    /// Writes an already rendered snapshot.
    pub async fn write(&self, snapshot: &KpiSnapshot) -> Result<PublishedLocation, PublishError> {
        let body = snapshot.to_json()?;
        let key = snapshot_key(&self.prefix, snapshot.date);

        let location = tokio::time::timeout(self.timeout, self.sink.put(&key, body.into()))
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))?
            .map_err(|e| PublishError::Sink(format!("{e:#}")))?;

        info!(
            date = %snapshot.date,
            trip_count = snapshot.trip_count,
            location = %location,
            "Snapshot published"
        );
        Ok(PublishedLocation {
            date: snapshot.date,
            location,
        })
    }
}
