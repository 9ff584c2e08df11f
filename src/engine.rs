//! Aggregation engine: folds decoded batches into per-date rollups.

use crate::commit::BatchPhase;
use crate::decoder::{Decoded, RawRecord, TripEvent, decode};
use crate::rollup::Applied;
use crate::store::{CasOutcome, RollupStore, StoreError, bounded};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on every individual store call.
    pub store_timeout: Duration,
    /// Conditional write attempts per date before giving up on a batch.
    pub max_cas_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            max_cas_attempts: 32,
        }
    }
}

/// Counters and touched dates for one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Dates whose rollup changed; their snapshots must be republished.
    pub touched_dates: BTreeSet<NaiveDate>,
    /// Every date a valid event of the batch maps to, changed or not.
    pub event_dates: BTreeSet<NaiveDate>,
    pub applied: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rollup for {date} still conflicting after {attempts} write attempts")]
    Contention { date: NaiveDate, attempts: u32 },
    #[error("batch deadline passed with {remaining} date(s) left to apply")]
    DeadlineExceeded { remaining: usize },
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::Contention { .. } | EngineError::DeadlineExceeded { .. } => true,
        }
    }
}

pub struct AggregationEngine {
    store: Arc<dyn RollupStore>,
    config: EngineConfig,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn RollupStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn RollupStore> {
        &self.store
    }

    /// Decodes `records` and folds every completed trip into its date's rollup.
    ///
    /// Records already covered by a partition's high-water mark are counted as
    /// duplicates and leave the rollup untouched, so a redelivered batch only
    /// applies what the previous attempt did not. Bad records are counted in
    /// `errors` and never fail the batch; store faults always do.
    #[tracing::instrument(skip_all, fields(records = records.len()))]
    pub async fn process_batch(
        &self,
        records: &[RawRecord],
        deadline: Option<Instant>,
    ) -> Result<BatchOutcome, EngineError> {
        let mut outcome = BatchOutcome::default();

        debug!(phase = ?BatchPhase::Decoding, "Decoding batch");
        let mut by_date: BTreeMap<NaiveDate, Vec<TripEvent>> = BTreeMap::new();
        for raw in records {
            match decode(raw) {
                Ok(Decoded::Event(event)) => {
                    by_date.entry(event.pickup_date).or_default().push(event)
                }
                Ok(Decoded::Skip(reason)) => {
                    outcome.skipped += 1;
                    debug!(
                        partition = %raw.partition,
                        sequence = %raw.sequence_number,
                        %reason,
                        "Record filtered"
                    );
                }
                Err(e) => {
                    outcome.errors += 1;
                    warn!(
                        partition = %raw.partition,
                        sequence = %raw.sequence_number,
                        error = %e,
                        "Record rejected"
                    );
                }
            }
        }

        debug!(phase = ?BatchPhase::Applying, dates = by_date.len(), "Applying batch");
        outcome.event_dates = by_date.keys().copied().collect();
        let total = by_date.len();
        for (done, (date, events)) in by_date.into_iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(EngineError::DeadlineExceeded {
                    remaining: total - done,
                });
            }
            let (folded, duplicates, overflowed) = self.apply_date(date, &events).await?;
            outcome.applied += folded;
            outcome.duplicates += duplicates;
            outcome.errors += overflowed;
            if folded > 0 {
                outcome.touched_dates.insert(date);
            }
        }

        info!(
            applied = outcome.applied,
            duplicates = outcome.duplicates,
            skipped = outcome.skipped,
            errors = outcome.errors,
            touched = outcome.touched_dates.len(),
            "Batch applied"
        );
        Ok(outcome)
    }

    /// Read-modify-write of one date's rollup, retried on version conflicts.
    async fn apply_date(
        &self,
        date: NaiveDate,
        events: &[TripEvent],
    ) -> Result<(usize, usize, usize), EngineError> {
        let limit = self.config.store_timeout;
        for attempt in 1..=self.config.max_cas_attempts {
            let mut rollup = bounded(limit, self.store.load(date)).await?;

            let (mut folded, mut duplicates, mut overflowed) = (0, 0, 0);
            for event in events {
                match rollup.apply(event) {
                    Applied::Folded => folded += 1,
                    Applied::Duplicate => duplicates += 1,
                    Applied::Overflow => {
                        overflowed += 1;
                        warn!(
                            %date,
                            partition = %event.partition,
                            sequence = %event.sequence,
                            fare = %event.fare_amount,
                            "Fare would overflow the daily total, record rejected"
                        );
                    }
                }
            }
            if folded == 0 {
                return Ok((0, duplicates, overflowed));
            }

            match bounded(limit, self.store.compare_and_swap(&rollup)).await? {
                CasOutcome::Swapped(version) => {
                    debug!(%date, version, folded, duplicates, "Rollup updated");
                    return Ok((folded, duplicates, overflowed));
                }
                CasOutcome::Conflict => {
                    debug!(%date, attempt, "Rollup write conflicted, reloading");
                    tokio::task::yield_now().await;
                }
            }
        }
        Err(EngineError::Contention {
            date,
            attempts: self.config.max_cas_attempts,
        })
    }
}
