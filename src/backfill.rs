//! Bulk-scan aggregation of a full trip table.
//!
//! Rows go through the same decoder and filter as streamed change records,
//! so scanning a table yields the same per-date totals as replaying its rows
//! as inserts from empty state.

use crate::decoder::{Decoded, RawRecord, decode};
use crate::rollup::FareTotals;
use crate::store::{CasOutcome, RollupStore, StoreError, bounded};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rollup for {date} still conflicting after {attempts} write attempts")]
    Contention { date: NaiveDate, attempts: u32 },
}

/// Per-date totals of one table scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableScan {
    pub totals: BTreeMap<NaiveDate, FareTotals>,
    pub rows: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Aggregates table rows in a single pass.
pub fn scan_table(rows: impl IntoIterator<Item = Map<String, Value>>) -> TableScan {
    let mut scan = TableScan::default();
    for (index, row) in rows.into_iter().enumerate() {
        scan.rows += 1;
        let raw = RawRecord::insert("table-scan", index as u64, Value::Object(row));
        match decode(&raw) {
            Ok(Decoded::Event(event)) => {
                let totals = scan.totals.entry(event.pickup_date).or_default();
                if let Err(e) = totals.add(event.fare_amount) {
                    scan.errors += 1;
                    warn!(row = index, date = %event.pickup_date, error = %e, "Row rejected");
                }
            }
            Ok(Decoded::Skip(reason)) => {
                scan.skipped += 1;
                debug!(row = index, %reason, "Row filtered");
            }
            Err(e) => {
                scan.errors += 1;
                warn!(row = index, error = %e, "Row rejected");
            }
        }
    }
    info!(
        rows = scan.rows,
        dates = scan.totals.len(),
        skipped = scan.skipped,
        errors = scan.errors,
        "Table scanned"
    );
    scan
}

/// Replaces the stored totals of every scanned date with the scan's totals.
///
/// High-water marks are kept, so stream records already reflected in the
/// table stay deduplicated when the stream resumes. Each date gets at most
/// `max_cas_attempts` conditional writes.
pub async fn store_scan(
    store: &dyn RollupStore,
    scan: &TableScan,
    timeout: Duration,
    max_cas_attempts: u32,
) -> Result<Vec<NaiveDate>, BackfillError> {
    let mut written = Vec::with_capacity(scan.totals.len());
    for (date, totals) in &scan.totals {
        let mut swapped = false;
        for attempt in 1..=max_cas_attempts {
            let mut rollup = bounded(timeout, store.load(*date)).await?;
            rollup.totals = totals.clone();
            match bounded(timeout, store.compare_and_swap(&rollup)).await? {
                CasOutcome::Swapped(_) => {
                    swapped = true;
                    break;
                }
                CasOutcome::Conflict => {
                    debug!(%date, attempt, "Backfill write conflicted, reloading");
                    tokio::task::yield_now().await;
                }
            }
        }
        if !swapped {
            return Err(BackfillError::Contention {
                date: *date,
                attempts: max_cas_attempts,
            });
        }
        written.push(*date);
    }
    Ok(written)
}
