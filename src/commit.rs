//! Per-partition record of batch progress.

use crate::decoder::SequenceNumber;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle of a batch. Only `Applying`, `Committed` and `Failed` are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchPhase {
    Received,
    Decoding,
    Applying,
    Committed,
    Failed,
}

/// What the driver knows about the latest batch of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCommitRecord {
    pub partition: String,
    pub first_sequence: SequenceNumber,
    pub last_sequence: SequenceNumber,
    pub phase: BatchPhase,
    /// Highest sequence whose batch was fully folded.
    pub committed_through: Option<SequenceNumber>,
    /// Dates whose snapshots have not been published since their rollup changed.
    #[serde(default)]
    pub pending_publish: BTreeSet<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl BatchCommitRecord {
    pub fn new(partition: &str, first: SequenceNumber, last: SequenceNumber) -> Self {
        Self {
            partition: partition.to_string(),
            first_sequence: first,
            last_sequence: last,
            phase: BatchPhase::Received,
            committed_through: None,
            pending_publish: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// True when every record up to `last` has already been folded.
    pub fn covers(&self, last: &SequenceNumber) -> bool {
        self.committed_through
            .as_ref()
            .is_some_and(|through| last <= through)
    }

    /// Starts tracking a new batch, carrying over commit progress and pending dates.
    pub fn begin(&mut self, first: SequenceNumber, last: SequenceNumber) {
        self.first_sequence = first;
        self.last_sequence = last;
        self.phase = BatchPhase::Applying;
        self.updated_at = Utc::now();
    }

    pub fn commit(&mut self, touched: impl IntoIterator<Item = NaiveDate>) {
        self.phase = BatchPhase::Committed;
        self.committed_through = Some(self.last_sequence.clone());
        self.pending_publish.extend(touched);
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self) {
        self.phase = BatchPhase::Failed;
        self.updated_at = Utc::now();
    }

    pub fn published(&mut self, date: NaiveDate) {
        self.pending_publish.remove(&date);
        self.updated_at = Utc::now();
    }
}
