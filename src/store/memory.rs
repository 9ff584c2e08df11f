use super::{CasOutcome, RollupStore, StoreError};
use crate::commit::BatchCommitRecord;
use crate::rollup::DailyRollup;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    rollups: BTreeMap<NaiveDate, DailyRollup>,
    commits: HashMap<String, BatchCommitRecord>,
}

/// Process-local store. Shared between workers through an `Arc`.
#[derive(Default)]
pub struct MemoryRollupStore {
    state: Mutex<State>,
}

impl MemoryRollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl RollupStore for MemoryRollupStore {
    async fn load(&self, date: NaiveDate) -> Result<DailyRollup, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rollups
            .get(&date)
            .cloned()
            .unwrap_or_else(|| DailyRollup::empty(date)))
    }

    async fn compare_and_swap(&self, rollup: &DailyRollup) -> Result<CasOutcome, StoreError> {
        let mut state = self.lock()?;
        let stored_version = state.rollups.get(&rollup.date).map_or(0, |r| r.version);
        if stored_version != rollup.version {
            return Ok(CasOutcome::Conflict);
        }
        let mut next = rollup.clone();
        next.version = stored_version + 1;
        state.rollups.insert(rollup.date, next);
        Ok(CasOutcome::Swapped(stored_version + 1))
    }

    async fn dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        Ok(self.lock()?.rollups.keys().copied().collect())
    }

    async fn load_commit(&self, partition: &str) -> Result<Option<BatchCommitRecord>, StoreError> {
        Ok(self.lock()?.commits.get(partition).cloned())
    }

    async fn save_commit(&self, record: &BatchCommitRecord) -> Result<(), StoreError> {
        self.lock()?
            .commits
            .insert(record.partition.clone(), record.clone());
        Ok(())
    }
}
