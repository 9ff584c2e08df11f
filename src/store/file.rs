use super::{CasOutcome, RollupStore, StoreError};
use crate::commit::BatchCommitRecord;
use crate::rollup::DailyRollup;
use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Stores rollups and commit records as JSON documents:
///
/// ```text
/// <root>/rollups/date=2024-01-15.json
/// <root>/commits/partition=shard-0001.json
/// ```
///
/// Writes go to a temp file and are renamed into place. Conditional writes are
/// serialized by an in-process lock, so a state directory must be owned by a
/// single process.
pub struct FileRollupStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRollupStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("rollups")).await?;
        tokio::fs::create_dir_all(root.join("commits")).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn rollup_path(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("rollups")
            .join(format!("date={}.json", date.format("%Y-%m-%d")))
    }

    fn commit_path(&self, partition: &str) -> PathBuf {
        self.root
            .join("commits")
            .join(format!("partition={}.json", encode_partition(partition)))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                location: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
            location: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "State document written");
        Ok(())
    }
}

/// Percent-encodes every byte outside `[A-Za-z0-9.-]`, so distinct partition
/// names always map to distinct file names.
fn encode_partition(partition: &str) -> String {
    let mut encoded = String::with_capacity(partition.len());
    for byte in partition.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

#[async_trait::async_trait]
impl RollupStore for FileRollupStore {
    async fn load(&self, date: NaiveDate) -> Result<DailyRollup, StoreError> {
        let path = self.rollup_path(date);
        let rollup: Option<DailyRollup> = Self::read_json(&path).await?;
        match rollup {
            Some(rollup) if rollup.date != date => Err(StoreError::Corrupt {
                location: path.display().to_string(),
                reason: format!("document holds date {}", rollup.date),
            }),
            Some(rollup) => Ok(rollup),
            None => Ok(DailyRollup::empty(date)),
        }
    }

    async fn compare_and_swap(&self, rollup: &DailyRollup) -> Result<CasOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored = self.load(rollup.date).await?;
        if stored.version != rollup.version {
            return Ok(CasOutcome::Conflict);
        }
        let mut next = rollup.clone();
        next.version = stored.version + 1;
        Self::write_json(&self.rollup_path(rollup.date), &next).await?;
        Ok(CasOutcome::Swapped(next.version))
    }

    async fn dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let mut entries = tokio::fs::read_dir(self.root.join("rollups")).await?;
        let mut dates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name
                .to_str()
                .and_then(|n| n.strip_prefix("date="))
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }

    async fn load_commit(&self, partition: &str) -> Result<Option<BatchCommitRecord>, StoreError> {
        Self::read_json(&self.commit_path(partition)).await
    }

    async fn save_commit(&self, record: &BatchCommitRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        Self::write_json(&self.commit_path(&record.partition), record).await
    }
}
