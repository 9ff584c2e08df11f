use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Object store accepting whole-object overwrites.
#[async_trait::async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Writes `body` at `key`, replacing any existing object, and returns
    /// where it landed.
    async fn put(&self, key: &str, body: Bytes) -> Result<String>;
}

/// Writes snapshots below a local directory, mirroring the object key layout.
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl SnapshotSink for LocalDirSink {
    async fn put(&self, key: &str, body: Bytes) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(path.display().to_string())
    }
}

/// In-process sink that keeps the latest body per key. Can be told to fail
/// a number of upcoming writes.
#[derive(Default)]
pub struct MemorySink {
    objects: Mutex<BTreeMap<String, Bytes>>,
    puts: AtomicUsize,
    failures: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Successful writes so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SnapshotSink for MemorySink {
    async fn put(&self, key: &str, body: Bytes) -> Result<String> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("memory sink refused write to {key}");
        }
        self.objects
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink lock poisoned"))?
            .insert(key.to_string(), body);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(key.to_string())
    }
}
