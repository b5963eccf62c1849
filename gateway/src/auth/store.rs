use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Key-value store whose entries disappear on their own after a TTL.
///
/// Backs both the revocation registry and the OAuth state store.
#[async_trait]
pub trait TtlStore: Send + Sync {
    /// Inserts or overwrites `key` so that it lives for `ttl`.
    async fn put(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Whether `key` is present and not yet expired.
    async fn contains(&self, key: &str) -> anyhow::Result<bool>;

    /// Removes `key`, returning whether it was present and not yet expired.
    async fn take(&self, key: &str) -> anyhow::Result<bool>;
}

/// In-process [`TtlStore`].
///
/// Reads share the lock; inserts, removals and sweeps take it exclusively.
#[derive(Default)]
pub struct MemoryTtlStore {
    entries: RwLock<HashMap<String, Instant>>,
}

impl MemoryTtlStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Evicts expired entries and returns how many were removed.
    ///
    /// Expired keys are collected under the read lock; the write lock is then
    /// held only to remove that snapshot.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write();
        let mut removed = 0;
        for key in expired {
            // The key may have been re-inserted since the snapshot.
            if entries.get(&key).is_some_and(|expires_at| *expires_at <= now) {
                entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Starts the periodic eviction task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Sweeper {
        let cancel = CancellationToken::new();
        let store = Arc::downgrade(self);

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tracing::debug!(?interval, "ttl store sweeper started");
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(store) = store.upgrade() else {
                                break;
                            };
                            match store.purge_expired() {
                                0 => {}
                                n => tracing::debug!(evicted = n, "ttl store sweep"),
                            }
                        }
                    }
                }
                tracing::debug!("ttl store sweeper stopped");
            }
        });

        Sweeper {
            cancel,
            handle: Some(handle),
        }
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn put(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .write()
            .insert(key.to_owned(), Instant::now() + ttl);
        Ok(())
    }

    async fn contains(&self, key: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .get(key)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn take(&self, key: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .write()
            .remove(key)
            .is_some_and(|expires_at| expires_at > now))
    }
}

/// Handle to a running sweep task. Dropping it stops the task.
pub struct Sweeper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.ok();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryTtlStore::new();
        store.put("k", Duration::from_secs(10)).await.unwrap();
        assert!(store.contains("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.contains("k").await.unwrap());
        assert!(!store.take("k").await.unwrap());
    }

    #[tokio::test]
    async fn take_is_single_use() {
        let store = MemoryTtlStore::new();
        store.put("k", Duration::from_secs(10)).await.unwrap();
        assert!(store.take("k").await.unwrap());
        assert!(!store.take("k").await.unwrap());
        assert!(!store.contains("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_keeps_live_entries() {
        let store = MemoryTtlStore::new();
        store.put("short", Duration::from_secs(1)).await.unwrap();
        store.put("long", Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.contains("long").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_abandoned_entries() {
        let store = MemoryTtlStore::new();
        let sweeper = store.spawn_sweeper(Duration::from_secs(300));

        store.put("abandoned", Duration::from_secs(600)).await.unwrap();
        assert_eq!(store.len(), 1);

        // First tick at 300s: still alive. Second tick at 600s: expired.
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(store.len(), 1);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(store.len(), 0);

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let store = MemoryTtlStore::new();
        let sweeper = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(1), sweeper.shutdown())
            .await
            .unwrap();
    }
}
