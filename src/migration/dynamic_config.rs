//! Hot-swappable operational configuration.
//!
//! Readers take an immutable `Arc<Settings>` snapshot; `reload` swaps it
//! atomically and fans out to subscribers only when the settings actually
//! changed. Subscribers run on their own spawned tasks so a slow callback
//! can never block a reload or another subscriber.

use super::error::{MigrationError, Result};
use super::models::Settings;
use super::store::Store;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub type ConfigCallback = Arc<dyn Fn(Arc<Settings>) + Send + Sync>;

pub struct DynamicConfig {
    store: Arc<dyn Store>,
    current: RwLock<Arc<Settings>>,
    subscribers: StdMutex<Vec<ConfigCallback>>,
}

impl DynamicConfig {
    /// Read settings from the store and build the initial snapshot.
    pub async fn load(store: Arc<dyn Store>) -> Result<Arc<Self>> {
        let settings = store.get_settings().await?;
        settings
            .validate()
            .map_err(MigrationError::Configuration)?;
        Ok(Arc::new(Self {
            store,
            current: RwLock::new(Arc::new(settings)),
            subscribers: StdMutex::new(Vec::new()),
        }))
    }

    /// A consistent, immutable view. Operations capture one snapshot at the
    /// start and use it throughout, so a concurrent reload never tears an
    /// in-flight transition.
    pub async fn snapshot(&self) -> Arc<Settings> {
        self.current.read().await.clone()
    }

    /// Re-read settings from the store and swap the snapshot. Returns
    /// whether anything changed. A store failure leaves the previous
    /// snapshot intact.
    pub async fn reload(&self) -> Result<bool> {
        let fresh = self.store.get_settings().await?;
        fresh.validate().map_err(MigrationError::Configuration)?;

        {
            let current = self.current.read().await;
            if **current == fresh {
                debug!("Config reload: no changes");
                return Ok(false);
            }
        }

        let fresh = Arc::new(fresh);
        *self.current.write().await = fresh.clone();
        info!(
            workers = fresh.worker_count,
            poll_interval = fresh.poll_interval_seconds,
            "Dynamic configuration reloaded"
        );

        // No lock is held across callbacks; each runs independently.
        let subscribers = self.subscribers.lock().unwrap().clone();
        for callback in subscribers {
            let snapshot = fresh.clone();
            tokio::spawn(async move {
                callback(snapshot);
            });
        }
        Ok(true)
    }

    /// Register a callback invoked after each successful reload that changed
    /// the settings. Callback failures are the subscriber's problem; they
    /// are never retried here.
    pub fn subscribe(&self, callback: ConfigCallback) {
        self.subscribers.lock().unwrap().push(callback);
    }

    /// Persist new settings and reload. The single write path for the
    /// administrative settings operation.
    pub async fn update(&self, settings: &Settings) -> Result<bool> {
        settings
            .validate()
            .map_err(MigrationError::Configuration)?;
        if let Err(e) = self.store.update_settings(settings).await {
            warn!("Failed to persist settings: {e}");
            return Err(e.into());
        }
        self.reload().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::mem_store::MemStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_reload_unchanged_fires_no_callbacks() {
        let store = Arc::new(MemStore::with_settings(Settings::default()));
        let config = DynamicConfig::load(store).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        config.subscribe(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..3 {
            assert!(!config.reload().await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reload_change_fires_once_per_subscriber() {
        let store = Arc::new(MemStore::with_settings(Settings::default()));
        let config = DynamicConfig::load(store.clone()).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let c = calls.clone();
            config.subscribe(Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let mut settings = Settings::default();
        settings.worker_count = 9;
        store.update_settings(&settings).await.unwrap();

        assert!(config.reload().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(config.snapshot().await.worker_count, 9);

        // Reloading again without changes stays quiet.
        assert!(!config.reload().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_settings_keep_previous_snapshot() {
        let store = Arc::new(MemStore::with_settings(Settings::default()));
        let config = DynamicConfig::load(store.clone()).await.unwrap();

        let mut bad = Settings::default();
        bad.worker_count = 0;
        store.update_settings(&bad).await.unwrap();

        assert!(config.reload().await.is_err());
        assert_eq!(config.snapshot().await.worker_count, Settings::default().worker_count);
    }
}
