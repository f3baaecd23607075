//! Per-user location feed
//!
//! One task per feed pulls samples from a [`GeolocationSource`], passes
//! them through the shared [`LocationThrottle`] and writes accepted samples
//! to the user's profile. Because a single task awaits each write before
//! taking the next sample, writes for one feed never overlap.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::source::GeolocationSource;
use super::throttle::LocationThrottle;
use crate::store::{DocPath, DocumentStore, USERS};

/// Counters for one feed
#[derive(Debug, Default)]
pub struct FeedStats {
    pub samples: AtomicU64,
    pub written: AtomicU64,
    pub dropped: AtomicU64,
    pub failed_writes: AtomicU64,
    pub errors: AtomicU64,
}

impl FeedStats {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::SeqCst)
    }
}

/// Feeds currently running, by user id
pub(crate) type FeedRegistry = Arc<DashMap<String, (u64, AbortHandle)>>;

/// Scoped handle for a running feed.
///
/// The feed writes only while this handle is alive; dropping it cancels the
/// watch even if `stop` is never called.
pub struct LocationFeed {
    user_id: String,
    feed_id: u64,
    task: JoinHandle<()>,
    stats: Arc<FeedStats>,
    registry: Option<FeedRegistry>,
}

static NEXT_FEED_ID: AtomicU64 = AtomicU64::new(1);

impl LocationFeed {
    /// Start watching `source` and publishing for `user_id`
    pub fn start<S: GeolocationSource>(
        store: Arc<dyn DocumentStore>,
        user_id: impl Into<String>,
        source: S,
        throttle: Arc<LocationThrottle>,
    ) -> Self {
        let user_id = user_id.into();
        let stats = Arc::new(FeedStats::default());
        let window = throttle.window();
        let task = tokio::spawn(run_feed(
            store,
            user_id.clone(),
            source,
            throttle,
            Arc::clone(&stats),
        ));

        info!(user_id = %user_id, window_secs = window.as_secs_f64(), "Location feed started");

        Self {
            user_id,
            feed_id: NEXT_FEED_ID.fetch_add(1, Ordering::Relaxed),
            task,
            stats,
            registry: None,
        }
    }

    /// Register as the user's only feed, cancelling any previous one
    pub(crate) fn register(mut self, registry: &FeedRegistry) -> Self {
        let previous = registry.insert(
            self.user_id.clone(),
            (self.feed_id, self.task.abort_handle()),
        );
        if let Some((_, handle)) = previous {
            handle.abort();
            info!(user_id = %self.user_id, "Replaced previous location feed");
        }
        self.registry = Some(Arc::clone(registry));
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }

    /// Whether the feed task has ended (source closed or cancelled)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the watch and wait for the task to be gone
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        info!(
            user_id = %self.user_id,
            written = self.stats.written(),
            dropped = self.stats.dropped(),
            "Location feed stopped"
        );
    }
}

impl Drop for LocationFeed {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(registry) = &self.registry {
            let feed_id = self.feed_id;
            registry.remove_if(&self.user_id, |_, (id, _)| *id == feed_id);
        }
    }
}

async fn run_feed<S: GeolocationSource>(
    store: Arc<dyn DocumentStore>,
    user_id: String,
    mut source: S,
    throttle: Arc<LocationThrottle>,
    stats: Arc<FeedStats>,
) {
    let path = DocPath::new(USERS, &user_id);

    while let Some(item) = source.next().await {
        let sample = match item.and_then(|s| s.validate().map(|_| s)) {
            Ok(sample) => sample,
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::SeqCst);
                warn!(user_id = %user_id, error = %e, "Geolocation error, still watching");
                continue;
            }
        };
        stats.samples.fetch_add(1, Ordering::SeqCst);

        let now = Instant::now();
        if !throttle.offer(&user_id, now) {
            stats.dropped.fetch_add(1, Ordering::SeqCst);
            debug!(
                user_id = %user_id,
                next_in_ms = throttle.remaining(&user_id, now).as_millis() as u64,
                "Position sample throttled"
            );
            continue;
        }

        // A failed write still consumes the window
        match store.write(&path, sample.to_patch()).await {
            Ok(commit) => {
                stats.written.fetch_add(1, Ordering::SeqCst);
                debug!(user_id = %user_id, seq = commit.seq, "Location published");
            }
            Err(e) => {
                stats.failed_writes.fetch_add(1, Ordering::SeqCst);
                warn!(user_id = %user_id, error = %e, "Location write dropped for this window");
            }
        }
    }

    info!(user_id = %user_id, "Geolocation source ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::source::{ChannelSource, GeoError, PositionSample};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn throttle(secs: u64) -> Arc<LocationThrottle> {
        Arc::new(LocationThrottle::new(Duration::from_secs(secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_thirty_seconds_of_samples_writes_three_times() {
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(64);
        let feed = LocationFeed::start(store.clone(), "r-1", source, throttle(10));

        for i in 0..30 {
            let sample = PositionSample::new(10.0 + i as f64 * 0.001, 20.0, 5.0);
            tx.send(Ok(sample)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert_eq!(feed.stats().written(), 3);
        assert_eq!(feed.stats().dropped(), 27);

        // The last accepted sample is the one that arrived at t=20s
        let doc = store
            .read(&DocPath::new(USERS, "r-1"))
            .await
            .unwrap()
            .document
            .unwrap();
        assert_eq!(doc.data["location"]["latitude"], 10.0 + 20.0 * 0.001);
        feed.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_end_the_watch() {
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(8);
        let feed = LocationFeed::start(store.clone(), "r-2", source, throttle(10));

        tx.send(Err(GeoError::PermissionDenied)).await.unwrap();
        tx.send(Err(GeoError::Unavailable)).await.unwrap();
        tx.send(Ok(PositionSample::new(1.0, 1.0, 3.0))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(feed.stats().errors(), 2);
        assert_eq!(feed.stats().written(), 1);
        assert!(!feed.is_finished());
        feed.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_drops_window_then_resumes() {
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(8);
        let feed = LocationFeed::start(store.clone(), "r-3", source, throttle(10));

        store.set_online(false);
        tx.send(Ok(PositionSample::new(1.0, 1.0, 3.0))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        store.set_online(true);
        // Still inside the consumed window
        tx.send(Ok(PositionSample::new(2.0, 2.0, 3.0))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        tx.send(Ok(PositionSample::new(3.0, 3.0, 3.0))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(feed.stats().failed_writes(), 1);
        assert_eq!(feed.stats().written(), 1);
        let doc = store.read(&DocPath::new(USERS, "r-3")).await.unwrap().document.unwrap();
        assert_eq!(doc.data["location"]["latitude"], 3.0);
        feed.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_writes() {
        let store = Arc::new(MemoryStore::new());
        let (tx, source) = ChannelSource::new(8);
        let feed = LocationFeed::start(store.clone(), "r-4", source, throttle(1));
        drop(feed);
        tokio::task::yield_now().await;

        // Channel is closed once the task is gone
        let _ = tx.send(Ok(PositionSample::new(1.0, 1.0, 1.0))).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.read(&DocPath::new(USERS, "r-4")).await.unwrap().document.is_none());
    }
}
