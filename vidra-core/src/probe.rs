//! Technical-metadata extraction.
//!
//! Probing runs as one task per location, gated by two concurrency classes:
//! a fast class for cache lookups and a slow class for full media probes.
//! Tasks try the fast path first and fall back to the slow path only when
//! the cache misses. Every task is cooperatively cancellable between and
//! during both phases.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use vidra_model::MediaDetails;

use crate::config::ProbeConfig;
use crate::error::Result;

/// Extracts technical metadata from media at a location.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Cheap lookup against previously extracted metadata. `Ok(None)` is a
    /// cache miss, not a failure.
    async fn probe_cached(&self, location: &Url) -> Result<Option<MediaDetails>>;

    /// Full probe of the media itself.
    async fn probe(&self, location: &Url) -> Result<MediaDetails>;
}

/// Completed probe for one location.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub location: Url,
    pub details: MediaDetails,
}

/// Schedules and gates probing work, one cancellable task per location.
pub struct ProbeTaskManager {
    prober: Arc<dyn MediaProber>,
    fast: Arc<Semaphore>,
    slow: Arc<Semaphore>,
    results_tx: mpsc::Sender<ProbeResult>,
    /// Tokens of in-flight probes. Entries are removed on cancel and by the
    /// task itself on completion; the `Arc` identity tells a spent token
    /// apart from a replacement's.
    tasks: Arc<StdMutex<HashMap<Url, Arc<CancellationToken>>>>,
}

impl fmt::Debug for ProbeTaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeTaskManager")
            .field("fast_permits", &self.fast.available_permits())
            .field("slow_permits", &self.slow.available_permits())
            .finish()
    }
}

impl ProbeTaskManager {
    /// Returns the manager and the receiver its completed probes arrive on.
    pub fn new(
        config: &ProbeConfig,
        prober: Arc<dyn MediaProber>,
    ) -> (Self, mpsc::Receiver<ProbeResult>) {
        let (results_tx, results_rx) = mpsc::channel(32);
        let manager = Self {
            prober,
            fast: Arc::new(Semaphore::new(config.fast_limit)),
            slow: Arc::new(Semaphore::new(config.slow_limit)),
            results_tx,
            tasks: Arc::new(StdMutex::new(HashMap::new())),
        };
        (manager, results_rx)
    }

    /// Queue a probe for a location, cancelling any in-flight probe for the
    /// same location first.
    pub fn submit(&self, location: &Url) {
        let token = Arc::new(CancellationToken::new());
        {
            let mut tasks = self.tasks.lock().expect("probe task map poisoned");
            if let Some(previous) = tasks.insert(location.clone(), Arc::clone(&token)) {
                debug!(location = %location, "replacing in-flight probe");
                previous.cancel();
            }
        }

        let prober = Arc::clone(&self.prober);
        let fast = Arc::clone(&self.fast);
        let slow = Arc::clone(&self.slow);
        let tasks = Arc::clone(&self.tasks);
        let tx = self.results_tx.clone();
        let location = location.clone();
        tokio::spawn(async move {
            let details = probe_one(&*prober, &fast, &slow, &location, &token).await;
            {
                // Retire our own registration; a replacement's token stays.
                let mut tasks = tasks.lock().expect("probe task map poisoned");
                if tasks
                    .get(&location)
                    .is_some_and(|current| Arc::ptr_eq(current, &token))
                {
                    tasks.remove(&location);
                }
            }
            if let Some(details) = details {
                let result = ProbeResult {
                    location: location.clone(),
                    details,
                };
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tx.send(result) => {}
                }
            }
        });
    }

    /// Number of probes currently registered as in flight.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().expect("probe task map poisoned").len()
    }

    /// Cancel the in-flight probe for a location, if any.
    pub fn cancel(&self, location: &Url) {
        let mut tasks = self.tasks.lock().expect("probe task map poisoned");
        if let Some(token) = tasks.remove(location) {
            token.cancel();
        }
    }

    /// Cancel every in-flight probe.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().expect("probe task map poisoned");
        for token in tasks.values() {
            token.cancel();
        }
        tasks.clear();
    }
}

/// Fast class first; slow class only on a cache miss. Both phases respect
/// the cancellation token.
async fn probe_one(
    prober: &dyn MediaProber,
    fast: &Semaphore,
    slow: &Semaphore,
    location: &Url,
    token: &CancellationToken,
) -> Option<MediaDetails> {
    let cached = {
        let _permit = tokio::select! {
            _ = token.cancelled() => return None,
            permit = fast.acquire() => permit.ok()?,
        };
        tokio::select! {
            _ = token.cancelled() => return None,
            result = prober.probe_cached(location) => result,
        }
    };
    match cached {
        Ok(Some(details)) => return Some(details),
        Ok(None) => {}
        Err(e) => {
            warn!(location = %location, "cached probe lookup failed: {e}");
        }
    }

    let probed = {
        let _permit = tokio::select! {
            _ = token.cancelled() => return None,
            permit = slow.acquire() => permit.ok()?,
        };
        if token.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = token.cancelled() => return None,
            result = prober.probe(location) => result,
        }
    };
    match probed {
        Ok(details) => Some(details),
        Err(e) => {
            warn!(location = %location, "media probe failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn details(secs: u64) -> MediaDetails {
        MediaDetails {
            duration: Some(Duration::from_secs(secs)),
            structure: None,
            snapshots: Vec::new(),
        }
    }

    /// Prober with a scripted cache and counters for each phase.
    struct CountingProber {
        cached: Option<MediaDetails>,
        fast_calls: AtomicUsize,
        slow_calls: AtomicUsize,
        slow_in_flight: AtomicUsize,
        slow_max_in_flight: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl CountingProber {
        fn with_cache(cached: Option<MediaDetails>) -> Self {
            Self {
                cached,
                fast_calls: AtomicUsize::new(0),
                slow_calls: AtomicUsize::new(0),
                slow_in_flight: AtomicUsize::new(0),
                slow_max_in_flight: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::with_cache(None)
            }
        }
    }

    #[async_trait]
    impl MediaProber for CountingProber {
        async fn probe_cached(&self, _location: &Url) -> Result<Option<MediaDetails>> {
            self.fast_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.cached.clone())
        }

        async fn probe(&self, _location: &Url) -> Result<MediaDetails> {
            self.slow_calls.fetch_add(1, Ordering::SeqCst);
            let current = self.slow_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.slow_max_in_flight.fetch_max(current, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.slow_in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(details(42))
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_the_slow_class() {
        let prober = Arc::new(CountingProber::with_cache(Some(details(7))));
        let (manager, mut rx) = ProbeTaskManager::new(&ProbeConfig::default(), prober.clone());

        manager.submit(&url("file:///m/Avatar.txt"));
        let result = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("probe timed out")
            .expect("channel closed");
        assert_eq!(result.details, details(7));
        assert_eq!(prober.fast_calls.load(Ordering::SeqCst), 1);
        assert_eq!(prober.slow_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_miss_falls_back_to_the_slow_class() {
        let prober = Arc::new(CountingProber::with_cache(None));
        let (manager, mut rx) = ProbeTaskManager::new(&ProbeConfig::default(), prober.clone());

        manager.submit(&url("file:///m/Avatar.txt"));
        let result = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("probe timed out")
            .expect("channel closed");
        assert_eq!(result.details, details(42));
        assert_eq!(prober.fast_calls.load(Ordering::SeqCst), 1);
        assert_eq!(prober.slow_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_class_runs_at_most_one_probe_at_a_time() {
        let gate = Arc::new(Notify::new());
        let prober = Arc::new(CountingProber::gated(gate.clone()));
        let (manager, mut rx) = ProbeTaskManager::new(&ProbeConfig::default(), prober.clone());

        manager.submit(&url("file:///m/Avatar.txt"));
        manager.submit(&url("file:///m/Matrix.txt"));
        manager.submit(&url("file:///m/Terminator.txt"));

        for _ in 0..3 {
            // Release whichever probe currently holds the slow permit.
            tokio::time::sleep(Duration::from_millis(50)).await;
            gate.notify_one();
            timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("probe timed out")
                .expect("channel closed");
        }
        assert_eq!(prober.slow_max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(prober.slow_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn completed_probe_retires_its_task_entry() {
        let prober = Arc::new(CountingProber::with_cache(Some(details(7))));
        let (manager, mut rx) = ProbeTaskManager::new(&ProbeConfig::default(), prober);

        manager.submit(&url("file:///m/Avatar.txt"));
        assert_eq!(manager.in_flight(), 1);
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("probe timed out")
            .expect("channel closed");
        // The entry is removed before the result is delivered.
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_probe_delivers_no_result() {
        let gate = Arc::new(Notify::new());
        let prober = Arc::new(CountingProber::gated(gate.clone()));
        let (manager, mut rx) = ProbeTaskManager::new(&ProbeConfig::default(), prober.clone());

        let location = url("file:///m/Avatar.txt");
        manager.submit(&location);
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.cancel(&location);
        gate.notify_one();

        let raced = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(raced.is_err(), "cancelled probe must not deliver a result");
    }
}
