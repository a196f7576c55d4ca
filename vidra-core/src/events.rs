//! Append-only, replayable event propagation.
//!
//! [`EventLog`] is the in-process backbone the pipeline stages communicate
//! through: ordered append, full backlog replay to late subscribers, and a
//! `join` barrier that waits until every subscriber has caught up with what
//! was appended so far. Durability is delegated to an external
//! [`EventStore`] when one is attached.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;

use crate::error::Result;

/// Durable append-only sequence of events, provided by the embedding
/// application (database, flat file, ...). The pipeline only needs append
/// and full replay.
#[async_trait]
pub trait EventStore<T>: Send + Sync {
    async fn append(&self, event: &T) -> Result<()>;
    async fn replay(&self) -> Result<Vec<T>>;
}

struct SubscriberState<T> {
    name: String,
    tx: mpsc::UnboundedSender<T>,
    /// Events handed to this subscriber's channel so far.
    sent: u64,
    /// Events the subscriber's handler has finished processing.
    processed: watch::Receiver<u64>,
}

struct LogInner<T> {
    events: Vec<T>,
    subscribers: Vec<SubscriberState<T>>,
}

/// In-process append-only event log with named subscribers.
///
/// Every subscriber gets the full backlog first, then live events, in append
/// order, on its own task. Appends while a subscriber is still replaying
/// queue up behind the backlog, so per-subscriber ordering always matches
/// append order.
pub struct EventLog<T> {
    name: &'static str,
    store: Option<Arc<dyn EventStore<T>>>,
    inner: Mutex<LogInner<T>>,
}

impl<T> fmt::Debug for EventLog<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog").field("name", &self.name).finish()
    }
}

impl<T: Clone + Send + 'static> EventLog<T> {
    /// Purely in-memory log.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            store: None,
            inner: Mutex::new(LogInner {
                events: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Log backed by a durable store; the store's backlog is replayed into
    /// memory so later subscribers observe the full history.
    pub async fn with_store(
        name: &'static str,
        store: Arc<dyn EventStore<T>>,
    ) -> Result<Self> {
        let events = store.replay().await?;
        debug!(log = name, backlog = events.len(), "hydrated event log");
        Ok(Self {
            name,
            store: Some(store),
            inner: Mutex::new(LogInner {
                events,
                subscribers: Vec::new(),
            }),
        })
    }

    /// Append an event, persisting it first when a store is attached, then
    /// fan it out to every subscriber in order.
    pub async fn append(&self, event: T) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(store) = &self.store {
            store.append(&event).await?;
        }
        inner.events.push(event.clone());
        // Prune subscribers whose task has gone away.
        inner.subscribers.retain_mut(|sub| {
            if sub.tx.send(event.clone()).is_ok() {
                sub.sent += 1;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Register a named subscriber. The backlog is delivered before any
    /// event appended after this call.
    pub async fn subscribe<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let name = name.into();
        let mut inner = self.inner.lock().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sent = 0u64;
        for event in &inner.events {
            // Unbounded send to a receiver we still hold cannot fail.
            let _ = tx.send(event.clone());
            sent += 1;
        }
        let (processed_tx, processed_rx) = watch::channel(0u64);
        debug!(log = self.name, subscriber = %name, backlog = sent, "subscribed");
        tokio::spawn(async move {
            let mut count = 0u64;
            while let Some(event) = rx.recv().await {
                handler(event).await;
                count += 1;
                if processed_tx.send(count).is_err() {
                    break;
                }
            }
        });
        inner.subscribers.push(SubscriberState {
            name,
            tx,
            sent,
            processed: processed_rx,
        });
    }

    /// Wait until every subscriber has processed everything appended before
    /// this call. Events appended while joining are not waited for.
    pub async fn join(&self) {
        let targets: Vec<(String, u64, watch::Receiver<u64>)> = {
            let inner = self.inner.lock().await;
            inner
                .subscribers
                .iter()
                .map(|sub| (sub.name.clone(), sub.sent, sub.processed.clone()))
                .collect()
        };
        for (name, sent, mut processed) in targets {
            if processed.wait_for(|done| *done >= sent).await.is_err() {
                debug!(log = self.name, subscriber = %name, "subscriber gone during join");
            }
        }
    }

    /// Snapshot of all events appended so far, in order.
    pub async fn snapshot(&self) -> Vec<T> {
        self.inner.lock().await.events.clone()
    }

    /// Number of events appended so far.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// True when nothing has been appended yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn backlog_replays_before_live_events() {
        let log = Arc::new(EventLog::new("test"));
        log.append(1u32).await.unwrap();
        log.append(2u32).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        log.subscribe("replayer", move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(event);
            }
        })
        .await;
        log.append(3u32).await.unwrap();
        log.join().await;

        assert_eq!(*seen.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn join_waits_for_all_subscribers() {
        let log = Arc::new(EventLog::new("test"));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            log.subscribe("counter", move |_event: u32| {
                let counter = counter.clone();
                async move {
                    tokio::task::yield_now().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        }
        for event in 0..10u32 {
            log.append(event).await.unwrap();
        }
        log.join().await;

        assert_eq!(counter.load(Ordering::SeqCst), 30);
    }

    #[tokio::test]
    async fn store_backed_log_hydrates_backlog() {
        struct VecStore(Mutex<Vec<u32>>);

        #[async_trait]
        impl EventStore<u32> for VecStore {
            async fn append(&self, event: &u32) -> Result<()> {
                self.0.lock().await.push(*event);
                Ok(())
            }
            async fn replay(&self) -> Result<Vec<u32>> {
                Ok(self.0.lock().await.clone())
            }
        }

        let store = Arc::new(VecStore(Mutex::new(vec![7, 8])));
        let log = EventLog::with_store("test", store.clone()).await.unwrap();
        log.append(9).await.unwrap();

        assert_eq!(log.snapshot().await, vec![7, 8, 9]);
        assert_eq!(*store.0.lock().await, vec![7, 8, 9]);
    }
}
