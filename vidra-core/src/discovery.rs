//! Discovery controller: periodically runs every configured discoverer and
//! publishes the resulting [`DiscoverEvent`] batches on a live stream.
//!
//! The stream is intentionally non-persistent; the diff engine downstream
//! converts batches into the persisted streamable log, so missed discover
//! events are simply recovered by the next scan pass.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};
use url::Url;
use vidra_model::{DiscoverEvent, Discovery, ProviderRef, folder_form};

use crate::config::{DiscoveryConfig, EventBusConfig};
use crate::error::Result;

/// A pluggable file-system/media scanner.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Scan `root`, reporting one batch per directory through `sink`.
    /// Fails with an I/O error when the root cannot be scanned.
    async fn discover(&self, root: &Url, sink: &dyn DiscoverySink) -> Result<()>;
}

/// Callback surface handed to discoverers: one call per scanned directory.
#[async_trait]
pub trait DiscoverySink: Send + Sync {
    async fn publish(&self, base: &Url, discoveries: Vec<Discovery>);
}

/// A configured discoverer bound to its root location.
#[derive(Clone)]
pub struct DiscoverySource {
    pub name: String,
    pub root: Url,
    pub tags: BTreeSet<String>,
    /// Identification provider discoveries from this source should be
    /// routed to, if any.
    pub provider: Option<ProviderRef>,
    pub discoverer: Arc<dyn Discoverer>,
}

impl fmt::Debug for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverySource")
            .field("name", &self.name)
            .field("root", &self.root.as_str())
            .field("tags", &self.tags)
            .field("provider", &self.provider)
            .finish()
    }
}

/// Parent directory of a location, `None` at the filesystem root.
fn parent_of(url: &Url) -> Option<Url> {
    let trimmed = url.path().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let idx = trimmed.rfind('/')?;
    let mut parent = url.clone();
    parent.set_path(&trimmed[..=idx]);
    Some(parent)
}

/// Sink bound to one source for the duration of a scan pass.
struct BatchSink {
    source_root: Url,
    tags: BTreeSet<String>,
    provider: Option<ProviderRef>,
    bus: broadcast::Sender<DiscoverEvent>,
}

#[async_trait]
impl DiscoverySink for BatchSink {
    async fn publish(&self, base: &Url, discoveries: Vec<Discovery>) {
        let parent = match folder_form(base) {
            Ok(folder) if folder == self.source_root => None,
            _ => parent_of(base),
        };
        match DiscoverEvent::new(
            base,
            self.provider.clone(),
            self.tags.clone(),
            parent,
            discoveries,
        ) {
            Ok(event) => {
                debug!(
                    base = %event.base,
                    correlation_id = %event.correlation_id,
                    discoveries = event.discoveries.len(),
                    "publishing discover event"
                );
                // No live subscriber is not an error; the pass still ran.
                let _ = self.bus.send(event);
            }
            Err(e) => {
                warn!(base = %base, "dropping discover batch with invalid base: {e}");
            }
        }
    }
}

/// Periodically runs every configured source and publishes discover events.
///
/// A failing source is logged and does not abort the remaining sources or
/// the schedule.
pub struct DiscoveryController {
    config: DiscoveryConfig,
    sources: Vec<DiscoverySource>,
    bus: broadcast::Sender<DiscoverEvent>,
    shutdown: Arc<RwLock<bool>>,
}

impl fmt::Debug for DiscoveryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryController")
            .field("sources", &self.sources.len())
            .field("subscribers", &self.bus.receiver_count())
            .finish()
    }
}

impl DiscoveryController {
    pub fn new(
        config: DiscoveryConfig,
        bus_config: &EventBusConfig,
        sources: Vec<DiscoverySource>,
    ) -> Self {
        let (bus, _) = broadcast::channel(bus_config.capacity);
        Self {
            config,
            sources,
            bus,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Subscribe to the live discover stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoverEvent> {
        self.bus.subscribe()
    }

    /// Run one scan pass over every source.
    pub async fn run_pass(&self) {
        for source in &self.sources {
            let root = match folder_form(&source.root) {
                Ok(root) => root,
                Err(e) => {
                    warn!(source = %source.name, "invalid source root: {e}");
                    continue;
                }
            };
            let sink = BatchSink {
                source_root: root,
                tags: source.tags.clone(),
                provider: source.provider.clone(),
                bus: self.bus.clone(),
            };
            if let Err(e) = source.discoverer.discover(&source.root, &sink).await {
                warn!(source = %source.name, root = %source.root, "scan failed: {e}");
            }
        }
    }

    /// Start the periodic scan task: fixed initial delay, then fixed period.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(&self);
        tokio::spawn(async move {
            info!(
                sources = controller.sources.len(),
                period_secs = controller.config.period_secs,
                "discovery controller started"
            );
            let mut ticker = interval_at(
                Instant::now() + controller.config.initial_delay(),
                controller.config.period(),
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if *controller.shutdown.read().await {
                    info!("discovery controller shutting down");
                    break;
                }
                controller.run_pass().await;
            }
        })
    }

    /// Request shutdown; takes effect at the next tick.
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use vidra_model::{ContentFingerprint, MediaType};

    struct StaticDiscoverer {
        batches: Vec<(Url, Vec<Discovery>)>,
    }

    #[async_trait]
    impl Discoverer for StaticDiscoverer {
        async fn discover(&self, _root: &Url, sink: &dyn DiscoverySink) -> Result<()> {
            for (base, discoveries) in &self.batches {
                sink.publish(base, discoveries.clone()).await;
            }
            Ok(())
        }
    }

    struct FailingDiscoverer;

    #[async_trait]
    impl Discoverer for FailingDiscoverer {
        async fn discover(&self, _root: &Url, _sink: &dyn DiscoverySink) -> Result<()> {
            Err(std::io::Error::other("disk on fire").into())
        }
    }

    fn discovery(path: &str) -> Discovery {
        Discovery {
            media_type: MediaType::Movie,
            location: Url::parse(path).unwrap(),
            attributes: Default::default(),
            parent_location: None,
            fingerprint: ContentFingerprint(format!("fp-{path}")),
        }
    }

    fn source(name: &str, root: &str, discoverer: Arc<dyn Discoverer>) -> DiscoverySource {
        DiscoverySource {
            name: name.to_string(),
            root: Url::parse(root).unwrap(),
            tags: BTreeSet::new(),
            provider: None,
            discoverer,
        }
    }

    #[tokio::test]
    async fn failing_source_does_not_abort_siblings() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let batches = vec![(
            Url::parse("file:///media/movies/").unwrap(),
            vec![discovery("file:///media/movies/Avatar.txt")],
        )];
        let controller = DiscoveryController::new(
            DiscoveryConfig::default(),
            &EventBusConfig::default(),
            vec![
                source("broken", "file:///broken", Arc::new(FailingDiscoverer)),
                source(
                    "movies",
                    "file:///media/movies",
                    Arc::new(StaticDiscoverer { batches }),
                ),
            ],
        );
        let mut rx = controller.subscribe();
        controller.run_pass().await;

        let event = rx.try_recv().expect("movies batch published");
        seen.lock().unwrap().push(event.base.clone());
        assert_eq!(event.discoveries.len(), 1);
        assert_eq!(event.base.as_str(), "file:///media/movies/");
    }

    #[tokio::test]
    async fn base_at_source_root_has_no_parent() {
        let batches = vec![
            (
                Url::parse("file:///media/series/").unwrap(),
                vec![discovery("file:///media/series/Friends")],
            ),
            (
                Url::parse("file:///media/series/Friends/").unwrap(),
                vec![discovery("file:///media/series/Friends/friends_1x01.txt")],
            ),
        ];
        let controller = DiscoveryController::new(
            DiscoveryConfig::default(),
            &EventBusConfig::default(),
            vec![source(
                "series",
                "file:///media/series",
                Arc::new(StaticDiscoverer { batches }),
            )],
        );
        let mut rx = controller.subscribe();
        controller.run_pass().await;

        let root_batch = rx.try_recv().unwrap();
        assert_eq!(root_batch.parent_location, None);
        let child_batch = rx.try_recv().unwrap();
        assert_eq!(
            child_batch.parent_location.as_ref().map(Url::as_str),
            Some("file:///media/series/")
        );
    }
}
