#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use url::Url;
use vidra_core::discovery::{Discoverer, DiscoverySink};
use vidra_core::events::EventStore;
use vidra_core::identify::IdentificationProvider;
use vidra_core::probe::MediaProber;
use vidra_core::Result;
use vidra_model::{
    ContentFingerprint, Discovery, Identification, Match, MatchType,
    MediaDetails, MediaType, WorkDescriptor, WorkId,
};

pub fn url(s: &str) -> Url {
    Url::parse(s).expect("valid test url")
}

pub fn discovery(path: &str, media_type: MediaType, parent: Option<&str>) -> Discovery {
    Discovery {
        media_type,
        location: url(path),
        attributes: BTreeMap::new(),
        parent_location: parent.map(url),
        fingerprint: ContentFingerprint(format!("fp:{path}")),
    }
}

/// Scanner that replays a fixed list of batches on every pass.
pub struct StaticDiscoverer {
    pub batches: Vec<(Url, Vec<Discovery>)>,
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

/// Provider that always matches by name and derives children from their
/// parent's primary descriptor.
pub struct CatalogProvider;

#[async_trait]
impl IdentificationProvider for CatalogProvider {
    async fn identify(&self, discovery: &Discovery) -> Result<Option<Identification>> {
        Ok(Some(Identification {
            descriptors: vec![WorkDescriptor {
                id: WorkId(format!("catalog:{}", discovery.location)),
                title: "Catalog".to_string(),
                attributes: BTreeMap::new(),
            }],
            work_match: Match {
                match_type: MatchType::Name,
                accuracy: 0.9,
                creation_time: Utc::now(),
            },
        }))
    }

    fn identify_child(
        &self,
        discovery: &Discovery,
        parent: &Identification,
    ) -> Identification {
        let parent_id = parent.primary().map(|d| d.id.as_str()).unwrap_or("?");
        Identification {
            descriptors: vec![WorkDescriptor {
                id: WorkId(format!("{}#{}", parent_id, discovery.location)),
                title: "Catalog child".to_string(),
                attributes: BTreeMap::new(),
            }],
            work_match: Match {
                match_type: MatchType::Derived,
                accuracy: 0.9,
                creation_time: Utc::now(),
            },
        }
    }
}

/// Prober whose cache always hits with a fixed duration.
pub struct StubProber {
    pub duration: Duration,
}

#[async_trait]
impl MediaProber for StubProber {
    async fn probe_cached(&self, _location: &Url) -> Result<Option<MediaDetails>> {
        Ok(Some(MediaDetails {
            duration: Some(self.duration),
            structure: None,
            snapshots: Vec::new(),
        }))
    }

    async fn probe(&self, _location: &Url) -> Result<MediaDetails> {
        Ok(MediaDetails {
            duration: Some(self.duration),
            structure: None,
            snapshots: Vec::new(),
        })
    }
}

/// In-memory durable store, standing in for the embedding application's
/// database.
#[derive(Default)]
pub struct VecStore<T> {
    events: StdMutex<Vec<T>>,
}

impl<T> VecStore<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: StdMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> EventStore<T> for VecStore<T> {
    async fn append(&self, event: &T) -> Result<()> {
        self.events
            .lock()
            .expect("store poisoned")
            .push(event.clone());
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<T>> {
        Ok(self.events.lock().expect("store poisoned").clone())
    }
}

/// Poll `check` until it returns `Some`, failing the test after 5 seconds.
pub async fn wait_until<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
