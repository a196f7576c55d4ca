//! Resource assembly.
//!
//! Maintains the authoritative queryable aggregate per location by merging
//! streamable state, identification results and probed technical metadata.
//! Expensive identification work is handed off to per-location background
//! tasks; their results arrive on a single-slot channel drained by one
//! consumer task, so a slow consumer stalls producers instead of buffering
//! unbounded work.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use vidra_model::{
    ContentId, Identification, MediaDetails, ProviderRef, Resource,
    ResourceEvent, Streamable, StreamableEvent,
};

use crate::config::EventBusConfig;
use crate::error::Result;
use crate::identify::{IdentificationProvider, MinimalProvider};
use crate::streamable::{DiscoveryIndex, DiscoveryRecord};

struct IdentifyOutcome {
    root: Url,
    /// Token of the task that produced this result; lets a stale outcome
    /// that raced past its cancellation be told apart from the live task.
    token: Arc<CancellationToken>,
    result: Result<Option<Identification>>,
}

/// Aggregate state and its derived indices; all guarded by one lock.
struct AssemblyState {
    resources: HashMap<Url, Resource>,
    streamables: HashMap<Url, Streamable>,
    discoveries: HashMap<Url, DiscoveryRecord>,
    /// Populated only once background identification (or child derivation)
    /// completes; reads fall back to the minimal provider.
    identifications: HashMap<Url, Identification>,
    /// root location -> its known dependents.
    dependents: HashMap<Url, BTreeSet<Url>>,
    /// dependent location -> its root.
    roots: HashMap<Url, Url>,
    /// content id -> every location carrying it.
    content_ids: HashMap<ContentId, BTreeSet<Url>>,
    /// First time each location was seen; survives updates.
    discovery_times: HashMap<Url, DateTime<Utc>>,
    /// Cancellation handles for in-flight background identification,
    /// keyed by root location.
    tasks: HashMap<Url, Arc<CancellationToken>>,
}

/// Builds and serves the merged resource view.
pub struct ResourceAssembler {
    providers: HashMap<ProviderRef, Arc<dyn IdentificationProvider>>,
    minimal: Arc<dyn IdentificationProvider>,
    index: Arc<DiscoveryIndex>,
    bus: broadcast::Sender<ResourceEvent>,
    state: Mutex<AssemblyState>,
    results_tx: mpsc::Sender<IdentifyOutcome>,
    results_rx: StdMutex<Option<mpsc::Receiver<IdentifyOutcome>>>,
}

impl fmt::Debug for ResourceAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAssembler")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl ResourceAssembler {
    pub fn new(
        bus_config: &EventBusConfig,
        providers: HashMap<ProviderRef, Arc<dyn IdentificationProvider>>,
        index: Arc<DiscoveryIndex>,
    ) -> Self {
        let (bus, _) = broadcast::channel(bus_config.capacity);
        // Capacity 1: the hand-off rendezvous between identification tasks
        // and the consumer.
        let (results_tx, results_rx) = mpsc::channel(1);
        Self {
            providers,
            minimal: Arc::new(MinimalProvider),
            index,
            bus,
            state: Mutex::new(AssemblyState {
                resources: HashMap::new(),
                streamables: HashMap::new(),
                discoveries: HashMap::new(),
                identifications: HashMap::new(),
                dependents: HashMap::new(),
                roots: HashMap::new(),
                content_ids: HashMap::new(),
                discovery_times: HashMap::new(),
                tasks: HashMap::new(),
            }),
            results_tx,
            results_rx: StdMutex::new(Some(results_rx)),
        }
    }

    /// Resource change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.bus.subscribe()
    }

    /// Start the consumer task draining background identification results.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let rx = self
            .results_rx
            .lock()
            .expect("assembler receiver slot poisoned")
            .take();
        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                warn!("resource assembler consumer already started");
                return;
            };
            info!("resource assembler consumer started");
            while let Some(outcome) = rx.recv().await {
                self.apply_outcome(outcome).await;
            }
            info!("resource assembler consumer stopped");
        })
    }

    /// Cancel every in-flight identification task.
    pub async fn stop(&self) {
        let state = self.state.lock().await;
        for token in state.tasks.values() {
            token.cancel();
        }
    }

    pub async fn find(&self, location: &Url) -> Option<Resource> {
        self.state.lock().await.resources.get(location).cloned()
    }

    /// First known resource for a content id; ties across locations resolve
    /// to the lexicographically smallest location.
    pub async fn find_first(&self, content_id: &ContentId) -> Option<Resource> {
        let state = self.state.lock().await;
        let location = state.content_ids.get(content_id)?.first()?;
        state.resources.get(location).cloned()
    }

    /// The root resource governing a location: itself unless it declares a
    /// root via the dependent index.
    pub async fn find_root(&self, location: &Url) -> Option<Resource> {
        let state = self.state.lock().await;
        let root = state.roots.get(location).unwrap_or(location);
        state.resources.get(root).cloned()
    }

    pub async fn resources(&self) -> Vec<Resource> {
        self.state.lock().await.resources.values().cloned().collect()
    }

    /// Streamable event entry point.
    pub async fn handle(&self, event: &StreamableEvent) {
        match event {
            StreamableEvent::Updated { streamable } => self.apply_updated(streamable).await,
            StreamableEvent::Removed { location } => self.apply_removed(location).await,
        }
    }

    async fn apply_updated(&self, streamable: &Streamable) {
        let location = streamable.location.clone();
        let record = self
            .index
            .get(&location)
            .unwrap_or_else(|| DiscoveryRecord::from_streamable(streamable));

        let mut state = self.state.lock().await;
        Self::teardown(&mut state, &location);

        state
            .discovery_times
            .entry(location.clone())
            .or_insert_with(Utc::now);
        state
            .content_ids
            .entry(ContentId::from(&streamable.fingerprint))
            .or_default()
            .insert(location.clone());
        if streamable.media_type.is_component() {
            if let Some(parent) = &streamable.parent_location {
                state.roots.insert(location.clone(), parent.clone());
                state
                    .dependents
                    .entry(parent.clone())
                    .or_default()
                    .insert(location.clone());
            }
        }
        state.streamables.insert(location.clone(), streamable.clone());
        state.discoveries.insert(location.clone(), record.clone());

        if streamable.media_type.is_component() {
            // Dependents never get their own provider call: derive from the
            // root's cached identification when it is already known.
            let root_identification = state
                .roots
                .get(&location)
                .and_then(|root| state.identifications.get(root))
                .cloned();
            if let Some(root_identification) = root_identification {
                let provider = self.provider_for(&record);
                let derived = provider.identify_child(&record.discovery, &root_identification);
                state.identifications.insert(location.clone(), derived);
            }
        } else {
            self.spawn_identify(&mut state, &location, &record);
        }

        self.republish(&mut state, &location);
    }

    async fn apply_removed(&self, location: &Url) {
        let mut state = self.state.lock().await;
        if let Some(token) = state.tasks.remove(location) {
            token.cancel();
        }
        let dependents = state.dependents.get(location).cloned().unwrap_or_default();

        Self::teardown(&mut state, location);
        state.streamables.remove(location);
        state.discoveries.remove(location);
        state.identifications.remove(location);
        state.discovery_times.remove(location);
        state.resources.remove(location);

        // Dependents keep their own streamable lifecycle, but their derived
        // identifications die with the root.
        for dependent in dependents {
            if state.identifications.remove(&dependent).is_some() {
                self.republish(&mut state, &dependent);
            }
        }

        self.publish(ResourceEvent::Removed {
            location: location.clone(),
        });
    }

    /// Remove a location from the derived indices. Idempotent; leaves the
    /// location's own dependents set alone so a reappearing root finds its
    /// children again.
    fn teardown(state: &mut AssemblyState, location: &Url) {
        if let Some(old) = state.streamables.get(location) {
            let content_id = ContentId::from(&old.fingerprint);
            if let Some(locations) = state.content_ids.get_mut(&content_id) {
                locations.remove(location);
                if locations.is_empty() {
                    state.content_ids.remove(&content_id);
                }
            }
        }
        if let Some(root) = state.roots.remove(location) {
            if let Some(siblings) = state.dependents.get_mut(&root) {
                siblings.remove(location);
                if siblings.is_empty() {
                    state.dependents.remove(&root);
                }
            }
        }
    }

    /// Kick off background identification for a root, cancelling any
    /// in-flight task for the same location first.
    fn spawn_identify(
        &self,
        state: &mut AssemblyState,
        location: &Url,
        record: &DiscoveryRecord,
    ) {
        if let Some(previous) = state.tasks.remove(location) {
            debug!(location = %location, "replacing in-flight identification task");
            previous.cancel();
        }
        let Some(provider_ref) = record.provider.clone() else {
            return;
        };
        let Some(provider) = self.providers.get(&provider_ref).cloned() else {
            warn!(location = %location, provider = %provider_ref, "unknown identification provider");
            return;
        };

        let token = Arc::new(CancellationToken::new());
        let task_token = Arc::clone(&token);
        let tx = self.results_tx.clone();
        let discovery = record.discovery.clone();
        let root = location.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = task_token.cancelled() => return,
                result = provider.identify(&discovery) => result,
            };
            let outcome = IdentifyOutcome {
                root,
                token: Arc::clone(&task_token),
                result,
            };
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tx.send(outcome) => {}
            }
        });
        state.tasks.insert(location.clone(), token);
    }

    /// Apply one background identification result. Results for locations
    /// whose streamable is gone are discarded without complaint.
    async fn apply_outcome(&self, outcome: IdentifyOutcome) {
        let mut state = self.state.lock().await;
        let root = outcome.root;
        // Only the task's own registration is retired; a stale outcome must
        // not evict the replacement task's token.
        if state
            .tasks
            .get(&root)
            .is_some_and(|current| Arc::ptr_eq(current, &outcome.token))
        {
            state.tasks.remove(&root);
        }
        if !state.streamables.contains_key(&root) {
            debug!(location = %root, "discarding identification result for removed resource");
            return;
        }
        match outcome.result {
            Ok(Some(identification)) => {
                state
                    .identifications
                    .insert(root.clone(), identification.clone());
                self.republish(&mut state, &root);
                let dependents = state.dependents.get(&root).cloned().unwrap_or_default();
                for dependent in dependents {
                    let Some(record) = state.discoveries.get(&dependent).cloned() else {
                        continue;
                    };
                    let provider = self.provider_for(&record);
                    let derived =
                        provider.identify_child(&record.discovery, &identification);
                    state.identifications.insert(dependent.clone(), derived);
                    self.republish(&mut state, &dependent);
                }
            }
            Ok(None) => {
                debug!(location = %root, "provider found no identification");
                self.clear_identifications(&mut state, &root);
            }
            Err(e) => {
                warn!(location = %root, "background identification failed: {e}");
                self.clear_identifications(&mut state, &root);
            }
        }
    }

    /// Drop cached identifications for a root and its dependents; the next
    /// read falls back to the minimal provider.
    fn clear_identifications(&self, state: &mut AssemblyState, root: &Url) {
        if state.identifications.remove(root).is_some() {
            self.republish(state, root);
        }
        let dependents = state.dependents.get(root).cloned().unwrap_or_default();
        for dependent in dependents {
            if state.identifications.remove(&dependent).is_some() {
                self.republish(state, &dependent);
            }
        }
    }

    /// Attach probed technical metadata to a location and republish it.
    pub async fn apply_details(&self, location: &Url, details: MediaDetails) {
        let mut state = self.state.lock().await;
        let Some(streamable) = state.streamables.get_mut(location) else {
            debug!(location = %location, "discarding probe result for removed resource");
            return;
        };
        streamable.details = Some(details);
        self.republish(&mut state, location);
    }

    fn provider_for(&self, record: &DiscoveryRecord) -> Arc<dyn IdentificationProvider> {
        record
            .provider
            .as_ref()
            .and_then(|provider_ref| self.providers.get(provider_ref).cloned())
            .unwrap_or_else(|| Arc::clone(&self.minimal))
    }

    /// Rebuild the merged resource for a location and broadcast it.
    fn republish(&self, state: &mut AssemblyState, location: &Url) {
        let Some(resource) = Self::build_resource(state, location) else {
            return;
        };
        state.resources.insert(location.clone(), resource.clone());
        self.publish(ResourceEvent::Updated { resource });
    }

    fn build_resource(state: &AssemblyState, location: &Url) -> Option<Resource> {
        let streamable = state.streamables.get(location)?;
        let record = state.discoveries.get(location)?;
        let discovery_time = state
            .discovery_times
            .get(location)
            .copied()
            .unwrap_or_else(Utc::now);
        let identification = state
            .identifications
            .get(location)
            .cloned()
            .unwrap_or_else(|| MinimalProvider::synthesize(&record.discovery));
        let attributes = record.discovery.attributes.clone();
        let last_modification_time = attributes
            .get("last_modified")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or(discovery_time);
        let size = attributes.get("size").and_then(|raw| raw.parse().ok());
        let details = streamable.details.clone().unwrap_or_default();
        Some(Resource {
            location: location.clone(),
            parent_location: streamable.parent_location.clone(),
            media_type: streamable.media_type,
            content_id: ContentId::from(&streamable.fingerprint),
            last_modification_time,
            size,
            discovery_time,
            tags: streamable.tags.clone(),
            duration: details.duration,
            media_structure: details.structure,
            snapshots: details.snapshots,
            attributes,
            identification,
        })
    }

    fn publish(&self, event: ResourceEvent) {
        // Send fails only when nobody is subscribed.
        let _ = self.bus.send(event);
    }
}
