//! Identification orchestration.
//!
//! Consumes streamable events, routes items to their identification
//! provider, persists successful identifications, and keeps every known
//! item on a re-identification schedule with retry-after-cooldown semantics
//! for transient failures.
//!
//! Components (episodes, seasons) are never identified before their parent
//! has a persisted identification, and their derived identifications are
//! never persisted; they are recomputed from the parent on demand. A
//! component seen before its parent is parked in a deferred index and
//! refreshed automatically once the parent's identification lands.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};
use url::Url;
use vidra_model::{
    Discovery, Identification, IdentificationEvent, Match, MatchType,
    ProviderRef, StreamableEvent, WorkDescriptor, WorkId,
};

use crate::config::RefreshConfig;
use crate::error::Result;
use crate::events::EventLog;
use crate::streamable::DiscoveryIndex;

/// Matches a discovery against an external metadata catalog.
#[async_trait]
pub trait IdentificationProvider: Send + Sync {
    /// Identify a top-level item. `Ok(None)` means the provider found no
    /// match; an `Io` error is treated as transient and retried.
    async fn identify(&self, discovery: &Discovery) -> Result<Option<Identification>>;

    /// Derive a component's identification from its parent's. Local
    /// derivation, expected to always produce a result.
    fn identify_child(
        &self,
        discovery: &Discovery,
        parent: &Identification,
    ) -> Identification;
}

/// Deterministic fallback that synthesizes an identification from raw
/// attributes alone, guaranteeing every resource has *some* identification.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimalProvider;

impl MinimalProvider {
    /// Title heuristics: explicit `title` attribute, else the last path
    /// segment without its extension.
    fn title_of(discovery: &Discovery) -> String {
        if let Some(title) = discovery.attributes.get("title") {
            return title.clone();
        }
        let path = discovery.location.path();
        let segment = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(path);
        match segment.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem.to_string(),
            _ => segment.to_string(),
        }
    }

    /// Synthesize the minimal identification for a discovery.
    pub fn synthesize(discovery: &Discovery) -> Identification {
        Identification {
            descriptors: vec![WorkDescriptor {
                id: WorkId(format!("minimal:{}", discovery.location)),
                title: Self::title_of(discovery),
                attributes: discovery.attributes.clone(),
            }],
            work_match: Match {
                match_type: MatchType::Minimal,
                accuracy: 0.0,
                creation_time: Utc::now(),
            },
        }
    }
}

#[async_trait]
impl IdentificationProvider for MinimalProvider {
    async fn identify(&self, discovery: &Discovery) -> Result<Option<Identification>> {
        Ok(Some(Self::synthesize(discovery)))
    }

    fn identify_child(
        &self,
        discovery: &Discovery,
        _parent: &Identification,
    ) -> Identification {
        Self::synthesize(discovery)
    }
}

#[derive(Debug, Clone)]
struct RefreshTask {
    location: Url,
    provider: ProviderRef,
}

/// Scheduler and identification caches; all mutation happens under one lock.
struct OrchestratorState {
    /// Priority queue ordered by `(next_refresh_time, location)`; the
    /// location tie-break keeps pop order deterministic.
    schedule: BTreeMap<(DateTime<Utc>, Url), RefreshTask>,
    /// location -> its current key in `schedule`. Rescheduling is always
    /// remove-then-insert, so at most one entry exists per location.
    scheduled_at: HashMap<Url, DateTime<Utc>>,
    /// Persisted identifications of top-level items.
    persisted: HashMap<Url, Identification>,
    /// In-memory derived identifications of components.
    derived: HashMap<Url, Identification>,
    /// Components waiting for their parent's identification, parent-keyed.
    /// Resolved as soon as the parent's identification is persisted.
    deferred: HashMap<Url, BTreeMap<Url, ProviderRef>>,
    /// Completion time of the latest identification attempt per location.
    last_refresh: HashMap<Url, DateTime<Utc>>,
}

impl OrchestratorState {
    fn unschedule(&mut self, location: &Url) {
        if let Some(at) = self.scheduled_at.remove(location) {
            self.schedule.remove(&(at, location.clone()));
        }
    }

    fn schedule_at(&mut self, location: &Url, provider: &ProviderRef, when: DateTime<Utc>) {
        self.unschedule(location);
        self.schedule.insert(
            (when, location.clone()),
            RefreshTask {
                location: location.clone(),
                provider: provider.clone(),
            },
        );
        self.scheduled_at.insert(location.clone(), when);
    }
}

/// Drives identification for everything flowing through the streamable log.
pub struct IdentificationOrchestrator {
    config: RefreshConfig,
    providers: HashMap<ProviderRef, Arc<dyn IdentificationProvider>>,
    index: Arc<DiscoveryIndex>,
    log: Arc<EventLog<IdentificationEvent>>,
    state: Mutex<OrchestratorState>,
    shutdown: Arc<RwLock<bool>>,
}

impl fmt::Debug for IdentificationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentificationOrchestrator")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl IdentificationOrchestrator {
    /// Build the orchestrator, priming the persisted-identification cache
    /// from the identification log's backlog.
    pub async fn new(
        config: RefreshConfig,
        providers: HashMap<ProviderRef, Arc<dyn IdentificationProvider>>,
        index: Arc<DiscoveryIndex>,
        log: Arc<EventLog<IdentificationEvent>>,
    ) -> Self {
        let mut persisted = HashMap::new();
        for event in log.snapshot().await {
            persisted.insert(event.location, event.identification);
        }
        Self {
            config,
            providers,
            index,
            log,
            state: Mutex::new(OrchestratorState {
                schedule: BTreeMap::new(),
                scheduled_at: HashMap::new(),
                persisted,
                derived: HashMap::new(),
                deferred: HashMap::new(),
                last_refresh: HashMap::new(),
            }),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Best-known identification for a location, persisted or derived.
    pub async fn identification_of(&self, location: &Url) -> Option<Identification> {
        let state = self.state.lock().await;
        state
            .persisted
            .get(location)
            .or_else(|| state.derived.get(location))
            .cloned()
    }

    /// Scheduled refresh time for a location, if any.
    pub async fn scheduled_for(&self, location: &Url) -> Option<DateTime<Utc>> {
        self.state.lock().await.scheduled_at.get(location).copied()
    }

    /// Number of entries in the refresh schedule.
    pub async fn schedule_len(&self) -> usize {
        self.state.lock().await.schedule.len()
    }

    /// Streamable event entry point. Never propagates per-item failures.
    pub async fn handle(&self, event: &StreamableEvent) {
        match event {
            StreamableEvent::Updated { streamable } => {
                let Some(record) = self.index.get(&streamable.location) else {
                    debug!(location = %streamable.location, "no discovery for streamable yet");
                    return;
                };
                let Some(provider) = record.provider.clone() else {
                    // No provider configured for this source; resources fall
                    // back to the minimal identification downstream.
                    return;
                };
                self.refresh_location(&streamable.location, &provider).await;
            }
            StreamableEvent::Removed { location } => {
                let mut state = self.state.lock().await;
                state.unschedule(location);
                state.persisted.remove(location);
                state.derived.remove(location);
                state.last_refresh.remove(location);
                state.deferred.remove(location);
                state.deferred.retain(|_, children| {
                    children.remove(location);
                    !children.is_empty()
                });
            }
        }
    }

    /// Identify one location now. Called for fresh streamables, scheduled
    /// refreshes and out-of-band `reidentify` requests alike.
    async fn refresh_location(&self, location: &Url, provider_ref: &ProviderRef) {
        let Some(record) = self.index.get(location) else {
            debug!(location = %location, "skipping refresh, discovery gone");
            return;
        };
        let Some(provider) = self.providers.get(provider_ref) else {
            warn!(location = %location, provider = %provider_ref, "unknown identification provider");
            return;
        };

        if record.discovery.media_type.is_component() {
            self.refresh_component(&record.discovery, provider_ref, provider)
                .await;
        } else {
            self.refresh_root(&record.discovery, provider_ref, provider)
                .await;
        }
    }

    async fn refresh_component(
        &self,
        discovery: &Discovery,
        provider_ref: &ProviderRef,
        provider: &Arc<dyn IdentificationProvider>,
    ) {
        let location = &discovery.location;
        let Some(parent) = &discovery.parent_location else {
            warn!(location = %location, "component discovery without a parent location");
            return;
        };
        let parent_identification = {
            let state = self.state.lock().await;
            state.persisted.get(parent).cloned()
        };
        let Some(parent_identification) = parent_identification else {
            // Not an error: the child is parked in the deferred index and
            // refreshed as soon as the parent's identification lands.
            warn!(
                location = %location,
                parent = %parent,
                "deferring component identification, parent not yet identified"
            );
            let mut state = self.state.lock().await;
            state
                .deferred
                .entry(parent.clone())
                .or_default()
                .insert(location.clone(), provider_ref.clone());
            return;
        };

        let derived = provider.identify_child(discovery, &parent_identification);
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.derived.insert(location.clone(), derived);
        state.last_refresh.insert(location.clone(), now);
        let next = self.next_natural(&state, location, now);
        state.schedule_at(location, provider_ref, next);
    }

    async fn refresh_root(
        &self,
        discovery: &Discovery,
        provider_ref: &ProviderRef,
        provider: &Arc<dyn IdentificationProvider>,
    ) {
        let location = &discovery.location;
        // The provider call runs outside the scheduler lock.
        let outcome = provider.identify(discovery).await;
        let now = Utc::now();
        let resolved: BTreeMap<Url, ProviderRef> = {
            let mut state = self.state.lock().await;
            state.last_refresh.insert(location.clone(), now);
            match outcome {
                Ok(Some(identification)) => {
                    let event = IdentificationEvent {
                        location: location.clone(),
                        identification: identification.clone(),
                    };
                    if let Err(e) = self.log.append(event).await {
                        warn!(location = %location, "failed to persist identification: {e}");
                    }
                    state.persisted.insert(location.clone(), identification);
                    let next = self.next_natural(&state, location, now);
                    state.schedule_at(location, provider_ref, next);
                    debug!(location = %location, next_refresh = %next, "identification persisted");
                    state.deferred.remove(location).unwrap_or_default()
                }
                Ok(None) => {
                    debug!(location = %location, "provider returned no identification");
                    let next = self.next_natural(&state, location, now);
                    state.schedule_at(location, provider_ref, next);
                    BTreeMap::new()
                }
                Err(e) if e.is_transient() => {
                    let retry = now + self.config.retry_cooldown();
                    warn!(location = %location, retry_at = %retry, "transient identification failure: {e}");
                    state.schedule_at(location, provider_ref, retry);
                    BTreeMap::new()
                }
                Err(e) => {
                    error!(location = %location, "identification failed fatally: {e}");
                    let next = self.next_natural(&state, location, now);
                    state.schedule_at(location, provider_ref, next);
                    BTreeMap::new()
                }
            }
        };

        // Children parked behind this parent can now be derived.
        for (child, child_provider_ref) in resolved {
            debug!(location = %child, parent = %location, "resolving deferred component");
            let Some(record) = self.index.get(&child) else {
                continue;
            };
            let Some(child_provider) = self.providers.get(&child_provider_ref).cloned()
            else {
                continue;
            };
            self.refresh_component(&record.discovery, &child_provider_ref, &child_provider)
                .await;
        }
    }

    /// `now + max(min_refresh, window − time_since_last_refresh)`: roughly
    /// every window, but never more often than `min_refresh` apart.
    fn next_natural(
        &self,
        state: &OrchestratorState,
        location: &Url,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let natural = match state.last_refresh.get(location) {
            Some(last) => self.config.refresh_window() - (now - *last),
            None => self.config.min_refresh(),
        };
        now + natural.max(self.config.min_refresh())
    }

    /// Pop and run every schedule entry that is due at `now`. Each entry is
    /// rescheduled to `now + window` *before* it runs, so a slow or failing
    /// run cannot cause tight re-triggering.
    pub async fn run_due(&self, now: DateTime<Utc>) {
        let due: Vec<RefreshTask> = {
            let mut state = self.state.lock().await;
            let mut due = Vec::new();
            while let Some(entry) = state.schedule.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                due.push(entry.remove());
            }
            let fallback = now + self.config.refresh_window();
            for task in &due {
                state.schedule_at(&task.location, &task.provider, fallback);
            }
            due
        };
        for task in due {
            debug!(location = %task.location, "running scheduled re-identification");
            self.refresh_location(&task.location, &task.provider).await;
        }
    }

    /// Trigger an out-of-band immediate run of the scheduled task for a
    /// location, without unscheduling it.
    pub async fn reidentify(&self, location: &Url) {
        let task = {
            let state = self.state.lock().await;
            state
                .scheduled_at
                .get(location)
                .and_then(|at| state.schedule.get(&(*at, location.clone())))
                .cloned()
        };
        match task {
            Some(task) => {
                self.refresh_location(&task.location, &task.provider).await;
            }
            None => debug!(location = %location, "reidentify: nothing scheduled"),
        }
    }

    /// Start the periodic refresher tick.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self);
        tokio::spawn(async move {
            info!(
                tick_secs = orchestrator.config.tick_secs,
                "background refresher started"
            );
            let mut ticker = interval_at(
                Instant::now() + orchestrator.config.initial_delay(),
                orchestrator.config.tick(),
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if *orchestrator.shutdown.read().await {
                    info!("background refresher shutting down");
                    break;
                }
                orchestrator.run_due(Utc::now()).await;
            }
        })
    }

    /// Request shutdown; takes effect at the next tick.
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}
