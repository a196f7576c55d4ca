//! Streamable diff engine.
//!
//! Consumes [`DiscoverEvent`] batches, maintains an ordered cache of known
//! items, computes the minimal add/update/remove delta for the affected
//! subtree, and republishes the delta as persisted [`StreamableEvent`]s
//! (removals first, then updates).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;
use vidra_model::{
    DiscoverEvent, Discovery, ProviderRef, Streamable, StreamableEvent,
};

use crate::events::EventLog;

/// Compare two path strings, padding the shorter side's next character with
/// `/` before deciding, so that children sort directly after their parent
/// and before any sibling: `"a" < "a/2" < "ab"`.
pub fn path_cmp(a: &str, b: &str) -> Ordering {
    let mut x = a.chars();
    let mut y = b.chars();
    loop {
        match (x.next(), y.next()) {
            (None, None) => return Ordering::Equal,
            (ca, cb) => {
                let ca = ca.unwrap_or('/');
                let cb = cb.unwrap_or('/');
                match ca.cmp(&cb) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
        }
    }
}

/// Ordered cache key carrying the trailing-slash comparator.
///
/// Equality follows the comparator, so a location with and without its
/// trailing slash occupies the same slot.
#[derive(Debug, Clone)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn from_url(url: &Url) -> Self {
        Self(url.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for PathKey {
    fn cmp(&self, other: &Self) -> Ordering {
        path_cmp(&self.0, &other.0)
    }
}

impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PathKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PathKey {}

/// True when `path` lives strictly below `ancestor`.
fn is_descendant(path: &str, ancestor: &str) -> bool {
    let prefix = ancestor.trim_end_matches('/');
    path.len() > prefix.len() + 1
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'/'
}

/// Discovery data shared with the identification and assembly stages.
///
/// The diff engine writes an entry *before* appending the matching
/// streamable event, so downstream handlers always find the discovery that
/// produced the event they are processing.
#[derive(Debug, Clone)]
pub struct DiscoveryRecord {
    pub discovery: Discovery,
    pub provider: Option<ProviderRef>,
    pub tags: BTreeSet<String>,
}

impl DiscoveryRecord {
    /// Replay fallback: reconstruct a bare discovery from a persisted
    /// streamable. Attributes and the provider routing are not part of the
    /// log and come back empty; the next live scan restores them.
    pub fn from_streamable(streamable: &Streamable) -> Self {
        Self {
            discovery: Discovery {
                media_type: streamable.media_type,
                location: streamable.location.clone(),
                attributes: Default::default(),
                parent_location: streamable.parent_location.clone(),
                fingerprint: streamable.fingerprint.clone(),
            },
            provider: None,
            tags: streamable.tags.clone(),
        }
    }
}

/// Location-keyed lookup of the latest discovery per item.
#[derive(Debug, Default)]
pub struct DiscoveryIndex {
    entries: StdMutex<HashMap<Url, DiscoveryRecord>>,
}

impl DiscoveryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, location: &Url) -> Option<DiscoveryRecord> {
        self.entries
            .lock()
            .expect("discovery index poisoned")
            .get(location)
            .cloned()
    }

    fn insert(&self, record: DiscoveryRecord) {
        self.entries
            .lock()
            .expect("discovery index poisoned")
            .insert(record.discovery.location.clone(), record);
    }

    fn remove(&self, location: &Url) {
        self.entries
            .lock()
            .expect("discovery index poisoned")
            .remove(location);
    }
}

/// Converts discover batches into the persisted streamable event log.
pub struct DiffEngine {
    log: Arc<EventLog<StreamableEvent>>,
    index: Arc<DiscoveryIndex>,
    cache: Mutex<BTreeMap<PathKey, Streamable>>,
}

impl fmt::Debug for DiffEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffEngine").finish()
    }
}

impl DiffEngine {
    pub fn new(log: Arc<EventLog<StreamableEvent>>, index: Arc<DiscoveryIndex>) -> Self {
        Self {
            log,
            index,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build an engine whose cache and discovery index are primed from the
    /// log's backlog, so the first rescan after a restart diffs against the
    /// persisted state instead of re-emitting the entire library.
    pub async fn with_backlog(
        log: Arc<EventLog<StreamableEvent>>,
        index: Arc<DiscoveryIndex>,
    ) -> Self {
        let engine = Self::new(log, index);
        {
            let mut cache = engine.cache.lock().await;
            for event in engine.log.snapshot().await {
                match event {
                    StreamableEvent::Updated { streamable } => {
                        engine
                            .index
                            .insert(DiscoveryRecord::from_streamable(&streamable));
                        cache.insert(PathKey::from_url(&streamable.location), streamable);
                    }
                    StreamableEvent::Removed { location } => {
                        engine.index.remove(&location);
                        cache.remove(&PathKey::from_url(&location));
                    }
                }
            }
            debug!(cached = cache.len(), "diff cache hydrated from backlog");
        }
        engine
    }

    /// Diff one scan batch against the cached subtree and publish the delta.
    pub async fn handle(&self, event: &DiscoverEvent) {
        let mut cache = self.cache.lock().await;
        let base = event.base.as_str();
        let base_key = PathKey::new(base);

        let mut incoming: Vec<&Discovery> = event.discoveries.iter().collect();
        incoming.sort_by(|a, b| path_cmp(a.location.as_str(), b.location.as_str()));

        // The walk is bounded to the affected subtree: keys >= base while
        // they still carry the base prefix. An entry comparator-equal to the
        // base itself (the directory's own record) is not part of its
        // content listing and is skipped.
        let mut subtree: Vec<PathKey> = Vec::new();
        for (key, _) in cache.range(base_key.clone()..) {
            if *key == base_key {
                continue;
            }
            if !key.as_str().starts_with(base) {
                break;
            }
            subtree.push(key.clone());
        }

        let mut removals: Vec<PathKey> = Vec::new();
        let mut updates: Vec<(Discovery, Streamable)> = Vec::new();
        let mut added: BTreeSet<String> = BTreeSet::new();
        let mut last_matched: Option<String> = None;

        let mut i = 0;
        let mut j = 0;
        while i < subtree.len() || j < incoming.len() {
            let order = match (subtree.get(i), incoming.get(j)) {
                (Some(key), Some(discovery)) => {
                    path_cmp(key.as_str(), discovery.location.as_str())
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };
            match order {
                Ordering::Less => {
                    // Cached entry with no incoming counterpart. Descendants
                    // of a still-present discovery stay until their own
                    // ancestor rescans clean.
                    let key = &subtree[i];
                    let stale_descendant = last_matched
                        .as_deref()
                        .is_some_and(|m| is_descendant(key.as_str(), m));
                    if !stale_descendant {
                        removals.push(key.clone());
                    }
                    i += 1;
                }
                Ordering::Equal => {
                    let key = &subtree[i];
                    let discovery = incoming[j];
                    let candidate = Streamable::from_discovery(discovery, &event.tags);
                    if cache.get(key) != Some(&candidate) {
                        updates.push(((*discovery).clone(), candidate));
                    }
                    last_matched = Some(discovery.location.as_str().to_string());
                    i += 1;
                    j += 1;
                }
                Ordering::Greater => {
                    let discovery = incoming[j];
                    // A new item is only admitted once its declared parent
                    // is known; orphans re-appear on a later pass.
                    let parent_known = match &discovery.parent_location {
                        None => true,
                        Some(parent) => {
                            cache.contains_key(&PathKey::from_url(parent))
                                || added.contains(parent.as_str())
                        }
                    };
                    if parent_known {
                        let candidate = Streamable::from_discovery(discovery, &event.tags);
                        added.insert(discovery.location.as_str().to_string());
                        last_matched = Some(discovery.location.as_str().to_string());
                        updates.push(((*discovery).clone(), candidate));
                    } else {
                        debug!(
                            location = %discovery.location,
                            parent = ?discovery.parent_location.as_ref().map(Url::as_str),
                            "dropping orphan discovery, parent not yet known"
                        );
                    }
                    j += 1;
                }
            }
        }

        if removals.is_empty() && updates.is_empty() {
            return;
        }
        debug!(
            base,
            correlation_id = %event.correlation_id,
            removals = removals.len(),
            updates = updates.len(),
            "publishing streamable delta"
        );

        // Removals go out first so a recreate at the same location is seen
        // as remove-then-update by every consumer.
        for key in removals {
            if let Some(streamable) = cache.remove(&key) {
                self.index.remove(&streamable.location);
                let removed = StreamableEvent::Removed {
                    location: streamable.location,
                };
                if let Err(e) = self.log.append(removed).await {
                    warn!("failed to append streamable removal: {e}");
                }
            }
        }
        for (discovery, streamable) in updates {
            self.index.insert(DiscoveryRecord {
                discovery,
                provider: event.provider.clone(),
                tags: event.tags.clone(),
            });
            cache.insert(
                PathKey::from_url(&streamable.location),
                streamable.clone(),
            );
            let updated = StreamableEvent::Updated { streamable };
            if let Err(e) = self.log.append(updated).await {
                warn!("failed to append streamable update: {e}");
            }
        }
    }

    /// Current cache content in path order.
    pub async fn cache_snapshot(&self) -> Vec<Streamable> {
        self.cache.lock().await.values().cloned().collect()
    }

    /// Rebuild a cache purely from a replayed event sequence. Replaying the
    /// full log reproduces the live cache content.
    pub fn rebuild(events: &[StreamableEvent]) -> Vec<Streamable> {
        let mut cache: BTreeMap<PathKey, Streamable> = BTreeMap::new();
        for event in events {
            match event {
                StreamableEvent::Updated { streamable } => {
                    cache.insert(
                        PathKey::from_url(&streamable.location),
                        streamable.clone(),
                    );
                }
                StreamableEvent::Removed { location } => {
                    cache.remove(&PathKey::from_url(location));
                }
            }
        }
        cache.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use vidra_model::{ContentFingerprint, MediaType};

    #[test]
    fn comparator_sorts_children_before_siblings() {
        assert_eq!(path_cmp("a", "a/2"), Ordering::Less);
        assert_eq!(path_cmp("a/2", "ab"), Ordering::Less);
        assert_eq!(path_cmp("a", "ab"), Ordering::Less);
        assert_eq!(path_cmp("a", "a"), Ordering::Equal);
        assert_eq!(path_cmp("a", "a/"), Ordering::Equal);
        assert_eq!(path_cmp("b", "a/2"), Ordering::Greater);
    }

    #[test]
    fn descendant_check_requires_separator() {
        assert!(is_descendant("file:///a/b/c", "file:///a/b"));
        assert!(is_descendant("file:///a/b/c", "file:///a/b/"));
        assert!(!is_descendant("file:///a/bc", "file:///a/b"));
        assert!(!is_descendant("file:///a/b", "file:///a/b"));
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn discovery(path: &str, parent: Option<&str>) -> Discovery {
        Discovery {
            media_type: MediaType::Movie,
            location: url(path),
            attributes: Map::new(),
            parent_location: parent.map(url),
            fingerprint: ContentFingerprint(format!("fp:{path}")),
        }
    }

    async fn engine() -> (DiffEngine, Arc<EventLog<StreamableEvent>>) {
        let log = Arc::new(EventLog::new("streamables"));
        let index = Arc::new(DiscoveryIndex::new());
        (DiffEngine::new(log.clone(), index), log)
    }

    fn batch(base: &str, discoveries: Vec<Discovery>) -> DiscoverEvent {
        DiscoverEvent::new(&url(base), None, BTreeSet::new(), None, discoveries)
            .unwrap()
    }

    #[tokio::test]
    async fn first_batch_emits_one_update_per_discovery() {
        let (engine, log) = engine().await;
        engine
            .handle(&batch(
                "file:///m/",
                vec![
                    discovery("file:///m/Avatar.txt", None),
                    discovery("file:///m/Matrix.txt", None),
                ],
            ))
            .await;

        let events = log.snapshot().await;
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, StreamableEvent::Updated { .. })));
    }

    #[tokio::test]
    async fn unchanged_redelivery_is_idempotent() {
        let (engine, log) = engine().await;
        let event = batch(
            "file:///m/",
            vec![discovery("file:///m/Avatar.txt", None)],
        );
        engine.handle(&event).await;
        engine.handle(&event).await;

        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn missing_item_is_removed_before_new_updates() {
        let (engine, log) = engine().await;
        engine
            .handle(&batch(
                "file:///m/",
                vec![
                    discovery("file:///m/Avatar.txt", None),
                    discovery("file:///m/Matrix.txt", None),
                ],
            ))
            .await;
        engine
            .handle(&batch(
                "file:///m/",
                vec![
                    discovery("file:///m/Matrix.txt", None),
                    discovery("file:///m/Terminator.txt", None),
                ],
            ))
            .await;

        let events = log.snapshot().await;
        // Initial two updates, then the delta: Avatar removed first,
        // Terminator added after.
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[2],
            StreamableEvent::Removed { location } if location.as_str().ends_with("Avatar.txt")
        ));
        assert!(matches!(
            &events[3],
            StreamableEvent::Updated { streamable }
                if streamable.location.as_str().ends_with("Terminator.txt")
        ));
    }

    #[tokio::test]
    async fn orphan_discovery_is_dropped_until_parent_exists() {
        let (engine, log) = engine().await;
        engine
            .handle(&batch(
                "file:///s/Friends/",
                vec![discovery(
                    "file:///s/Friends/friends_1x01.txt",
                    Some("file:///s/Friends"),
                )],
            ))
            .await;
        assert_eq!(log.len().await, 0);

        engine
            .handle(&batch(
                "file:///s/",
                vec![discovery("file:///s/Friends", None)],
            ))
            .await;
        engine
            .handle(&batch(
                "file:///s/Friends/",
                vec![discovery(
                    "file:///s/Friends/friends_1x01.txt",
                    Some("file:///s/Friends"),
                )],
            ))
            .await;

        let cache = engine.cache_snapshot().await;
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn parent_in_same_batch_admits_child() {
        let (engine, _log) = engine().await;
        engine
            .handle(&batch(
                "file:///s/",
                vec![
                    discovery("file:///s/Friends", None),
                    discovery(
                        "file:///s/Friends/friends_1x01.txt",
                        Some("file:///s/Friends"),
                    ),
                ],
            ))
            .await;

        assert_eq!(engine.cache_snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn descendants_survive_parent_level_rescan() {
        let (engine, log) = engine().await;
        engine
            .handle(&batch(
                "file:///s/",
                vec![discovery("file:///s/Friends", None)],
            ))
            .await;
        engine
            .handle(&batch(
                "file:///s/Friends/",
                vec![discovery(
                    "file:///s/Friends/friends_1x01.txt",
                    Some("file:///s/Friends"),
                )],
            ))
            .await;
        // Rescan of the parent directory lists the series folder but not its
        // files; the episode must not be dropped.
        engine
            .handle(&batch(
                "file:///s/",
                vec![discovery("file:///s/Friends", None)],
            ))
            .await;

        assert_eq!(engine.cache_snapshot().await.len(), 2);
        assert!(!log
            .snapshot()
            .await
            .iter()
            .any(|e| matches!(e, StreamableEvent::Removed { .. })));

        // Rescanning the series folder itself clean removes the episode.
        engine.handle(&batch("file:///s/Friends/", vec![])).await;
        assert_eq!(engine.cache_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn rescan_outside_subtree_leaves_other_roots_alone() {
        let (engine, _log) = engine().await;
        engine
            .handle(&batch(
                "file:///m/",
                vec![discovery("file:///m/Avatar.txt", None)],
            ))
            .await;
        engine
            .handle(&batch(
                "file:///s/",
                vec![discovery("file:///s/Friends", None)],
            ))
            .await;
        engine.handle(&batch("file:///m/", vec![])).await;

        let cache = engine.cache_snapshot().await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache[0].location.as_str(), "file:///s/Friends");
    }

    #[tokio::test]
    async fn replay_reproduces_cache_content() {
        let (engine, log) = engine().await;
        engine
            .handle(&batch(
                "file:///m/",
                vec![
                    discovery("file:///m/Avatar.txt", None),
                    discovery("file:///m/Matrix.txt", None),
                ],
            ))
            .await;
        engine
            .handle(&batch(
                "file:///m/",
                vec![discovery("file:///m/Matrix.txt", None)],
            ))
            .await;

        let rebuilt = DiffEngine::rebuild(&log.snapshot().await);
        assert_eq!(rebuilt, engine.cache_snapshot().await);
    }

    #[tokio::test]
    async fn hydrated_engine_stays_idempotent_across_restarts() {
        let (engine, log) = engine().await;
        let event = batch(
            "file:///m/",
            vec![
                discovery("file:///m/Avatar.txt", None),
                discovery("file:///m/Matrix.txt", None),
            ],
        );
        engine.handle(&event).await;
        assert_eq!(log.len().await, 2);

        // A fresh engine over the same log sees the persisted state; the
        // same unchanged batch must diff to nothing.
        let index = Arc::new(DiscoveryIndex::new());
        let restarted = DiffEngine::with_backlog(log.clone(), index.clone()).await;
        assert_eq!(restarted.cache_snapshot().await, engine.cache_snapshot().await);
        restarted.handle(&event).await;
        assert_eq!(log.len().await, 2);
        assert!(index.get(&url("file:///m/Avatar.txt")).is_some());

        // Content that actually changed still diffs to a delta.
        restarted
            .handle(&batch(
                "file:///m/",
                vec![discovery("file:///m/Avatar.txt", None)],
            ))
            .await;
        let events = log.snapshot().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[2],
            StreamableEvent::Removed { location } if location.as_str().ends_with("Matrix.txt")
        ));
    }
}
