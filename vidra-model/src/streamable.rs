use std::collections::BTreeSet;

use url::Url;

use crate::discovery::Discovery;
use crate::ids::ContentFingerprint;
use crate::media_type::MediaType;
use crate::resource::MediaDetails;

/// A tracked discovered item plus its fingerprint and optional technical
/// descriptor. One entry exists per discovered location.
///
/// Media type, location, fingerprint and tags are required by construction;
/// the technical descriptor arrives later from background probing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Streamable {
    pub media_type: MediaType,
    pub location: Url,
    pub fingerprint: ContentFingerprint,
    pub parent_location: Option<Url>,
    pub tags: BTreeSet<String>,
    pub details: Option<MediaDetails>,
}

impl Streamable {
    pub fn new(
        media_type: MediaType,
        location: Url,
        fingerprint: ContentFingerprint,
        parent_location: Option<Url>,
        tags: BTreeSet<String>,
    ) -> Self {
        Self {
            media_type,
            location,
            fingerprint,
            parent_location,
            tags,
            details: None,
        }
    }

    /// Build a streamable from a discovery, attaching the batch tags.
    pub fn from_discovery(discovery: &Discovery, tags: &BTreeSet<String>) -> Self {
        Self::new(
            discovery.media_type,
            discovery.location.clone(),
            discovery.fingerprint.clone(),
            discovery.parent_location.clone(),
            tags.clone(),
        )
    }

    pub fn with_details(mut self, details: MediaDetails) -> Self {
        self.details = Some(details);
        self
    }
}

/// Persisted, ordered, replayable per-location lifecycle event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "type", rename_all = "snake_case")
)]
pub enum StreamableEvent {
    Updated { streamable: Streamable },
    Removed { location: Url },
}

impl StreamableEvent {
    pub fn location(&self) -> &Url {
        match self {
            StreamableEvent::Updated { streamable } => &streamable.location,
            StreamableEvent::Removed { location } => location,
        }
    }
}
