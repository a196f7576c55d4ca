use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use url::Url;

use crate::ids::WorkId;

/// Descriptor of a work as known to an external metadata catalog.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkDescriptor {
    pub id: WorkId,
    pub title: String,
    pub attributes: BTreeMap<String, String>,
}

/// How an identification was matched to its source item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MatchType {
    /// Matched on a provider-native identifier embedded in the source.
    Id,
    /// Matched by name lookup against the catalog.
    Name,
    /// Derived from the parent item's identification.
    Derived,
    /// Synthesized locally from raw attributes alone.
    Minimal,
}

/// Match confidence record attached to every identification.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Match {
    pub match_type: MatchType,
    /// Accuracy in the range 0.0..=1.0.
    pub accuracy: f32,
    pub creation_time: DateTime<Utc>,
}

/// Result of matching a streamable to external metadata.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Identification {
    pub descriptors: Vec<WorkDescriptor>,
    pub work_match: Match,
}

impl Identification {
    /// Primary descriptor, when the provider returned at least one.
    pub fn primary(&self) -> Option<&WorkDescriptor> {
        self.descriptors.first()
    }
}

/// Persisted per-location identification record. Only top-level items are
/// persisted this way; component identifications are recomputed from the
/// persisted parent.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdentificationEvent {
    pub location: Url,
    pub identification: Identification,
}
