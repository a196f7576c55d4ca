use std::collections::{BTreeMap, BTreeSet};

use url::Url;
use uuid::Uuid;

use crate::error::Result;
use crate::ids::{ContentFingerprint, ProviderRef};
use crate::location::folder_form;
use crate::media_type::MediaType;

/// A single scanned item (file or folder) before identification.
///
/// Produced by external scanners; immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Discovery {
    pub media_type: MediaType,
    pub location: Url,
    /// Raw attributes the scanner extracted (title, size, timestamps, ...).
    pub attributes: BTreeMap<String, String>,
    pub parent_location: Option<Url>,
    pub fingerprint: ContentFingerprint,
}

/// One scan batch rooted at `base`: everything a discoverer reported for a
/// single directory in one pass.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoverEvent {
    pub correlation_id: Uuid,
    /// Scanned directory, normalized to folder form.
    pub base: Url,
    /// Provider discoveries in this batch should be identified with, if any.
    pub provider: Option<ProviderRef>,
    pub tags: BTreeSet<String>,
    pub parent_location: Option<Url>,
    pub discoveries: Vec<Discovery>,
}

impl DiscoverEvent {
    /// Build a discover event, normalizing `base` to folder form.
    pub fn new(
        base: &Url,
        provider: Option<ProviderRef>,
        tags: BTreeSet<String>,
        parent_location: Option<Url>,
        discoveries: Vec<Discovery>,
    ) -> Result<Self> {
        Ok(Self {
            correlation_id: Uuid::now_v7(),
            base: folder_form(base)?,
            provider,
            tags,
            parent_location,
            discoveries,
        })
    }
}
