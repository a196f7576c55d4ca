use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::identification::Identification;
use crate::ids::ContentId;
use crate::media_type::MediaType;

/// A single video track extracted from the container.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VideoTrack {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub framerate: Option<f32>,
}

/// A single audio track extracted from the container.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AudioTrack {
    pub codec: String,
    pub channels: u16,
    pub language: Option<String>,
}

/// Track layout of a probed media file.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaStructure {
    pub video_tracks: Vec<VideoTrack>,
    pub audio_tracks: Vec<AudioTrack>,
}

/// Preview frame captured at a position in the stream.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Snapshot {
    pub position: Duration,
    pub uri: Url,
}

/// Technical metadata produced by background probing.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaDetails {
    pub duration: Option<Duration>,
    pub structure: Option<MediaStructure>,
    pub snapshots: Vec<Snapshot>,
}

/// The externally visible aggregate for one location: streamable state,
/// best-known identification, and extracted technical metadata merged into
/// one queryable view.
///
/// A resource exists iff its streamable exists, and always carries an
/// identification (minimal fallback when nothing richer is available).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resource {
    pub location: Url,
    pub parent_location: Option<Url>,
    pub media_type: MediaType,
    pub content_id: ContentId,
    pub last_modification_time: DateTime<Utc>,
    pub size: Option<u64>,
    pub discovery_time: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub duration: Option<Duration>,
    pub media_structure: Option<MediaStructure>,
    pub snapshots: Vec<Snapshot>,
    pub attributes: BTreeMap<String, String>,
    pub identification: Identification,
}

/// Change notification for the resource view.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "type", rename_all = "snake_case")
)]
pub enum ResourceEvent {
    Updated { resource: Resource },
    Removed { location: Url },
}

impl ResourceEvent {
    pub fn location(&self) -> &Url {
        match self {
            ResourceEvent::Updated { resource } => &resource.location,
            ResourceEvent::Removed { location } => location,
        }
    }
}
