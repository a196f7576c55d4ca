//! Core data model definitions shared across vidra crates.
#![allow(missing_docs)]

pub mod discovery;
pub mod error;
pub mod identification;
pub mod ids;
pub mod location;
pub mod media_type;
pub mod resource;
pub mod streamable;

pub use discovery::{DiscoverEvent, Discovery};
pub use error::{ModelError, Result as ModelResult};
pub use identification::{
    Identification, IdentificationEvent, Match, MatchType, WorkDescriptor,
};
pub use ids::{ContentFingerprint, ContentId, ProviderRef, WorkId};
pub use location::folder_form;
pub use media_type::MediaType;
pub use resource::{
    AudioTrack, MediaDetails, MediaStructure, Resource, ResourceEvent,
    Snapshot, VideoTrack,
};
pub use streamable::{Streamable, StreamableEvent};
