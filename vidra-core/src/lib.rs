//! # Vidra Core
//!
//! The event-sourced media pipeline behind vidra: pluggable scanners feed
//! discovery batches in, and a consistent, queryable resource view comes
//! out the other end.
//!
//! ## Overview
//!
//! Data flows one way through the stages:
//!
//! - [`discovery`]: periodically runs every configured scanner and publishes
//!   one [`DiscoverEvent`](vidra_model::DiscoverEvent) batch per directory
//! - [`streamable`]: diffs each batch against the known subtree and persists
//!   the minimal add/update/remove delta as streamable events
//! - [`identify`]: matches items against metadata providers, with
//!   parent-before-child ordering and a background re-identification
//!   scheduler
//! - [`resources`]: merges streamables, identifications and probed technical
//!   metadata into the authoritative [`Resource`](vidra_model::Resource)
//!   aggregate
//! - [`probe`]: bounded-concurrency technical metadata extraction
//! - [`descriptors`]: LRU-cached descriptor lookups against the remote
//!   catalog
//!
//! The stages communicate through the [`events::EventLog`] substrate:
//! append-only, replayable, with named subscribers and a catch-up barrier.
//! [`pipeline::Pipeline`] wires everything together and owns the lifecycle.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod config;
pub mod descriptors;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identify;
pub mod pipeline;
pub mod probe;
pub mod resources;
pub mod streamable;

pub use config::PipelineConfig;
pub use descriptors::{CacheMode, DescriptorCache, QueryService};
pub use discovery::{DiscoveryController, DiscoverySink, Discoverer, DiscoverySource};
pub use error::{PipelineError, Result};
pub use events::{EventLog, EventStore};
pub use identify::{IdentificationOrchestrator, IdentificationProvider, MinimalProvider};
pub use pipeline::{Pipeline, PipelineStores};
pub use probe::{MediaProber, ProbeResult, ProbeTaskManager};
pub use resources::ResourceAssembler;
pub use streamable::{DiffEngine, DiscoveryIndex, path_cmp};
