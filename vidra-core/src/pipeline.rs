//! Pipeline wiring and lifecycle.
//!
//! Owns every stage — discovery, diffing, identification, assembly,
//! probing — and the event logs between them. Construction wires the
//! stages together; `start` brings up the background tasks and `stop`
//! winds them down.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vidra_model::{
    IdentificationEvent, MediaType, ProviderRef, ResourceEvent, Streamable,
    StreamableEvent,
};

use crate::config::PipelineConfig;
use crate::discovery::{DiscoveryController, DiscoverySource};
use crate::error::Result;
use crate::events::{EventLog, EventStore};
use crate::identify::{IdentificationOrchestrator, IdentificationProvider};
use crate::probe::{MediaProber, ProbeResult, ProbeTaskManager};
use crate::resources::ResourceAssembler;
use crate::streamable::{DiffEngine, DiscoveryIndex};

/// Durable backing for the persisted event logs. Leave a slot empty to run
/// that log purely in memory.
#[derive(Default)]
pub struct PipelineStores {
    pub streamables: Option<Arc<dyn EventStore<StreamableEvent>>>,
    pub identifications: Option<Arc<dyn EventStore<IdentificationEvent>>>,
}

impl fmt::Debug for PipelineStores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStores")
            .field("streamables", &self.streamables.is_some())
            .field("identifications", &self.identifications.is_some())
            .finish()
    }
}

/// The assembled pipeline.
pub struct Pipeline {
    controller: Arc<DiscoveryController>,
    diff: Arc<DiffEngine>,
    orchestrator: Arc<IdentificationOrchestrator>,
    assembler: Arc<ResourceAssembler>,
    probes: Arc<ProbeTaskManager>,
    streamable_log: Arc<EventLog<StreamableEvent>>,
    identification_log: Arc<EventLog<IdentificationEvent>>,
    probe_results: StdMutex<Option<mpsc::Receiver<ProbeResult>>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").finish()
    }
}

impl Pipeline {
    pub async fn new(
        config: PipelineConfig,
        sources: Vec<DiscoverySource>,
        providers: HashMap<ProviderRef, Arc<dyn IdentificationProvider>>,
        prober: Arc<dyn MediaProber>,
        stores: PipelineStores,
    ) -> Result<Arc<Self>> {
        let index = Arc::new(DiscoveryIndex::new());
        let streamable_log = Arc::new(match stores.streamables {
            Some(store) => EventLog::with_store("streamables", store).await?,
            None => EventLog::new("streamables"),
        });
        let identification_log = Arc::new(match stores.identifications {
            Some(store) => EventLog::with_store("identifications", store).await?,
            None => EventLog::new("identifications"),
        });

        let controller = Arc::new(DiscoveryController::new(
            config.discovery.clone(),
            &config.events,
            sources,
        ));
        // Hydrating the diff engine from the persisted backlog keeps the
        // minimal-delta contract across restarts.
        let diff =
            Arc::new(DiffEngine::with_backlog(streamable_log.clone(), index.clone()).await);
        let orchestrator = Arc::new(
            IdentificationOrchestrator::new(
                config.refresh.clone(),
                providers.clone(),
                index.clone(),
                identification_log.clone(),
            )
            .await,
        );
        let assembler = Arc::new(ResourceAssembler::new(
            &config.events,
            providers,
            index.clone(),
        ));
        let (probes, probe_results) = ProbeTaskManager::new(&config.probe, prober);

        Ok(Arc::new(Self {
            controller,
            diff,
            orchestrator,
            assembler,
            probes: Arc::new(probes),
            streamable_log,
            identification_log,
            probe_results: StdMutex::new(Some(probe_results)),
            handles: StdMutex::new(Vec::new()),
        }))
    }

    /// Subscribe the stages to each other and start the background tasks.
    pub async fn start(self: &Arc<Self>) {
        let orchestrator = Arc::clone(&self.orchestrator);
        self.streamable_log
            .subscribe("identification", move |event: StreamableEvent| {
                let orchestrator = Arc::clone(&orchestrator);
                async move { orchestrator.handle(&event).await }
            })
            .await;

        let assembler = Arc::clone(&self.assembler);
        self.streamable_log
            .subscribe("assembly", move |event: StreamableEvent| {
                let assembler = Arc::clone(&assembler);
                async move { assembler.handle(&event).await }
            })
            .await;

        let probes = Arc::clone(&self.probes);
        self.streamable_log
            .subscribe("probing", move |event: StreamableEvent| {
                let probes = Arc::clone(&probes);
                async move {
                    match &event {
                        StreamableEvent::Updated { streamable } if is_playable(streamable) => {
                            probes.submit(&streamable.location);
                        }
                        StreamableEvent::Updated { .. } => {}
                        StreamableEvent::Removed { location } => probes.cancel(location),
                    }
                }
            })
            .await;

        let mut handles = Vec::new();

        // Discover events are live-only; the diff engine turns them into
        // the persisted streamable log.
        let mut discover_rx = self.controller.subscribe();
        let diff = Arc::clone(&self.diff);
        handles.push(tokio::spawn(async move {
            loop {
                match discover_rx.recv().await {
                    Ok(event) => diff.handle(&event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "diff engine lagged behind discover events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Completed probes flow back into the resource view.
        let probe_rx = self
            .probe_results
            .lock()
            .expect("probe receiver slot poisoned")
            .take();
        if let Some(mut probe_rx) = probe_rx {
            let assembler = Arc::clone(&self.assembler);
            handles.push(tokio::spawn(async move {
                while let Some(result) = probe_rx.recv().await {
                    assembler.apply_details(&result.location, result.details).await;
                }
            }));
        } else {
            warn!("pipeline already started");
        }

        handles.push(Arc::clone(&self.assembler).start());
        handles.push(Arc::clone(&self.controller).start());
        handles.push(Arc::clone(&self.orchestrator).start());

        self.handles
            .lock()
            .expect("pipeline handle list poisoned")
            .extend(handles);
        info!("pipeline started");
    }

    /// Wind down every background task.
    pub async fn stop(&self) {
        self.controller.stop().await;
        self.orchestrator.stop().await;
        self.assembler.stop().await;
        self.probes.stop();
        let handles = std::mem::take(
            &mut *self.handles.lock().expect("pipeline handle list poisoned"),
        );
        for handle in handles {
            handle.abort();
        }
        info!("pipeline stopped");
    }

    /// Run one discovery pass over every source, outside the periodic
    /// schedule.
    pub async fn run_scan_pass(&self) {
        self.controller.run_pass().await;
    }

    /// Wait until every subscriber of the persisted logs has caught up with
    /// everything appended so far.
    pub async fn join(&self) {
        self.streamable_log.join().await;
        self.identification_log.join().await;
    }

    pub fn subscribe_resources(&self) -> broadcast::Receiver<ResourceEvent> {
        self.assembler.subscribe()
    }

    pub fn assembler(&self) -> &Arc<ResourceAssembler> {
        &self.assembler
    }

    pub fn orchestrator(&self) -> &Arc<IdentificationOrchestrator> {
        &self.orchestrator
    }

    pub fn streamable_log(&self) -> &Arc<EventLog<StreamableEvent>> {
        &self.streamable_log
    }

    pub fn identification_log(&self) -> &Arc<EventLog<IdentificationEvent>> {
        &self.identification_log
    }
}

/// Only leaf media files carry probeable streams.
fn is_playable(streamable: &Streamable) -> bool {
    matches!(streamable.media_type, MediaType::Movie | MediaType::Episode)
}
