//! Replication Node
//!
//! Wires the transaction logs, synchronizer and commit path of one node
//! around a shared event bus. Peer-to-peer events leave and enter the node
//! through that bus; a transport subscribes to them and converts them with
//! [`crate::protocol::Message`].

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::commit::{Committer, TableApplier};
use crate::config::WolfMeshConfig;
use crate::error::{Error, Result};
use crate::events::{Delivery, Event, EventBus};
use crate::jobs::JobScheduler;
use crate::router::Topology;
use crate::sync::Synchronizer;
use crate::trlog::{Operation, Position, TrLog, TrLogs};

/// One replication node
pub struct Node {
    config: WolfMeshConfig,
    bus: Arc<EventBus>,
    jobs: Arc<JobScheduler>,
    trlogs: Arc<TrLogs>,
    synchronizer: Arc<Synchronizer>,
    committer: Arc<Committer>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Open every component of the node. Must run inside a tokio runtime.
    pub fn open(config: WolfMeshConfig, applier: Arc<dyn TableApplier>) -> Result<Self> {
        config.validate()?;

        let local = config.node.id;
        let bus = Arc::new(EventBus::new());
        let jobs = Arc::new(JobScheduler::new()?);

        let trlogs = match TrLogs::open(config.trlog_dir(), Arc::clone(&bus)) {
            Ok(trlogs) => Arc::new(trlogs),
            Err(e) => {
                tracing::error!("Failed to open transaction logs in {:?}: {}", config.trlog_dir(), e);
                return Err(e);
            }
        };

        let synchronizer = Arc::new(Synchronizer::new(
            local,
            Arc::clone(&trlogs),
            Arc::clone(&bus),
            Arc::clone(&jobs),
            config.sync.clone(),
        ));
        synchronizer.register(&bus);

        let committer = Committer::new(
            local,
            Arc::clone(&trlogs),
            Arc::clone(&bus),
            Arc::clone(&jobs),
            applier,
            config.sync.apply_batch_size,
        );
        committer.register(&bus);

        let dispatcher = bus.start()?;

        // resume applying what was committed before a restart
        for id in trlogs.ids() {
            if let Some(log) = trlogs.get(&id) {
                if log.applied() < log.top() {
                    committer.schedule_apply(id);
                }
            }
        }

        tracing::info!(
            "Node {} opened with {} transaction logs",
            local,
            trlogs.ids().len()
        );

        Ok(Self {
            config,
            bus,
            jobs,
            trlogs,
            synchronizer,
            committer,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.config.node.id
    }

    pub fn config(&self) -> &WolfMeshConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn trlogs(&self) -> &Arc<TrLogs> {
        &self.trlogs
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    pub fn committer(&self) -> &Arc<Committer> {
        &self.committer
    }

    pub fn trlog(&self, id: &Uuid) -> Option<Arc<TrLog>> {
        self.trlogs.get(id)
    }

    /// Hand a new topology snapshot to the synchronizer
    pub fn publish_topology(&self, topology: Topology) -> Result<()> {
        topology.validate()?;
        self.bus
            .publish(Event::Topology(Arc::new(topology)), Delivery::Queued)
    }

    /// Append a locally-originated operation to a log
    pub fn write(&self, trlog: Uuid, op: &Operation) -> Result<Position> {
        if self.bus.is_closed() {
            return Err(Error::ShuttingDown);
        }
        self.trlogs.get_or_open(trlog)?.add_with_new_ids(op)
    }

    /// Stop synchronization, drain jobs and close the bus.
    ///
    /// Returns `false` if jobs were still running when the timeout elapsed.
    pub async fn shutdown(&self) -> bool {
        let timeout = self.config.sync.shutdown_timeout();
        tracing::info!("Shutting down node {}", self.id());

        let synced = self.synchronizer.shutdown(timeout).await;
        let idle = self.jobs.wait_idle(timeout).await;
        if !idle {
            tracing::warn!("{} jobs still running at shutdown", self.jobs.active());
        }

        self.bus.close();
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                tracing::warn!("Event dispatcher ended abnormally: {}", e);
            }
        }

        synced && idle
    }
}
