//! Synchronization Module
//!
//! Node-level synchronizer. Keeps one [`PeerSyncer`] per peer of the
//! current route set, and routes sync traffic to the matching
//! [`LogSyncer`].

mod log;
mod peer;

pub use log::LogSyncer;
pub use peer::PeerSyncer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{
    Delivery, Event, EventBus, EventHandler, EventKind, TrlogState, TrlogSync,
};
use crate::jobs::JobScheduler;
use crate::router::{compute_routes, Topology};
use crate::trlog::TrLogs;

/// Poll interval while waiting for transfer jobs to drain
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Outcome of a topology reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    /// Peers that entered the route set
    pub added: Vec<Uuid>,
    /// Peers that left the route set
    pub removed: Vec<Uuid>,
    /// Log synchronizers created (on new and existing peers)
    pub logs_created: usize,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.logs_created == 0
    }
}

struct Peers {
    active: HashMap<Uuid, Arc<PeerSyncer>>,
    /// Cancelled log synchronizers that may still have jobs in flight
    retired: Vec<Arc<LogSyncer>>,
}

/// Node-level synchronizer
pub struct Synchronizer {
    local: Uuid,
    trlogs: Arc<TrLogs>,
    bus: Arc<EventBus>,
    jobs: Arc<JobScheduler>,
    config: SyncConfig,
    peers: Mutex<Peers>,
}

impl Synchronizer {
    pub fn new(
        local: Uuid,
        trlogs: Arc<TrLogs>,
        bus: Arc<EventBus>,
        jobs: Arc<JobScheduler>,
        config: SyncConfig,
    ) -> Self {
        Self {
            local,
            trlogs,
            bus,
            jobs,
            config,
            peers: Mutex::new(Peers {
                active: HashMap::new(),
                retired: Vec::new(),
            }),
        }
    }

    /// Subscribe to the events the synchronizer reacts to
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        for kind in [
            EventKind::Topology,
            EventKind::TrlogChanged,
            EventKind::TrlogSync,
            EventKind::TrlogState,
        ] {
            bus.subscribe(kind, Arc::clone(self) as Arc<dyn EventHandler>);
        }
    }

    pub fn local(&self) -> Uuid {
        self.local
    }

    /// Reconcile the peer set with a new topology.
    ///
    /// On a router error the current peer set is kept.
    pub fn on_topology_changed(&self, topology: &Topology) -> Result<RouteDiff> {
        let routes = compute_routes(topology, &self.local)?;
        let known_logs = self.trlogs.ids();

        let mut diff = RouteDiff::default();
        let mut created = Vec::new();
        {
            let mut peers = self.lock();

            let gone: Vec<Uuid> = peers
                .active
                .keys()
                .filter(|uuid| !routes.contains(*uuid))
                .copied()
                .collect();
            for uuid in gone {
                if let Some(peer) = peers.active.remove(&uuid) {
                    let released = peer.cancel();
                    peers.retired.extend(released);
                    diff.removed.push(uuid);
                }
            }
            peers.retired.retain(|s| s.active_jobs() > 0);

            for uuid in &routes {
                if !peers.active.contains_key(uuid) {
                    let peer = PeerSyncer::new(
                        self.local,
                        *uuid,
                        Arc::clone(&self.trlogs),
                        Arc::clone(&self.bus),
                        Arc::clone(&self.jobs),
                        &self.config,
                    );
                    peers.active.insert(*uuid, Arc::new(peer));
                    diff.added.push(*uuid);
                }
            }

            // known logs are already open, this is a map lookup per log
            for peer in peers.active.values() {
                for trlog in &known_logs {
                    match peer.ensure_log(*trlog) {
                        Ok((syncer, true)) => created.push(syncer),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(
                            "Cannot track trlog {} for peer {}: {}",
                            trlog,
                            peer.peer(),
                            e
                        ),
                    }
                }
            }
        }
        diff.removed.sort_unstable();
        diff.logs_created = created.len();

        if !diff.is_empty() {
            tracing::info!(
                "Routes updated: {} peers ({} added, {} removed), {} log synchronizers created",
                routes.len(),
                diff.added.len(),
                diff.removed.len(),
                diff.logs_created
            );
        }

        // publishes; outside the peer lock
        for syncer in created {
            syncer.start();
        }

        Ok(diff)
    }

    /// Current peers, sorted
    pub fn peers(&self) -> Vec<Uuid> {
        let mut peers: Vec<Uuid> = self.lock().active.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    pub fn peer(&self, uuid: &Uuid) -> Option<Arc<PeerSyncer>> {
        self.lock().active.get(uuid).cloned()
    }

    /// Active (peer, log) pairs, sorted
    pub fn active(&self) -> Vec<(Uuid, Uuid)> {
        let mut pairs: Vec<(Uuid, Uuid)> = self
            .snapshot()
            .iter()
            .flat_map(|peer| {
                peer.logs()
                    .into_iter()
                    .map(move |syncer| (peer.peer(), syncer.trlog_id()))
            })
            .collect();
        pairs.sort_unstable();
        pairs
    }

    /// Transfer jobs in flight, retired synchronizers included
    pub fn active_jobs(&self) -> u32 {
        let peers = self.lock();
        let active: u32 = peers.active.values().map(|p| p.active_jobs()).sum();
        let retired: u32 = peers.retired.iter().map(|s| s.active_jobs()).sum();
        active + retired
    }

    /// Cancel every peer and wait for in-flight transfer jobs.
    ///
    /// Returns `false` if jobs were still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let mut pending: Vec<Arc<LogSyncer>> = {
            let mut peers = self.lock();
            let mut pending = std::mem::take(&mut peers.retired);
            for (_, peer) in peers.active.drain() {
                pending.extend(peer.cancel());
            }
            pending
        };

        let deadline = Instant::now() + timeout;
        loop {
            pending.retain(|s| s.active_jobs() > 0);
            if pending.is_empty() {
                tracing::debug!("Synchronizer stopped");
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Synchronizer shutdown timed out with {} log synchronizers busy",
                    pending.len()
                );
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Answer a peer's sync request with our top position
    fn on_sync_request(&self, request: &TrlogSync) -> Result<()> {
        let trlog = self.trlogs.get_or_open(request.trlog)?;

        let reply = Event::TrlogState(TrlogState {
            trlog: request.trlog,
            from: self.local,
            to: request.from,
            top: trlog.top(),
        });
        self.bus.publish(reply, Delivery::Immediate)
    }

    fn on_state(&self, state: &TrlogState) -> Result<()> {
        let peer = match self.peer(&state.from) {
            Some(peer) => peer,
            None => {
                tracing::debug!(
                    "Ignoring trlog {} state from {}: not a route",
                    state.trlog,
                    state.from
                );
                return Ok(());
            }
        };

        let (syncer, _) = peer.ensure_log(state.trlog)?;
        syncer.on_remote_state(state.top);
        Ok(())
    }

    fn on_log_changed(&self, trlog: &Uuid) {
        for peer in self.snapshot() {
            match peer.ensure_log(*trlog) {
                Ok((syncer, _)) => syncer.on_log_changed(trlog),
                // peer removed concurrently
                Err(e) => tracing::debug!(
                    "Skipping trlog {} for peer {}: {}",
                    trlog,
                    peer.peer(),
                    e
                ),
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<PeerSyncer>> {
        self.lock().active.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Peers> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventHandler for Synchronizer {
    fn on_event(&self, event: &Event) -> Result<()> {
        match event {
            Event::Topology(topology) => {
                if let Err(e) = self.on_topology_changed(topology) {
                    tracing::warn!("Keeping current routes, topology rejected: {}", e);
                }
                Ok(())
            }
            Event::TrlogChanged { trlog } => {
                self.on_log_changed(trlog);
                Ok(())
            }
            Event::TrlogSync(request) if request.to == self.local => self.on_sync_request(request),
            Event::TrlogState(state) if state.to == self.local => self.on_state(state),
            _ => Ok(()),
        }
    }
}
