//! Per-Peer Synchronizer
//!
//! Owns the log synchronizers for one peer, created lazily per log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use super::log::LogSyncer;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::jobs::JobScheduler;
use crate::trlog::TrLogs;

type LogMap = HashMap<Uuid, Arc<LogSyncer>>;

/// Synchronization state towards one peer
pub struct PeerSyncer {
    local: Uuid,
    peer: Uuid,
    trlogs: Arc<TrLogs>,
    bus: Arc<EventBus>,
    jobs: Arc<JobScheduler>,
    batch_size: u64,
    logs: Mutex<LogMap>,
    cancelled: AtomicBool,
}

impl PeerSyncer {
    pub fn new(
        local: Uuid,
        peer: Uuid,
        trlogs: Arc<TrLogs>,
        bus: Arc<EventBus>,
        jobs: Arc<JobScheduler>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            local,
            peer,
            trlogs,
            bus,
            jobs,
            batch_size: config.batch_size,
            logs: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> Uuid {
        self.peer
    }

    /// Get the synchronizer of a log, creating it if needed.
    ///
    /// The flag is `true` when the synchronizer was created by this call.
    pub fn ensure_log(&self, trlog: Uuid) -> Result<(Arc<LogSyncer>, bool)> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }

        if let Some(syncer) = self.lock().get(&trlog) {
            return Ok((Arc::clone(syncer), false));
        }

        // may create storage; not under our lock
        let log = self.trlogs.get_or_open(trlog)?;

        let mut logs = self.lock();
        // cancel() may have drained the map while the log was opening
        if self.cancelled.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        if let Some(syncer) = logs.get(&trlog) {
            return Ok((Arc::clone(syncer), false));
        }

        let syncer = LogSyncer::new(
            self.local,
            self.peer,
            log,
            Arc::clone(&self.bus),
            Arc::clone(&self.jobs),
            self.batch_size,
        );
        logs.insert(trlog, Arc::clone(&syncer));
        tracing::debug!("Tracking trlog {} for peer {}", trlog, self.peer);

        Ok((syncer, true))
    }

    /// Existing synchronizer of a log
    pub fn get(&self, trlog: &Uuid) -> Option<Arc<LogSyncer>> {
        self.lock().get(trlog).cloned()
    }

    /// All log synchronizers of this peer
    pub fn logs(&self) -> Vec<Arc<LogSyncer>> {
        self.lock().values().cloned().collect()
    }

    /// Transfer jobs in flight across all logs
    pub fn active_jobs(&self) -> u32 {
        self.lock().values().map(|s| s.active_jobs()).sum()
    }

    /// Cancel every log synchronizer and release them. No synchronizer is
    /// created afterwards.
    ///
    /// Returns the released synchronizers so the caller can wait for their
    /// jobs to drain.
    pub fn cancel(&self) -> Vec<Arc<LogSyncer>> {
        let released: Vec<Arc<LogSyncer>> = {
            let mut logs = self.lock();
            self.cancelled.store(true, Ordering::Release);
            logs.drain().map(|(_, s)| s).collect()
        };
        for syncer in &released {
            syncer.cancel();
        }

        tracing::debug!(
            "Released {} log synchronizers of peer {}",
            released.len(),
            self.peer
        );
        released
    }

    fn lock(&self) -> MutexGuard<'_, LogMap> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
