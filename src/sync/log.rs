//! Per-Log Synchronizer
//!
//! State machine for one (local node, peer, log) triple. A local change
//! sends one sync request to the peer; the peer's reply with its top
//! position drives the scheduling of bounded, non-overlapping transfer
//! batches.
//!
//! ```text
//! Idle --start()--> Requesting --on_remote_state()--> Scheduling --> Idle
//!                   (extra start() calls are absorbed by `requests`)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::events::{Delivery, Event, EventBus, TrlogData, TrlogSync};
use crate::jobs::JobScheduler;
use crate::trlog::{Position, TrLog};

/// Per-log synchronizer
pub struct LogSyncer {
    local: Uuid,
    peer: Uuid,
    trlog: Arc<TrLog>,
    bus: Arc<EventBus>,
    jobs: Arc<JobScheduler>,
    /// Maximum positions per transfer batch
    batch_size: u64,
    /// Highest position already scheduled for transfer
    synced: AtomicU64,
    /// Triggers received since the last completed scheduling round
    requests: AtomicU32,
    /// Transfer jobs in flight
    active_jobs: AtomicU32,
    cancelled: AtomicBool,
}

/// Retained reference held by a transfer job
struct TransferJob {
    syncer: Arc<LogSyncer>,
}

impl Drop for TransferJob {
    fn drop(&mut self) {
        self.syncer.active_jobs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl LogSyncer {
    pub fn new(
        local: Uuid,
        peer: Uuid,
        trlog: Arc<TrLog>,
        bus: Arc<EventBus>,
        jobs: Arc<JobScheduler>,
        batch_size: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            peer,
            trlog,
            bus,
            jobs,
            batch_size: batch_size.max(1),
            synced: AtomicU64::new(0),
            requests: AtomicU32::new(0),
            active_jobs: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> Uuid {
        self.peer
    }

    pub fn trlog_id(&self) -> Uuid {
        self.trlog.id()
    }

    pub fn synced(&self) -> Position {
        self.synced.load(Ordering::Acquire)
    }

    pub fn pending_requests(&self) -> u32 {
        self.requests.load(Ordering::Acquire)
    }

    pub fn active_jobs(&self) -> u32 {
        self.active_jobs.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Local log changed
    pub fn on_log_changed(&self, trlog: &Uuid) {
        if *trlog == self.trlog.id() {
            self.start();
        }
    }

    /// Ask the peer for its top position, unless a request is outstanding
    pub fn start(&self) {
        if self.is_cancelled() {
            return;
        }

        // nothing to offer
        if self.trlog.top() == 0 {
            return;
        }

        if self.requests.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        tracing::debug!(
            "Requesting state of trlog {} from peer {}",
            self.trlog.id(),
            self.peer
        );

        let request = Event::TrlogSync(TrlogSync {
            trlog: self.trlog.id(),
            from: self.local,
            to: self.peer,
        });

        if let Err(e) = self.bus.publish(request, Delivery::Immediate) {
            // no request in flight: the next change retries
            self.requests.store(0, Ordering::Release);
            tracing::warn!(
                "Sync request for trlog {} to peer {} failed: {}",
                self.trlog.id(),
                self.peer,
                e
            );
        }
    }

    /// Peer reported its top position; schedule the missing range
    pub fn on_remote_state(self: &Arc<Self>, remote_top: Position) {
        if self.is_cancelled() {
            return;
        }

        loop {
            let requests = self.requests.load(Ordering::Acquire);

            self.synced.fetch_max(remote_top, Ordering::AcqRel);

            loop {
                let synced = self.synced.load(Ordering::Acquire);
                let top = self.trlog.top();
                if synced >= top {
                    break;
                }

                let batch_end = top.min(synced.saturating_add(self.batch_size));
                if self
                    .synced
                    .compare_exchange(synced, batch_end, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.schedule_transfer(synced, batch_end);
                }
            }

            // a trigger that arrived meanwhile costs one more round
            if self
                .requests
                .compare_exchange(requests, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Stop scheduling; in-flight jobs finish as no-ops
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                "Cancelled synchronizer for trlog {} to peer {}",
                self.trlog.id(),
                self.peer
            );
        }
    }

    fn schedule_transfer(self: &Arc<Self>, from: Position, to: Position) {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
        let job = TransferJob {
            syncer: Arc::clone(self),
        };

        tracing::trace!(
            "Scheduling trlog {} range [{}, {}) to peer {}",
            self.trlog.id(),
            from,
            to,
            self.peer
        );

        self.jobs.spawn(move || job.syncer.transfer(from, to));
    }

    fn transfer(&self, from: Position, to: Position) {
        if self.is_cancelled() {
            return;
        }

        let entries = match self.trlog.range_read(from, to) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    "Dropping trlog {} batch [{}, {}) for peer {}: {}",
                    self.trlog.id(),
                    from,
                    to,
                    self.peer,
                    e
                );
                return;
            }
        };

        if entries.is_empty() {
            return;
        }

        let data = Event::TrlogData(TrlogData {
            trlog: self.trlog.id(),
            from: self.local,
            to: self.peer,
            entries,
        });

        if let Err(e) = self.bus.publish(data, Delivery::Immediate) {
            tracing::warn!(
                "Dropping trlog {} batch [{}, {}) for peer {}: {}",
                self.trlog.id(),
                from,
                to,
                self.peer,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::error::{Error, Result};
    use crate::events::{EventHandler, EventKind};
    use crate::trlog::{Operation, TrLogEntry};

    /// Stands in for the transport: records outbound messages
    #[derive(Default)]
    struct Wire {
        syncs: Mutex<Vec<TrlogSync>>,
        batches: Mutex<Vec<(Position, Position)>>,
        unreachable: AtomicBool,
    }

    impl EventHandler for Wire {
        fn on_event(&self, event: &Event) -> Result<()> {
            match event {
                Event::TrlogSync(m) => {
                    if self.unreachable.load(Ordering::SeqCst) {
                        return Err(Error::PeerUnreachable(m.to));
                    }
                    self.syncs.lock().unwrap().push(m.clone());
                }
                Event::TrlogData(m) => {
                    let first = m.entries.first().map(|e| e.pos).unwrap_or_default();
                    let last = m.entries.last().map(|e| e.pos + 1).unwrap_or_default();
                    self.batches.lock().unwrap().push((first, last));
                }
                _ => {}
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        trlog: Arc<TrLog>,
        jobs: Arc<JobScheduler>,
        wire: Arc<Wire>,
        syncer: Arc<LogSyncer>,
    }

    fn fixture(batch_size: u64) -> Fixture {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let wire = Arc::new(Wire::default());
        bus.subscribe(EventKind::TrlogSync, wire.clone());
        bus.subscribe(EventKind::TrlogData, wire.clone());

        let trlog =
            Arc::new(TrLog::open(&dir.path().join("log.db"), Uuid::new_v4(), bus.clone()).unwrap());
        let jobs = Arc::new(JobScheduler::new().unwrap());
        let syncer = LogSyncer::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            trlog.clone(),
            bus,
            jobs.clone(),
            batch_size,
        );

        Fixture { _dir: dir, trlog, jobs, wire, syncer }
    }

    fn fill(trlog: &TrLog, n: u64) {
        let entries: Vec<TrLogEntry> = (0..n)
            .map(|p| TrLogEntry::new(p, Operation::insert(Uuid::nil(), p.to_le_bytes().to_vec())))
            .collect();
        trlog.add(&entries).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_log_sends_nothing() {
        let f = fixture(10);
        f.syncer.start();
        assert!(f.wire.syncs.lock().unwrap().is_empty());
        assert_eq!(f.syncer.pending_requests(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_requests_are_coalesced() {
        let f = fixture(10);
        fill(&f.trlog, 5);

        for _ in 0..10 {
            f.syncer.start();
        }
        assert_eq!(f.wire.syncs.lock().unwrap().len(), 1);
        assert_eq!(f.syncer.pending_requests(), 10);

        f.syncer.on_remote_state(5);
        assert_eq!(f.syncer.pending_requests(), 0);

        // idle again: next trigger sends a fresh request
        f.syncer.on_log_changed(&f.trlog.id());
        assert_eq!(f.wire.syncs.lock().unwrap().len(), 2);

        // unrelated log is ignored
        f.syncer.on_log_changed(&Uuid::new_v4());
        assert_eq!(f.syncer.pending_requests(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_request_is_rolled_back() {
        let f = fixture(10);
        fill(&f.trlog, 5);

        f.wire.unreachable.store(true, Ordering::SeqCst);
        f.syncer.start();
        assert_eq!(f.syncer.pending_requests(), 0);

        f.wire.unreachable.store(false, Ordering::SeqCst);
        f.syncer.start();
        assert_eq!(f.wire.syncs.lock().unwrap().len(), 1);
        assert_eq!(f.syncer.pending_requests(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batches_start_at_remote_top() {
        let f = fixture(25);
        fill(&f.trlog, 100);

        f.syncer.start();
        f.syncer.on_remote_state(40);
        assert!(f.jobs.wait_idle(Duration::from_secs(5)).await);

        let mut batches = f.wire.batches.lock().unwrap().clone();
        batches.sort_unstable();
        assert_eq!(batches, vec![(40, 65), (65, 90), (90, 100)]);
        assert_eq!(f.syncer.synced(), 100);
        assert_eq!(f.syncer.active_jobs(), 0);

        // stale reply schedules nothing new
        f.syncer.on_remote_state(10);
        assert!(f.jobs.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(f.wire.batches.lock().unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scheduling_never_overlaps() {
        let f = fixture(16);
        fill(&f.trlog, 200);

        std::thread::scope(|s| {
            for t in 0..4 {
                let syncer = &f.syncer;
                let trlog = &f.trlog;
                s.spawn(move || {
                    for i in 0..50 {
                        if t == 0 {
                            trlog
                                .add_with_new_ids(&Operation::insert(Uuid::nil(), vec![i as u8]))
                                .unwrap();
                        }
                        if i % 3 == 0 {
                            syncer.start();
                        }
                        syncer.on_remote_state(0);
                    }
                });
            }
        });
        f.syncer.on_remote_state(0);
        assert!(f.jobs.wait_idle(Duration::from_secs(10)).await);

        let mut batches = f.wire.batches.lock().unwrap().clone();
        batches.sort_unstable();

        // disjoint, contiguous from 0, no repeats, each within the batch bound
        let mut expected_start = 0;
        for (from, to) in &batches {
            assert_eq!(*from, expected_start);
            assert!(to > from && to - from <= 16);
            expected_start = *to;
        }
        assert_eq!(expected_start, f.syncer.synced());
        assert_eq!(f.syncer.synced(), f.trlog.top());
        assert_eq!(f.trlog.top(), 250);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_syncer_is_inert() {
        let f = fixture(10);
        fill(&f.trlog, 30);

        f.syncer.cancel();
        f.syncer.start();
        f.syncer.on_remote_state(0);
        assert!(f.jobs.wait_idle(Duration::from_secs(5)).await);

        assert!(f.wire.syncs.lock().unwrap().is_empty());
        assert!(f.wire.batches.lock().unwrap().is_empty());
        assert_eq!(f.syncer.synced(), 0);
    }
}
