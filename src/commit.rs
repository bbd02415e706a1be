//! Data-Commit Path
//!
//! Appends incoming transfer batches to the local logs and answers the
//! sender with the new top position. Also runs the apply workers that
//! feed committed entries to local table state, one worker per log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::error::Result;
use crate::events::{Delivery, Event, EventBus, EventHandler, EventKind, TrlogData, TrlogState};
use crate::jobs::JobScheduler;
use crate::trlog::{TrLogEntry, TrLogs};

/// Applies committed log entries to local table state
pub trait TableApplier: Send + Sync {
    /// Apply one entry. An error stops the apply round; the entry is
    /// retried on the next change of the log.
    fn apply(&self, trlog: &Uuid, entry: &TrLogEntry) -> Result<()>;
}

/// Applier that only logs what it sees
pub struct TraceApplier;

impl TableApplier for TraceApplier {
    fn apply(&self, trlog: &Uuid, entry: &TrLogEntry) -> Result<()> {
        tracing::trace!(
            "trlog {}: apply {:?} on table {} at position {} ({} bytes)",
            trlog,
            entry.op.kind,
            entry.op.table,
            entry.pos,
            entry.op.payload.len()
        );
        Ok(())
    }
}

/// Serializes apply rounds of one log
#[derive(Default)]
struct ApplyWorker {
    running: AtomicBool,
    pending: AtomicBool,
}

/// Commits transfer batches and drives apply workers
pub struct Committer {
    local: Uuid,
    trlogs: Arc<TrLogs>,
    bus: Arc<EventBus>,
    jobs: Arc<JobScheduler>,
    applier: Arc<dyn TableApplier>,
    apply_batch_size: usize,
    workers: Mutex<HashMap<Uuid, Arc<ApplyWorker>>>,
    /// Handle given to jobs
    me: Weak<Committer>,
}

impl Committer {
    pub fn new(
        local: Uuid,
        trlogs: Arc<TrLogs>,
        bus: Arc<EventBus>,
        jobs: Arc<JobScheduler>,
        applier: Arc<dyn TableApplier>,
        apply_batch_size: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            local,
            trlogs,
            bus,
            jobs,
            applier,
            apply_batch_size: apply_batch_size.max(1),
            workers: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Subscribe to incoming batches and local log changes
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        bus.subscribe(EventKind::TrlogData, Arc::clone(self) as Arc<dyn EventHandler>);
        bus.subscribe(EventKind::TrlogChanged, Arc::clone(self) as Arc<dyn EventHandler>);
    }

    /// Append a batch and reply with the new top
    pub fn commit(&self, data: &TrlogData) -> Result<usize> {
        let trlog = self.trlogs.get_or_open(data.trlog)?;
        let added = trlog.add(&data.entries)?;

        tracing::trace!(
            "trlog {}: committed {} of {} entries from {}, top={}",
            data.trlog,
            added,
            data.entries.len(),
            data.from,
            trlog.top()
        );

        let reply = Event::TrlogState(TrlogState {
            trlog: data.trlog,
            from: self.local,
            to: data.from,
            top: trlog.top(),
        });
        self.bus.publish(reply, Delivery::Immediate)?;

        Ok(added)
    }

    /// Make sure an apply round runs for `trlog` after this call
    pub fn schedule_apply(&self, trlog: Uuid) {
        let worker = self.worker(trlog);
        worker.pending.store(true, Ordering::Release);
        if worker.running.swap(true, Ordering::AcqRel) {
            // the running round picks up the pending flag
            return;
        }

        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        self.jobs.spawn(move || me.run_apply(trlog, &worker));
    }

    fn run_apply(&self, id: Uuid, worker: &ApplyWorker) {
        loop {
            worker.pending.store(false, Ordering::Release);

            if let Some(trlog) = self.trlogs.get(&id) {
                loop {
                    match trlog.apply(self.apply_batch_size, |entry| self.applier.apply(&id, entry)) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!("trlog {}: apply round failed: {}", id, e);
                            break;
                        }
                    }
                }
            }

            worker.running.store(false, Ordering::Release);

            // a change that raced with the round end gets another round
            if !worker.pending.load(Ordering::Acquire)
                || worker.running.swap(true, Ordering::AcqRel)
            {
                break;
            }
        }
    }

    fn worker(&self, trlog: Uuid) -> Arc<ApplyWorker> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(workers.entry(trlog).or_default())
    }

    fn spawn_commit(&self, data: TrlogData) {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };

        self.jobs.spawn(move || {
            if let Err(e) = me.commit(&data) {
                tracing::warn!(
                    "trlog {}: dropping batch of {} entries from {}: {}",
                    data.trlog,
                    data.entries.len(),
                    data.from,
                    e
                );
            }
        });
    }
}

impl EventHandler for Committer {
    fn on_event(&self, event: &Event) -> Result<()> {
        match event {
            Event::TrlogData(data) if data.to == self.local => self.spawn_commit(data.clone()),
            Event::TrlogChanged { trlog } => self.schedule_apply(*trlog),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::trlog::{Operation, Position};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<Position>>,
        /// One past the position that fails, 0 for none
        fail_at: AtomicU64,
    }

    impl TableApplier for Recorder {
        fn apply(&self, _trlog: &Uuid, entry: &TrLogEntry) -> Result<()> {
            if self.fail_at.load(Ordering::SeqCst) == entry.pos + 1 {
                return Err(Error::Storage("table locked".into()));
            }
            self.applied.lock().unwrap().push(entry.pos);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Replies(Mutex<Vec<TrlogState>>);

    impl EventHandler for Replies {
        fn on_event(&self, event: &Event) -> Result<()> {
            if let Event::TrlogState(m) = event {
                self.0.lock().unwrap().push(m.clone());
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        local: Uuid,
        trlogs: Arc<TrLogs>,
        jobs: Arc<JobScheduler>,
        replies: Arc<Replies>,
        recorder: Arc<Recorder>,
        committer: Arc<Committer>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let local = Uuid::new_v4();
        let bus = Arc::new(EventBus::new());
        let trlogs = Arc::new(TrLogs::open(dir.path().join("trlog"), bus.clone()).unwrap());
        let jobs = Arc::new(JobScheduler::new().unwrap());
        let replies = Arc::new(Replies::default());
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(EventKind::TrlogState, replies.clone());

        let committer = Committer::new(
            local,
            trlogs.clone(),
            bus.clone(),
            jobs.clone(),
            recorder.clone(),
            4,
        );
        committer.register(&bus);

        Fixture { _dir: dir, local, trlogs, jobs, replies, recorder, committer }
    }

    fn batch(trlog: Uuid, from: Uuid, to: Uuid, positions: std::ops::Range<Position>) -> TrlogData {
        TrlogData {
            trlog,
            from,
            to,
            entries: positions
                .map(|p| TrLogEntry::new(p, Operation::insert(Uuid::nil(), vec![p as u8])))
                .collect(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_is_committed_and_acknowledged() {
        let f = fixture();
        let (trlog, peer) = (Uuid::new_v4(), Uuid::new_v4());

        f.committer
            .on_event(&Event::TrlogData(batch(trlog, peer, f.local, 0..10)))
            .unwrap();
        assert!(f.jobs.wait_idle(Duration::from_secs(5)).await);

        let log = f.trlogs.get(&trlog).unwrap();
        assert_eq!(log.top(), 10);
        assert_eq!(
            *f.replies.0.lock().unwrap(),
            vec![TrlogState { trlog, from: f.local, to: peer, top: 10 }]
        );

        // duplicate batch changes nothing but is still acknowledged
        assert_eq!(f.committer.commit(&batch(trlog, peer, f.local, 5..10)).unwrap(), 0);
        assert_eq!(f.replies.0.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_for_other_node_is_ignored() {
        let f = fixture();
        let trlog = Uuid::new_v4();

        f.committer
            .on_event(&Event::TrlogData(batch(trlog, Uuid::new_v4(), Uuid::new_v4(), 0..3)))
            .unwrap();
        assert!(f.jobs.wait_idle(Duration::from_secs(5)).await);

        assert!(f.trlogs.get(&trlog).is_none());
        assert!(f.replies.0.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_worker_applies_in_order() {
        let f = fixture();
        let log = f.trlogs.get_or_open(Uuid::new_v4()).unwrap();
        for i in 0..10u8 {
            log.add_with_new_ids(&Operation::insert(Uuid::nil(), vec![i])).unwrap();
        }

        for _ in 0..3 {
            f.committer.schedule_apply(log.id());
        }
        assert!(f.jobs.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(*f.recorder.applied.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(log.applied(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_entry_is_retried_on_next_change() {
        let f = fixture();
        let log = f.trlogs.get_or_open(Uuid::new_v4()).unwrap();
        for i in 0..6u8 {
            log.add_with_new_ids(&Operation::insert(Uuid::nil(), vec![i])).unwrap();
        }

        f.recorder.fail_at.store(3 + 1, Ordering::SeqCst);
        f.committer.schedule_apply(log.id());
        assert!(f.jobs.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(log.applied(), 3);

        f.recorder.fail_at.store(0, Ordering::SeqCst);
        f.committer.schedule_apply(log.id());
        assert!(f.jobs.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(log.applied(), 6);
        assert_eq!(*f.recorder.applied.lock().unwrap(), (0..6).collect::<Vec<_>>());
    }
}
