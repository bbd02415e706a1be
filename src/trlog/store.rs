//! Transaction Log Store
//!
//! Durable, append-only storage of operation records for one replicated
//! log, backed by SQLite. Owns the `top` and `applied` counters.
//!
//! `top` is only ever advanced with compare-and-swap and is never guarded
//! by a lock. `applied` is written inside the same SQLite transaction that
//! reads the entries being applied. Concurrent `apply` calls on one log must
//! be serialized by the caller (one apply worker per log).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::entry::{Operation, Position, TrLogEntry};
use crate::error::{Error, Result};
use crate::events::{Delivery, Event, EventBus};

/// Highest position representable in an SQLite INTEGER key
pub const MAX_POSITION: Position = (i64::MAX - 1) as Position;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trlog (
    pos INTEGER PRIMARY KEY,
    op  BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS trlog_applied (
    id  INTEGER PRIMARY KEY CHECK (id = 0),
    pos INTEGER NOT NULL
);
"#;

/// A single replicated transaction log
pub struct TrLog {
    /// Log identity
    id: Uuid,
    /// Storage connection
    conn: Mutex<Connection>,
    /// Next position handed out to locally-originated writes
    allocated: AtomicU64,
    /// Exclusive upper bound of published entries
    top: AtomicU64,
    /// Mirror of the persisted applied position
    applied: AtomicU64,
    /// Bus used to announce changes
    bus: Arc<EventBus>,
}

/// Publishes an allocated position when dropped, whether or not the write
/// that claimed it succeeded.
struct Publish<'a> {
    log: &'a TrLog,
    pos: Position,
}

impl Drop for Publish<'_> {
    fn drop(&mut self) {
        self.log.publish(self.pos);
    }
}

impl TrLog {
    /// Open or create the log stored at `path`
    pub fn open(path: &Path, id: Uuid, bus: Arc<EventBus>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        let max_pos: Option<i64> =
            conn.query_row("SELECT MAX(pos) FROM trlog", [], |row| row.get(0))?;
        let top = max_pos.map(|p| p as Position + 1).unwrap_or(0);

        let mut applied = match conn.query_row(
            "SELECT pos FROM trlog_applied WHERE id = 0",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(pos) => pos as Position,
            Err(rusqlite::Error::QueryReturnedNoRows) => 0,
            Err(e) => return Err(e.into()),
        };

        if applied > top {
            tracing::warn!(
                "trlog {}: persisted applied position {} is past top {}, clamping",
                id,
                applied,
                top
            );
            applied = top;
        }

        tracing::debug!("trlog {} opened: top={}, applied={}", id, top, applied);

        Ok(Self {
            id,
            conn: Mutex::new(conn),
            allocated: AtomicU64::new(top),
            top: AtomicU64::new(top),
            applied: AtomicU64::new(applied),
            bus,
        })
    }

    /// Log identity
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next position after the last published entry
    pub fn top(&self) -> Position {
        self.top.load(Ordering::Acquire)
    }

    /// Next position to be applied locally
    pub fn applied(&self) -> Position {
        self.applied.load(Ordering::Acquire)
    }

    /// Number of stored entries
    pub fn count(&self) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trlog", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Insert entries at their given positions.
    ///
    /// An entry whose position is already occupied is skipped. `top` is
    /// raised to one past the highest position in the batch. Returns the
    /// number of entries actually inserted; a "log changed" event is
    /// published when that number is positive.
    pub fn add(&self, entries: &[TrLogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut max_pos = 0;
        let inserted = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt =
                    tx.prepare_cached("INSERT OR IGNORE INTO trlog (pos, op) VALUES (?1, ?2)")?;
                for entry in entries {
                    if entry.pos > MAX_POSITION {
                        return Err(Error::TrLog(format!(
                            "position {} out of range",
                            entry.pos
                        )));
                    }
                    let blob = entry.op.serialize()?;
                    inserted += stmt.execute(params![entry.pos as i64, blob])?;
                    max_pos = max_pos.max(entry.pos);
                }
            }
            tx.commit()?;
            inserted
        };

        // allocation first, so a concurrent local write can never claim a
        // position below the new top
        self.allocated.fetch_max(max_pos + 1, Ordering::AcqRel);
        self.raise_top(max_pos + 1);

        tracing::trace!(
            "trlog {}: added {}/{} entries, top={}",
            self.id,
            inserted,
            entries.len(),
            self.top()
        );

        if inserted > 0 {
            self.notify_changed();
        }

        Ok(inserted)
    }

    /// Append a locally-originated operation at the next free position
    pub fn add_with_new_ids(&self, op: &Operation) -> Result<Position> {
        let blob = op.serialize()?;

        let pos = self.allocated.fetch_add(1, Ordering::AcqRel);

        let inserted = {
            let _publish = Publish { log: self, pos };
            if pos > MAX_POSITION {
                return Err(Error::TrLog("transaction log is full".into()));
            }
            let conn = self.lock();
            conn.execute(
                "INSERT OR IGNORE INTO trlog (pos, op) VALUES (?1, ?2)",
                params![pos as i64, blob],
            )?
        };

        if inserted == 0 {
            return Err(Error::PositionOccupied(pos));
        }

        self.notify_changed();
        Ok(pos)
    }

    /// Read published entries in `[from, to)` ordered by position.
    /// `from` does not need to be an existing key.
    pub fn range_read(&self, from: Position, to: Position) -> Result<Vec<TrLogEntry>> {
        let to = to.min(self.top());
        if from >= to {
            return Ok(Vec::new());
        }

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT pos, op FROM trlog WHERE pos >= ?1 AND pos < ?2 ORDER BY pos",
        )?;
        let rows = stmt.query_map(params![from as i64, to as i64], |row| {
            Ok((row.get::<_, i64>(0)? as Position, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (pos, blob) = row?;
            let op = Operation::deserialize(&blob).map_err(|e| Error::TrLogCorrupted {
                pos,
                reason: e.to_string(),
            })?;
            entries.push(TrLogEntry::new(pos, op));
        }

        Ok(entries)
    }

    /// Apply up to `batch_size` entries starting at the persisted applied
    /// position.
    ///
    /// Entries are passed to `apply_fn` in position order, without skipping
    /// a missing position: the round ends before a hole. The first failure
    /// stops the round and the applied position is persisted as one past the
    /// last success, so the failed entry is replayed by the next call.
    /// Returns the number of entries applied.
    pub fn apply<F>(&self, batch_size: usize, mut apply_fn: F) -> Result<usize>
    where
        F: FnMut(&TrLogEntry) -> Result<()>,
    {
        let top = self.top();

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let applied = match tx.query_row(
            "SELECT pos FROM trlog_applied WHERE id = 0",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(pos) => pos as Position,
            Err(rusqlite::Error::QueryReturnedNoRows) => 0,
            Err(e) => return Err(e.into()),
        };

        if applied >= top || batch_size == 0 {
            return Ok(0);
        }

        let rows: Vec<(Position, Vec<u8>)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT pos, op FROM trlog WHERE pos >= ?1 AND pos < ?2 ORDER BY pos LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![applied as i64, top as i64, batch_size as i64],
                |row| Ok((row.get::<_, i64>(0)? as Position, row.get::<_, Vec<u8>>(1)?)),
            )?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut next = applied;
        let mut count = 0;
        for (pos, blob) in rows {
            // hole: the entry has not arrived yet
            if pos != next {
                tracing::trace!("trlog {}: waiting for entry {} before {}", self.id, next, pos);
                break;
            }

            let op = match Operation::deserialize(&blob) {
                Ok(op) => op,
                Err(e) => {
                    tracing::warn!("trlog {}: cannot decode entry {}: {}", self.id, pos, e);
                    break;
                }
            };

            let entry = TrLogEntry::new(pos, op);
            if let Err(e) = apply_fn(&entry) {
                tracing::warn!("trlog {}: apply failed at position {}: {}", self.id, pos, e);
                break;
            }

            next = pos + 1;
            count += 1;
        }

        if next != applied {
            tx.execute(
                r#"
                INSERT INTO trlog_applied (id, pos) VALUES (0, ?1)
                ON CONFLICT(id) DO UPDATE SET pos = ?1
                "#,
                params![next as i64],
            )?;
        }
        tx.commit()?;

        self.applied.store(next, Ordering::Release);

        if count > 0 {
            tracing::trace!("trlog {}: applied {} entries, applied={}", self.id, count, next);
        }

        Ok(count)
    }

    /// Raise `top` to at least `new_top`
    fn raise_top(&self, new_top: Position) {
        let mut current = self.top.load(Ordering::Acquire);
        while current < new_top {
            match self.top.compare_exchange_weak(
                current,
                new_top,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Advance `top` past `pos` once every lower position is published
    fn publish(&self, pos: Position) {
        loop {
            match self.top.compare_exchange_weak(
                pos,
                pos + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) if current > pos => return,
                // predecessor still in flight
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    fn notify_changed(&self) {
        if let Err(e) = self
            .bus
            .publish(Event::TrlogChanged { trlog: self.id }, Delivery::Queued)
        {
            tracing::debug!("trlog {}: change notification dropped: {}", self.id, e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::events::{EventHandler, EventKind};

    fn op(n: u8) -> Operation {
        Operation::insert(Uuid::nil(), vec![n])
    }

    fn entries(range: std::ops::Range<Position>) -> Vec<TrLogEntry> {
        range.map(|p| TrLogEntry::new(p, op(p as u8))).collect()
    }

    fn open_log(dir: &Path) -> TrLog {
        TrLog::open(&dir.join("log.db"), Uuid::new_v4(), Arc::new(EventBus::new())).unwrap()
    }

    #[test]
    fn test_open_empty() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        assert_eq!(log.top(), 0);
        assert_eq!(log.applied(), 0);
        assert_eq!(log.count().unwrap(), 0);
        assert!(log.range_read(0, 100).unwrap().is_empty());
    }

    #[test]
    fn test_idempotent_add() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        let entry = TrLogEntry::new(3, op(1));
        assert_eq!(log.add(&[entry.clone()]).unwrap(), 1);
        assert_eq!(log.top(), 4);

        assert_eq!(log.add(&[entry]).unwrap(), 0);
        assert_eq!(log.top(), 4);
        assert_eq!(log.count().unwrap(), 1);
        assert_eq!(log.range_read(3, 4).unwrap()[0].op, op(1));
    }

    #[test]
    fn test_duplicate_keeps_first_payload() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        log.add(&[TrLogEntry::new(0, op(1))]).unwrap();
        log.add(&[TrLogEntry::new(0, op(2))]).unwrap();

        let read = log.range_read(0, 1).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].op, op(1));
    }

    #[test]
    fn test_range_read_seeks_sparse_positions() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        log.add(&[
            TrLogEntry::new(0, op(0)),
            TrLogEntry::new(5, op(5)),
            TrLogEntry::new(9, op(9)),
        ])
        .unwrap();
        assert_eq!(log.top(), 10);

        let read = log.range_read(1, 9).unwrap();
        assert_eq!(read.iter().map(|e| e.pos).collect::<Vec<_>>(), vec![5]);

        let read = log.range_read(2, 100).unwrap();
        assert_eq!(read.iter().map(|e| e.pos).collect::<Vec<_>>(), vec![5, 9]);
    }

    #[test]
    fn test_add_with_new_ids_follows_remote_top() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        log.add(&entries(0..10)).unwrap();
        assert_eq!(log.add_with_new_ids(&op(42)).unwrap(), 10);
        assert_eq!(log.top(), 11);
    }

    #[test]
    fn test_concurrent_allocation_is_dense() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        log.add(&entries(0..5)).unwrap();
        let old_top = log.top();

        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;

        let positions = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for t in 0..THREADS {
                let log = &log;
                let positions = &positions;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let pos = log.add_with_new_ids(&op((t * PER_THREAD + i) as u8)).unwrap();
                        positions.lock().unwrap().push(pos);
                    }
                });
            }
        });

        let mut positions = positions.into_inner().unwrap();
        positions.sort_unstable();
        let n = (THREADS * PER_THREAD) as Position;
        assert_eq!(positions, (old_top..old_top + n).collect::<Vec<_>>());
        assert_eq!(log.top(), old_top + n);
        assert_eq!(log.count().unwrap(), old_top + n);
    }

    #[test]
    fn test_apply_in_batches() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        log.add(&entries(0..23)).unwrap();

        let mut seen = Vec::new();
        loop {
            let n = log
                .apply(5, |entry| {
                    seen.push(entry.pos);
                    Ok(())
                })
                .unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 5);
        }

        assert_eq!(seen, (0..23).collect::<Vec<_>>());
        assert_eq!(log.applied(), log.top());
    }

    #[test]
    fn test_apply_stops_at_failure_and_resumes() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        log.add(&entries(0..10)).unwrap();

        let n = log
            .apply(100, |entry| {
                if entry.pos == 4 {
                    Err(Error::Internal("table unavailable".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(log.applied(), 4);

        let mut seen = Vec::new();
        log.apply(100, |entry| {
            seen.push(entry.pos);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (4..10).collect::<Vec<_>>());
        assert_eq!(log.applied(), 10);
    }

    #[test]
    fn test_apply_waits_for_missing_entries() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        // second batch arrives first
        log.add(&entries(5..10)).unwrap();
        assert_eq!(log.apply(100, |_| Ok(())).unwrap(), 0);
        assert_eq!(log.applied(), 0);

        log.add(&entries(0..3)).unwrap();
        let mut seen = Vec::new();
        log.apply(100, |entry| {
            seen.push(entry.pos);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(log.applied(), 3);

        log.add(&entries(3..5)).unwrap();
        assert_eq!(log.apply(100, |_| Ok(())).unwrap(), 7);
        assert_eq!(log.applied(), 10);
    }

    #[test]
    fn test_reopen_recovers_counters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        let id = Uuid::new_v4();

        {
            let log = TrLog::open(&path, id, Arc::new(EventBus::new())).unwrap();
            log.add(&entries(0..7)).unwrap();
            log.apply(3, |_| Ok(())).unwrap();
        }

        let log = TrLog::open(&path, id, Arc::new(EventBus::new())).unwrap();
        assert_eq!(log.top(), 7);
        assert_eq!(log.applied(), 3);
        assert_eq!(log.add_with_new_ids(&op(7)).unwrap(), 7);
    }

    #[test]
    fn test_applied_clamped_to_top() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA).unwrap();
            conn.execute("INSERT INTO trlog_applied (id, pos) VALUES (0, 12)", [])
                .unwrap();
        }

        let log = TrLog::open(&path, Uuid::new_v4(), Arc::new(EventBus::new())).unwrap();
        assert_eq!(log.top(), 0);
        assert_eq!(log.applied(), 0);
    }

    struct Counter(AtomicUsize);

    impl EventHandler for Counter {
        fn on_event(&self, _event: &Event) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_change_notified_once_per_batch() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe(EventKind::TrlogChanged, counter.clone());
        let _dispatcher = bus.start().unwrap();

        let log = TrLog::open(&dir.path().join("log.db"), Uuid::new_v4(), bus.clone()).unwrap();
        log.add(&entries(0..50)).unwrap();
        log.add(&entries(0..50)).unwrap(); // nothing new

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let seen: HashSet<_> = log.range_read(0, 50).unwrap().into_iter().map(|e| e.pos).collect();
        assert_eq!(seen.len(), 50);
        bus.close();
    }
}
