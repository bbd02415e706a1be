//! Job Scheduler
//!
//! Runs short jobs on the runtime's blocking worker pool and keeps count
//! of the jobs still in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;

use crate::error::{Error, Result};

/// Poll interval of [`JobScheduler::wait_idle`]
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Worker-pool job scheduler
pub struct JobScheduler {
    /// Runtime the jobs are spawned on
    handle: Handle,
    /// Jobs spawned but not finished
    active: Arc<AtomicUsize>,
}

/// Decrements the active counter when the job ends, even by panic
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl JobScheduler {
    /// Create a scheduler bound to the current tokio runtime
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Internal(format!("job scheduler needs a tokio runtime: {}", e)))?;

        Ok(Self {
            handle,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run `job` on a pool worker
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(Arc::clone(&self.active));

        self.handle.spawn_blocking(move || {
            let _guard = guard;
            job();
        });
    }

    /// Number of jobs in flight
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no job is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        true
    }
}
