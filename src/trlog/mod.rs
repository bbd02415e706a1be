//! Transaction Log Module
//!
//! Per-table, position-indexed operation logs and the registry that
//! opens them from the node's data directory.

pub mod entry;
mod store;

pub use entry::{OpKind, Operation, Position, TrLogEntry};
pub use store::{TrLog, MAX_POSITION};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::Result;
use crate::events::EventBus;

/// File extension of a transaction log database
const TRLOG_EXT: &str = "db";

/// Registry of every transaction log known to this node
pub struct TrLogs {
    /// Directory holding one database per log
    dir: PathBuf,
    /// Bus handed to every opened log
    bus: Arc<EventBus>,
    /// Opened logs
    logs: Mutex<HashMap<Uuid, Arc<TrLog>>>,
}

impl TrLogs {
    /// Open the registry and every log already present in `dir`
    pub fn open(dir: PathBuf, bus: Arc<EventBus>) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;

        let mut logs = HashMap::new();
        for dirent in std::fs::read_dir(&dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TRLOG_EXT) {
                continue;
            }

            let id = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                Some(id) => id,
                None => {
                    tracing::warn!("Ignoring unexpected file in trlog directory: {:?}", path);
                    continue;
                }
            };

            let log = TrLog::open(&path, id, Arc::clone(&bus))?;
            logs.insert(id, Arc::new(log));
        }

        tracing::info!("Opened {} transaction logs from {:?}", logs.len(), dir);

        Ok(Self {
            dir,
            bus,
            logs: Mutex::new(logs),
        })
    }

    /// Get an already opened log
    pub fn get(&self, id: &Uuid) -> Option<Arc<TrLog>> {
        self.lock().get(id).cloned()
    }

    /// Get a log, creating its storage on first use
    pub fn get_or_open(&self, id: Uuid) -> Result<Arc<TrLog>> {
        let mut logs = self.lock();
        if let Some(log) = logs.get(&id) {
            return Ok(Arc::clone(log));
        }

        let log = Arc::new(TrLog::open(&self.path_for(&id), id, Arc::clone(&self.bus))?);
        logs.insert(id, Arc::clone(&log));
        tracing::debug!("Created transaction log {}", id);
        Ok(log)
    }

    /// Identities of all known logs, sorted
    pub fn ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Path of the database backing a log
    pub fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.{}", id, TRLOG_EXT))
    }

    /// Registry directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<TrLog>>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
