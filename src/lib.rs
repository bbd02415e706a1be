//! WolfMesh - Peer-to-Peer Transaction Log Replication
//!
//! Replicates per-table transaction logs between the nodes of a cluster
//! without a leader. Every node keeps an append-only, position-indexed log
//! per replicated table and pushes what its peers are missing in bounded
//! batches.
//!
//! # Architecture
//!
//! Instead of a full mesh, each node only talks to its neighbours in a
//! minimum spanning tree of the cluster topology (preferring heavier
//! links). Synchronization is organized in three layers:
//!
//! - [`sync::Synchronizer`]: one per node, follows topology changes
//! - [`sync::PeerSyncer`]: one per route (peer)
//! - [`sync::LogSyncer`]: one per (peer, log), a lock-free state machine
//!   that asks the peer for its top position and schedules transfers
//!
//! Incoming batches are appended by the [`commit::Committer`], which also
//! applies committed entries to local table state in position order.
//!
//! # Features
//!
//! - SQLite-backed transaction logs with idempotent, out-of-order append
//! - Borůvka spanning-tree routing
//! - Coalesced sync requests and non-overlapping batch scheduling
//! - Framed, checksummed and optionally LZ4-compressed wire protocol

pub mod commit;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod node;
pub mod protocol;
pub mod router;
pub mod sync;
pub mod trlog;

pub use config::WolfMeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::commit::{TableApplier, TraceApplier};
    pub use crate::config::WolfMeshConfig;
    pub use crate::error::{Error, Result};
    pub use crate::events::{Delivery, Event, EventBus, EventHandler, EventKind};
    pub use crate::node::Node;
    pub use crate::protocol::Message;
    pub use crate::router::{compute_routes, Topology};
    pub use crate::trlog::{Operation, Position, TrLog, TrLogEntry};
}
