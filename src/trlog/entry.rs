//! Transaction Log Entry Types
//!
//! Defines the operation records stored in a transaction log and
//! shipped between nodes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of an entry inside a transaction log
pub type Position = u64;

/// Kind of a replicated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert (or overwrite) a row
    Insert,
    /// Delete a row
    Delete,
    /// Opaque operation interpreted by the table layer
    Raw,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Insert => write!(f, "INSERT"),
            OpKind::Delete => write!(f, "DELETE"),
            OpKind::Raw => write!(f, "RAW"),
        }
    }
}

/// A typed operation record. The payload is opaque to replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    /// Table (storage unit) the operation targets
    pub table: Uuid,
    pub payload: Vec<u8>,
}

impl Operation {
    pub fn new(kind: OpKind, table: Uuid, payload: Vec<u8>) -> Self {
        Self { kind, table, payload }
    }

    pub fn insert(table: Uuid, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(OpKind::Insert, table, payload.into())
    }

    pub fn delete(table: Uuid, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(OpKind::Delete, table, payload.into())
    }

    /// Serialize operation to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize operation from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// An operation at its log position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrLogEntry {
    pub pos: Position,
    pub op: Operation,
}

impl TrLogEntry {
    pub fn new(pos: Position, op: Operation) -> Self {
        Self { pos, op }
    }
}
