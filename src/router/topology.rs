//! Cluster Topology
//!
//! Undirected weighted graph of nodes as seen by the gossip layer.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Largest link weight taken into account
pub const MAX_LINK_WEIGHT: u32 = u32::MAX >> 1;

/// A node of the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopoNode {
    /// Global node identifier
    pub uuid: Uuid,
    /// Locally assigned short id
    pub id: u32,
    /// Network address (host:port)
    pub addr: String,
}

/// Undirected link between two node indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopoLink {
    /// Indices into [`Topology::nodes`]
    pub node: [u32; 2],
    /// Bigger is more preferred
    pub weight: u32,
}

/// Topology snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: Vec<TopoNode>,
    pub links: Vec<TopoLink>,
}

impl TopoLink {
    pub fn new(a: u32, b: u32, weight: u32) -> Self {
        Self {
            node: [a, b],
            weight: weight.min(MAX_LINK_WEIGHT),
        }
    }

    /// Weight clamped to [`MAX_LINK_WEIGHT`]
    pub fn weight(&self) -> u32 {
        self.weight.min(MAX_LINK_WEIGHT)
    }

    /// Cost used by the spanning tree: preferred links are cheaper
    pub fn cost(&self) -> u32 {
        MAX_LINK_WEIGHT - self.weight()
    }
}

impl Topology {
    pub fn new(nodes: Vec<TopoNode>, links: Vec<TopoLink>) -> Result<Self> {
        let topology = Self { nodes, links };
        topology.validate()?;
        Ok(topology)
    }

    /// Load a topology snapshot from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let topology: Topology = serde_json::from_str(&content)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Check that every link references a known node and node ids are unique
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.uuid) {
                return Err(Error::Topology(format!("duplicate node {}", node.uuid)));
            }
        }

        for (i, link) in self.links.iter().enumerate() {
            for end in link.node {
                if end as usize >= self.nodes.len() {
                    return Err(Error::Topology(format!(
                        "link {} references node index {} of {}",
                        i,
                        end,
                        self.nodes.len()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Index of a node by UUID
    pub fn node_index(&self, uuid: &Uuid) -> Option<usize> {
        self.nodes.iter().position(|n| &n.uuid == uuid)
    }

    /// Find a node by UUID
    pub fn node(&self, uuid: &Uuid) -> Option<&TopoNode> {
        self.nodes.iter().find(|n| &n.uuid == uuid)
    }
}
