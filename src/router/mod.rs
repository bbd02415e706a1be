//! Router
//!
//! Selects the peers a node synchronizes with: its neighbours in the
//! spanning forest of the cluster topology, instead of every member.

mod mst;
mod topology;

pub use mst::{components, spanning_forest};
pub use topology::{TopoLink, TopoNode, Topology, MAX_LINK_WEIGHT};

use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::Result;

/// Peers a node exchanges synchronization traffic with
pub type Routes = BTreeSet<Uuid>;

/// Compute the route set of `local` for a topology.
///
/// A topology without links, or one that does not contain `local`, yields an
/// empty route set.
pub fn compute_routes(topology: &Topology, local: &Uuid) -> Result<Routes> {
    topology.validate()?;

    let mut routes = Routes::new();
    if topology.links.is_empty() {
        return Ok(routes);
    }

    let local_idx = match topology.node_index(local) {
        Some(idx) => idx as u32,
        None => {
            tracing::debug!("Local node {} is not part of the topology", local);
            return Ok(routes);
        }
    };

    for i in spanning_forest(topology) {
        let [a, b] = topology.links[i].node;
        let peer = if a == local_idx {
            b
        } else if b == local_idx {
            a
        } else {
            continue;
        };
        routes.insert(topology.nodes[peer as usize].uuid);
    }
    routes.remove(local);

    Ok(routes)
}
