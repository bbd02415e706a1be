//! Minimum Spanning Forest
//!
//! Borůvka (Sollin) phases over the links of a topology. Each phase every
//! subset picks one cheapest crossing link and the subsets are merged, so
//! the number of subsets at least halves per phase and a phase adds at most
//! one link per subset.
//!
//! Among crossing links of equal cost a subset prefers, in order: a link no
//! other subset picked in this phase, a link towards the subset picked by
//! the fewest others so far, the lowest link index. The choice depends on
//! link order only, never on node identifiers. With distinct costs the
//! result is the unique minimum spanning forest; with ties it may keep a
//! few extra links, which spreads routes instead of funnelling them through
//! one node.

use std::collections::{BTreeSet, HashMap};

use super::topology::Topology;

/// Union-find over dense indices
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Returns `true` if two different subsets were merged
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

/// Link between dense indices
struct Edge {
    a: usize,
    b: usize,
    cost: u32,
    link: usize,
}

/// Dense numbering of the nodes that appear in at least one link
fn dense_index(topology: &Topology) -> HashMap<u32, usize> {
    let mut index = HashMap::new();
    for link in &topology.links {
        for end in link.node {
            let next = index.len();
            index.entry(end).or_insert(next);
        }
    }
    index
}

/// Compute the spanning forest. Returns indices into `topology.links`.
pub fn spanning_forest(topology: &Topology) -> Vec<usize> {
    let index = dense_index(topology);
    let n = index.len();

    let edges: Vec<Edge> = topology
        .links
        .iter()
        .enumerate()
        .filter(|(_, link)| link.node[0] != link.node[1])
        .map(|(i, link)| Edge {
            a: index[&link.node[0]],
            b: index[&link.node[1]],
            cost: link.cost(),
            link: i,
        })
        .collect();

    let mut sets = DisjointSet::new(n);
    let mut subsets = n;
    let mut tree = BTreeSet::new();
    let mut phase = 0;

    while subsets > 1 {
        phase += 1;

        // subset root of both ends, fixed for the phase
        let ends: Vec<(usize, usize)> = edges
            .iter()
            .map(|edge| (sets.find(edge.a), sets.find(edge.b)))
            .collect();

        // cheapest crossing cost per subset root
        let mut cheapest: Vec<Option<u32>> = vec![None; n];
        for (edge, &(ra, rb)) in edges.iter().zip(&ends) {
            if ra == rb {
                continue;
            }
            for root in [ra, rb] {
                cheapest[root] = Some(cheapest[root].map_or(edge.cost, |c| c.min(edge.cost)));
            }
        }

        let mut picks = vec![0u32; edges.len()];
        let mut targeted = vec![0u32; n];
        let mut chosen = Vec::new();

        for root in 0..n {
            let cost = match cheapest[root] {
                Some(cost) => cost,
                None => continue,
            };

            let best = edges
                .iter()
                .zip(&ends)
                .enumerate()
                .filter_map(|(i, (edge, &(ra, rb)))| {
                    if ra == rb || edge.cost != cost {
                        return None;
                    }
                    let other = match (ra == root, rb == root) {
                        (true, _) => rb,
                        (_, true) => ra,
                        _ => return None,
                    };
                    Some((i, other))
                })
                .min_by_key(|&(i, other)| (picks[i], targeted[other], edges[i].link));

            if let Some((i, other)) = best {
                if picks[i] == 0 {
                    chosen.push(&edges[i]);
                }
                picks[i] += 1;
                targeted[other] += 1;
            }
        }

        let mut merged = false;
        for edge in chosen {
            tree.insert(edge.link);
            if sets.union(edge.a, edge.b) {
                subsets -= 1;
                merged = true;
            }
        }

        // remaining subsets have no crossing link at all
        if !merged {
            break;
        }
    }

    tracing::trace!(
        "Spanning forest: {} nodes, {} links, {} tree links, {} subsets after {} phases",
        n,
        edges.len(),
        tree.len(),
        subsets,
        phase
    );

    tree.into_iter().collect()
}

/// Group linked nodes (topology node indices) into connected components of
/// the given links. Indices outside `topology.links` are ignored.
pub fn components(topology: &Topology, links: &[usize]) -> Vec<Vec<usize>> {
    let index = dense_index(topology);
    let mut sets = DisjointSet::new(index.len());
    for link in links.iter().filter_map(|&i| topology.links.get(i)) {
        sets.union(index[&link.node[0]], index[&link.node[1]]);
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for (&node, &dense) in &index {
        groups.entry(sets.find(dense)).or_default().push(node as usize);
    }

    let mut result: Vec<Vec<usize>> = groups
        .into_values()
        .map(|mut g| {
            g.sort_unstable();
            g
        })
        .collect();
    result.sort();
    result
}
