use crate::error::StoreError;
use crate::model::{Direction, EdgeKind, GraphEdge, Neighbor, NodeId};
use crate::store::GraphStore;
use std::collections::{HashMap, HashSet};

/// Level-synchronous BFS. Each frontier is expanded with a single
/// `edges_touching` call; edges are visited in sorted order so the first
/// edge reaching a node (and therefore `via`) is stable across runs.
pub(crate) fn neighbors<S: GraphStore + ?Sized>(
    store: &S,
    start: &NodeId,
    edge_kinds: &[EdgeKind],
    depth: usize,
) -> Result<Vec<Neighbor>, StoreError> {
    if depth == 0 || store.get_node(start)?.is_none() {
        return Ok(Vec::new());
    }

    let mut visited: HashSet<NodeId> = HashSet::new();
    visited.insert(start.clone());
    let mut frontier = vec![start.clone()];
    let mut reached: Vec<(NodeId, u32, GraphEdge, Direction)> = Vec::new();

    for distance in 1..=depth {
        if frontier.is_empty() {
            break;
        }
        frontier.sort();
        let in_frontier: HashSet<&NodeId> = frontier.iter().collect();
        let mut edges = store.edges_touching(&frontier, edge_kinds)?;
        edges.sort();
        edges.dedup();

        let mut next = Vec::new();
        for edge in edges {
            let mut hops = Vec::with_capacity(2);
            if in_frontier.contains(&edge.source) {
                hops.push((edge.target.clone(), Direction::Outgoing));
            }
            if in_frontier.contains(&edge.target) {
                hops.push((edge.source.clone(), Direction::Incoming));
            }
            for (other, direction) in hops {
                if visited.insert(other.clone()) {
                    next.push(other.clone());
                    reached.push((other, distance as u32, edge.clone(), direction));
                }
            }
        }
        frontier = next;
    }

    let ids: Vec<NodeId> = reached.iter().map(|(id, ..)| id.clone()).collect();
    let mut nodes: HashMap<NodeId, _> = store
        .get_nodes(&ids)?
        .into_iter()
        .map(|node| (node.id.clone(), node))
        .collect();

    let mut out: Vec<Neighbor> = reached
        .into_iter()
        .filter_map(|(id, distance, via, direction)| {
            nodes.remove(&id).map(|node| Neighbor {
                node,
                distance,
                via,
                direction,
            })
        })
        .collect();
    out.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| a.node.location_key().cmp(&b.node.location_key()))
    });
    Ok(out)
}
