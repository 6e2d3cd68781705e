use crate::edges::Edge;
use crate::errors::{GraphError, Result};
use crate::graph::ChunkedGraph;
use crate::node_id::NodeId;
use crate::stamp::Stamp;

use gneiss_core::glam::IVec3;
use gneiss_core::ilattice::prelude::Extent;
use gneiss_core::{SmallKeyHashMap, SmallKeyHashSet};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use std::collections::VecDeque;

/// Default margin around the source/sink coordinate hull, in voxels.
pub const DEFAULT_BBOX_OFFSET: IVec3 = IVec3::new(240, 240, 24);

const EPS: f64 = 1e-9;

/// A min-cut request: two supervoxel groups to separate, with the world coordinates that anchor
/// the bounding box.
#[derive(Clone, Debug)]
pub struct MincutRequest {
    pub source_ids: Vec<NodeId>,
    pub sink_ids: Vec<NodeId>,
    pub source_coords: Vec<IVec3>,
    pub sink_coords: Vec<IVec3>,
    pub bbox_offset: Option<IVec3>,
}

/// Outcome of a dry-run split: the supervoxel components left after the candidate cut, and
/// whether the cut was illegal (sources and sinks tied together by infinite affinity).
#[derive(Clone, Debug)]
pub struct SplitPreview {
    pub components: Vec<Vec<NodeId>>,
    pub illegal_split: bool,
}

impl MincutRequest {
    fn bounding_box(&self) -> Result<Extent<IVec3>> {
        let mut coords = self.source_coords.iter().chain(&self.sink_coords);
        let Some(&first) = coords.next() else {
            return Err(GraphError::BadRequest(
                "min-cut needs source and sink coordinates".into(),
            ));
        };
        let (mut min, mut max) = (first, first);
        for &coord in coords {
            min = min.min(coord);
            max = max.max(coord);
        }
        let offset = self.bbox_offset.unwrap_or(DEFAULT_BBOX_OFFSET);
        Ok(Extent::from_min_and_max(min - offset, max + offset))
    }
}

/// Computes the atomic edges a multicut has to remove. Fails the whole edit when the cut is
/// illegal; returns an empty list when sources and sinks are already disconnected inside the box
/// (the caller turns that into a postcondition failure).
pub(crate) fn run_mincut(
    graph: &ChunkedGraph,
    request: &MincutRequest,
    at: Stamp,
) -> Result<Vec<Edge>> {
    let (leaves, edges) = fetch_region(graph, request, at)?;
    let (cut, illegal) = min_cut_edges(&leaves, &edges, &request.source_ids, &request.sink_ids);
    if illegal {
        return Err(GraphError::Precondition(
            "sources and sinks are connected by infinite-affinity edges; the requested split is illegal"
                .into(),
        ));
    }
    Ok(cut)
}

/// Dry run of [`run_mincut`]: no failure on an illegal cut, and the resulting supervoxel
/// components are returned instead of being applied.
pub(crate) fn preview(
    graph: &ChunkedGraph,
    request: &MincutRequest,
    at: Stamp,
) -> Result<SplitPreview> {
    let (leaves, edges) = fetch_region(graph, request, at)?;
    let (cut, illegal_split) =
        min_cut_edges(&leaves, &edges, &request.source_ids, &request.sink_ids);

    let cut_keys: SmallKeyHashSet<(NodeId, NodeId)> = cut.iter().map(Edge::key).collect();
    let index: SmallKeyHashMap<NodeId, usize> = leaves
        .iter()
        .copied()
        .enumerate()
        .map(|(i, n)| (n, i))
        .collect();
    let mut uf = UnionFind::<usize>::new(leaves.len());
    for edge in &edges {
        if !cut_keys.contains(&edge.key()) {
            uf.union(index[&edge.node_a], index[&edge.node_b]);
        }
    }
    let mut buckets: SmallKeyHashMap<usize, Vec<NodeId>> = SmallKeyHashMap::default();
    for (i, &leaf) in leaves.iter().enumerate() {
        buckets.entry(uf.find(i)).or_default().push(leaf);
    }
    let mut components: Vec<Vec<NodeId>> = buckets.drain().map(|(_, v)| v).collect();
    for component in &mut components {
        component.sort_unstable();
    }
    components.sort_by_key(|c| c[0]);

    Ok(SplitPreview {
        components,
        illegal_split,
    })
}

/// The induced atomic-edge subgraph inside the request's bounding box.
fn fetch_region(
    graph: &ChunkedGraph,
    request: &MincutRequest,
    at: Stamp,
) -> Result<(Vec<NodeId>, Vec<Edge>)> {
    let endpoints: Vec<NodeId> = request
        .source_ids
        .iter()
        .chain(&request.sink_ids)
        .copied()
        .collect();
    if endpoints.is_empty() {
        return Err(GraphError::BadRequest("min-cut needs supervoxel IDs".into()));
    }
    let roots = graph.get_roots(&endpoints, at, None, false)?;
    if roots.iter().any(|&r| r != roots[0]) {
        return Err(GraphError::Precondition(
            "all supervoxels must belong to the same object; already split?".into(),
        ));
    }

    let bbox = request.bounding_box()?;
    let (leaves, edges) = graph.get_subgraph(roots[0], Some(bbox), at)?;

    let leaf_set: SmallKeyHashSet<NodeId> = leaves.iter().copied().collect();
    for &sv in &endpoints {
        if !leaf_set.contains(&sv) {
            return Err(GraphError::Precondition(format!(
                "supervoxel {sv:?} lies outside of the min-cut bounding box"
            )));
        }
    }
    Ok((leaves, edges))
}

/// Max-flow / min-cut over the induced subgraph (Edmonds-Karp on a residual arc-pair network).
///
/// Super-source and super-sink are tied to the groups with infinite arcs, so each group ends up
/// on one side of the cut. Returns the cut edges, or `illegal = true` when an augmenting path of
/// infinite capacity connects the groups (the flow would diverge and no finite cut exists).
fn min_cut_edges(
    leaves: &[NodeId],
    edges: &[Edge],
    sources: &[NodeId],
    sinks: &[NodeId],
) -> (Vec<Edge>, bool) {
    let mut network: DiGraph<NodeId, f64> = DiGraph::new();
    let index: SmallKeyHashMap<NodeId, NodeIndex> = leaves
        .iter()
        .map(|&leaf| (leaf, network.add_node(leaf)))
        .collect();
    let super_source = network.add_node(NodeId(0));
    let super_sink = network.add_node(NodeId(0));

    // Arcs come in (forward, backward) pairs so that `rev(e) == e ^ 1`.
    for edge in edges {
        let (a, b) = (index[&edge.node_a], index[&edge.node_b]);
        let capacity = edge.affinity as f64;
        network.add_edge(a, b, capacity);
        network.add_edge(b, a, capacity);
    }
    for &source in sources {
        network.add_edge(super_source, index[&source], f64::INFINITY);
        network.add_edge(index[&source], super_source, 0.0);
    }
    for &sink in sinks {
        network.add_edge(index[&sink], super_sink, f64::INFINITY);
        network.add_edge(super_sink, index[&sink], 0.0);
    }

    let mut flow = vec![0.0f64; network.edge_count()];
    loop {
        // BFS for the shortest augmenting path in the residual network.
        let mut parent_arc: Vec<Option<usize>> = vec![None; network.node_count()];
        let mut queue = VecDeque::from([super_source]);
        'bfs: while let Some(node) = queue.pop_front() {
            for arc in network.edges(node) {
                let arc_id = arc.id().index();
                if *arc.weight() - flow[arc_id] <= EPS {
                    continue;
                }
                let next = arc.target();
                if next == super_source || parent_arc[next.index()].is_some() {
                    continue;
                }
                parent_arc[next.index()] = Some(arc_id);
                if next == super_sink {
                    break 'bfs;
                }
                queue.push_back(next);
            }
        }
        if parent_arc[super_sink.index()].is_none() {
            break;
        }

        let mut bottleneck = f64::INFINITY;
        let mut cursor = super_sink;
        while cursor != super_source {
            let arc_id = parent_arc[cursor.index()].unwrap();
            let arc = petgraph::graph::EdgeIndex::new(arc_id);
            bottleneck = bottleneck.min(network[arc] - flow[arc_id]);
            cursor = network.edge_endpoints(arc).unwrap().0;
        }
        if bottleneck.is_infinite() {
            // Only infinite-affinity edges on the whole path: the groups cannot be separated.
            return (Vec::new(), true);
        }

        let mut cursor = super_sink;
        while cursor != super_source {
            let arc_id = parent_arc[cursor.index()].unwrap();
            let arc = petgraph::graph::EdgeIndex::new(arc_id);
            flow[arc_id] += bottleneck;
            flow[arc_id ^ 1] -= bottleneck;
            cursor = network.edge_endpoints(arc).unwrap().0;
        }
    }

    // The cut is the boundary of the residual set reachable from the super-source.
    let mut reachable = vec![false; network.node_count()];
    reachable[super_source.index()] = true;
    let mut queue = VecDeque::from([super_source]);
    while let Some(node) = queue.pop_front() {
        for arc in network.edges(node) {
            if *arc.weight() - flow[arc.id().index()] > EPS && !reachable[arc.target().index()] {
                reachable[arc.target().index()] = true;
                queue.push_back(arc.target());
            }
        }
    }

    let cut = edges
        .iter()
        .filter(|edge| {
            reachable[index[&edge.node_a].index()] != reachable[index[&edge.node_b].index()]
        })
        .copied()
        .collect();
    (cut, false)
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edges::USER_EDGE_AFFINITY;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId).collect()
    }

    #[test]
    fn cuts_the_weakest_edge_of_a_path() {
        let leaves = ids(&[1, 2, 3, 4]);
        let edges = vec![
            Edge::new(NodeId(1), NodeId(2), 0.9),
            Edge::new(NodeId(2), NodeId(3), 0.1),
            Edge::new(NodeId(3), NodeId(4), 0.8),
        ];
        let (cut, illegal) = min_cut_edges(&leaves, &edges, &[NodeId(1)], &[NodeId(4)]);
        assert!(!illegal);
        assert_eq!(cut.len(), 1);
        assert_eq!(cut[0].key(), (NodeId(2), NodeId(3)));
    }

    #[test]
    fn cut_can_take_multiple_edges() {
        // Two disjoint paths from 1 to 4.
        let leaves = ids(&[1, 2, 3, 4]);
        let edges = vec![
            Edge::new(NodeId(1), NodeId(2), 0.5),
            Edge::new(NodeId(2), NodeId(4), 0.9),
            Edge::new(NodeId(1), NodeId(3), 0.9),
            Edge::new(NodeId(3), NodeId(4), 0.4),
        ];
        let (cut, illegal) = min_cut_edges(&leaves, &edges, &[NodeId(1)], &[NodeId(4)]);
        assert!(!illegal);
        let mut keys: Vec<_> = cut.iter().map(Edge::key).collect();
        keys.sort();
        assert_eq!(keys, vec![(NodeId(1), NodeId(2)), (NodeId(3), NodeId(4))]);
    }

    #[test]
    fn infinite_path_is_illegal() {
        let leaves = ids(&[1, 2]);
        let edges = vec![Edge::new(NodeId(1), NodeId(2), USER_EDGE_AFFINITY)];
        let (cut, illegal) = min_cut_edges(&leaves, &edges, &[NodeId(1)], &[NodeId(2)]);
        assert!(illegal);
        assert!(cut.is_empty());
    }

    #[test]
    fn disconnected_groups_need_no_cut() {
        let leaves = ids(&[1, 2, 3, 4]);
        let edges = vec![
            Edge::new(NodeId(1), NodeId(2), 0.9),
            Edge::new(NodeId(3), NodeId(4), 0.9),
        ];
        let (cut, illegal) = min_cut_edges(&leaves, &edges, &[NodeId(1)], &[NodeId(3)]);
        assert!(!illegal);
        assert!(cut.is_empty());
    }

    #[test]
    fn bounding_box_hull_plus_offset() {
        let request = MincutRequest {
            source_ids: ids(&[1]),
            sink_ids: ids(&[2]),
            source_coords: vec![IVec3::new(100, 50, 10)],
            sink_coords: vec![IVec3::new(140, 90, 14)],
            bbox_offset: Some(IVec3::new(10, 10, 2)),
        };
        let bbox = request.bounding_box().unwrap();
        assert_eq!(bbox.minimum, IVec3::new(90, 40, 8));
        assert_eq!(bbox.max(), IVec3::new(150, 100, 16));
    }
}
