use crate::edges::{compress_edges, Edge};
use crate::errors::{GraphError, Result};
use crate::graph::ChunkedGraph;
use crate::meta::GraphMeta;
use crate::node_id::{ChunkId, Layer, NodeId, EDIT_LAYER};
use crate::stamp::Stamp;
use crate::store::{Column, Mutation};

use gneiss_core::glam::IVec3;
use gneiss_core::{SmallKeyHashMap, SmallKeyHashSet};
use itertools::Itertools;
use petgraph::unionfind::UnionFind;
use smallvec::SmallVec;

/// Everything a committed recomputation writes and reports.
pub(crate) struct RecomputeResult {
    pub new_roots: Vec<NodeId>,
    pub former_roots: Vec<NodeId>,
    pub new_l2_ids: Vec<NodeId>,
    pub mutations: Vec<Mutation>,
}

type EdgeKey = (NodeId, NodeId);
type Replacements = SmallKeyHashMap<NodeId, SmallVec<[NodeId; 2]>>;

/// In-memory image of the nodes minted by the running edit, consulted before the store so that
/// higher layers see the not-yet-written lower layers.
#[derive(Default)]
struct Overlay {
    /// node -> freshly minted parent.
    parent: SmallKeyHashMap<NodeId, NodeId>,
    /// freshly minted node -> its cross-chunk edges by crossing layer.
    cross: SmallKeyHashMap<NodeId, SmallKeyHashMap<Layer, Vec<Edge>>>,
}

impl Overlay {
    fn cross_edges_at_or_above(
        &self,
        graph: &ChunkedGraph,
        node: NodeId,
        layer: Layer,
        at: Stamp,
    ) -> Result<SmallKeyHashMap<Layer, Vec<Edge>>> {
        let all = match self.cross.get(&node) {
            Some(own) => own.clone(),
            None => graph.node_cross_edges(node, at)?,
        };
        Ok(all.into_iter().filter(|(j, _)| *j >= layer).collect())
    }

    /// Walks ancestors of `node` (overlay first) until one is a member of `pool`, giving up once
    /// the walk passes `limit_layer` or falls off the hierarchy.
    fn resolve_into_pool(
        &self,
        graph: &ChunkedGraph,
        node: NodeId,
        pool: &SmallKeyHashSet<NodeId>,
        limit_layer: Layer,
        at: Stamp,
    ) -> Result<Option<NodeId>> {
        let mut current = node;
        loop {
            if pool.contains(&current) {
                return Ok(Some(current));
            }
            if current.layer() >= limit_layer {
                return Ok(None);
            }
            current = match self.parent.get(&current) {
                Some(&parent) => parent,
                None => match graph.get_parent(current, at)? {
                    Some((parent, _)) => parent,
                    None => return Ok(None),
                },
            };
        }
    }
}

/// Recomputes the hierarchy around a set of added and removed atomic edges, at the edit's lock
/// stamp `at`.
///
/// Only components touching an edited supervoxel are rewritten: the affected layer-2 chunks are
/// re-partitioned first, then each higher layer re-partitions exactly the child pools of the
/// parents it retires, so untouched chunks keep their rows. Every minted ID comes from the
/// forward-only chunk counters.
pub(crate) fn recompute(
    graph: &ChunkedGraph,
    operation_id: u64,
    at: Stamp,
    added: &[Edge],
    removed: &[Edge],
) -> Result<RecomputeResult> {
    let mut overlay = Overlay::default();
    let mut mutations = Vec::new();
    let mut new_roots = Vec::new();
    let mut former_roots = Vec::new();

    let (new_l2_ids, mut frontier) =
        recompute_edit_layer(graph, at, added, removed, &mut overlay, &mut mutations)?;

    let root_layer = graph.meta().root_layer();
    for layer in EDIT_LAYER + 1..=root_layer {
        if frontier.is_empty() {
            break;
        }
        frontier = recompute_layer(
            graph,
            layer,
            at,
            frontier,
            &mut overlay,
            &mut mutations,
            &mut new_roots,
            &mut former_roots,
        )?;
    }

    new_roots.sort_unstable();
    new_roots.dedup();
    former_roots.sort_unstable();
    former_roots.dedup();

    // Lineage: each retired root points at every successor of the operation and vice versa, and
    // each new root records the operation that minted it.
    for &former in &former_roots {
        mutations.push(Mutation::new(former, Column::NewIds, &new_roots));
    }
    for &root in &new_roots {
        mutations.push(Mutation::new(root, Column::FormerIds, &former_roots));
        mutations.push(Mutation::new(root, Column::OperationId, &operation_id));
    }

    Ok(RecomputeResult {
        new_roots,
        former_roots,
        new_l2_ids,
        mutations,
    })
}

/// Re-partitions the affected layer-2 chunks. Returns the minted layer-2 IDs and the replacement
/// frontier (retired layer-2 node -> successors) for the layers above.
fn recompute_edit_layer(
    graph: &ChunkedGraph,
    at: Stamp,
    added: &[Edge],
    removed: &[Edge],
    overlay: &mut Overlay,
    mutations: &mut Vec<Mutation>,
) -> Result<(Vec<NodeId>, Replacements)> {
    let meta = graph.meta();
    let removed_keys: SmallKeyHashSet<EdgeKey> = removed.iter().map(Edge::key).collect();
    let mut removed_seen: SmallKeyHashSet<EdgeKey> = SmallKeyHashSet::default();

    // Group the retired layer-2 nodes by their chunk.
    let mut old_by_chunk: SmallKeyHashMap<ChunkId, SmallKeyHashSet<NodeId>> =
        SmallKeyHashMap::default();
    for edge in added.iter().chain(removed) {
        for sv in [edge.node_a, edge.node_b] {
            let (old_l2, _) = graph.get_parent(sv, at)?.ok_or_else(|| {
                GraphError::Precondition(format!("supervoxel {sv:?} does not exist at {at:?}"))
            })?;
            old_by_chunk
                .entry(meta.chunk_of(old_l2))
                .or_default()
                .insert(old_l2);
        }
    }

    let mut new_l2_ids = Vec::new();
    let mut replaced = Replacements::default();

    for chunk in old_by_chunk.keys().copied().sorted() {
        let chunk_coords = meta.coords_of(NodeId(chunk.0));
        let old_nodes: Vec<NodeId> = old_by_chunk[&chunk].iter().copied().sorted().collect();

        // Pool of supervoxels plus every stored edge touching them.
        let mut origin: SmallKeyHashMap<NodeId, NodeId> = SmallKeyHashMap::default();
        let mut intra: SmallKeyHashMap<EdgeKey, Edge> = SmallKeyHashMap::default();
        let mut cross: Vec<(NodeId, Layer, Edge)> = Vec::new(); // (inside sv, crossing layer, edge)
        for &old in &old_nodes {
            for sv in graph.get_children(old, at)? {
                origin.insert(sv, old);
            }
            for edge in graph.node_atomic_edges(old, at)? {
                intra.insert(edge.key(), edge);
            }
            for (layer, edges) in graph.node_cross_edges(old, at)? {
                for edge in edges {
                    let inside = inside_endpoint(meta, &edge, chunk_coords).ok_or_else(|| {
                        GraphError::Internal(format!(
                            "cross edge {edge:?} stored on {old:?} has no endpoint in its chunk"
                        ))
                    })?;
                    cross.push((inside, layer, edge));
                }
            }
        }

        // Apply removals...
        for key in removed_keys.iter() {
            if intra.remove(key).is_some() {
                removed_seen.insert(*key);
            }
        }
        cross.retain(|(_, _, edge)| {
            let key = edge.key();
            if removed_keys.contains(&key) {
                removed_seen.insert(key);
                false
            } else {
                true
            }
        });

        // ...then additions local to this chunk.
        for edge in added {
            let coords_a = meta.coords_of(edge.node_a);
            let coords_b = meta.coords_of(edge.node_b);
            match meta.crossing_layer(coords_a, coords_b) {
                None if coords_a == chunk_coords => {
                    intra.entry(edge.key()).or_insert(*edge);
                }
                Some(layer) => {
                    if let Some(inside) = inside_endpoint(meta, edge, chunk_coords) {
                        if !cross.iter().any(|(_, _, e)| e.key() == edge.key()) {
                            cross.push((inside, layer, *edge));
                        }
                    }
                }
                None => {}
            }
        }

        // Partition the pool with the surviving intra-chunk edges.
        let members: Vec<NodeId> = origin.keys().copied().sorted().collect();
        let index: SmallKeyHashMap<NodeId, usize> = members
            .iter()
            .copied()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        let mut uf = UnionFind::<usize>::new(members.len());
        for edge in intra.values() {
            if let (Some(&a), Some(&b)) = (index.get(&edge.node_a), index.get(&edge.node_b)) {
                uf.union(a, b);
            }
        }
        let components = collect_components(&members, &uf);

        let chunk_l2 = meta.chunk_at_layer(EDIT_LAYER, chunk_coords);
        let mut segments = graph
            .store()
            .next_segment_range(chunk_l2, components.len() as u64)?;

        for component in components {
            let segment = segments.next().expect("one segment reserved per component");
            let new_l2 = meta.node_id(EDIT_LAYER, chunk_coords, segment);
            new_l2_ids.push(new_l2);

            let member_set: SmallKeyHashSet<NodeId> = component.iter().copied().collect();
            let own_intra: Vec<Edge> = intra
                .values()
                .filter(|e| member_set.contains(&e.node_a) && member_set.contains(&e.node_b))
                .copied()
                .collect();
            let mut own_cross: SmallKeyHashMap<Layer, Vec<Edge>> = SmallKeyHashMap::default();
            for (inside, layer, edge) in &cross {
                if member_set.contains(inside) {
                    own_cross.entry(*layer).or_default().push(*edge);
                }
            }

            mutations.push(Mutation::new(new_l2, Column::Children, &component));
            mutations.push(Mutation::raw(
                new_l2,
                Column::AtomicEdges,
                compress_edges(&own_intra).into_vec(),
            ));
            for (&layer, edges) in &own_cross {
                mutations.push(Mutation::raw(
                    new_l2,
                    Column::CrossEdges(layer),
                    compress_edges(edges).into_vec(),
                ));
            }
            for &sv in &component {
                mutations.push(Mutation::new(sv, Column::Parent, &new_l2));
                overlay.parent.insert(sv, new_l2);
                replaced.entry(origin[&sv]).or_default().push(new_l2);
            }
            overlay.cross.insert(new_l2, own_cross);
        }
    }

    for key in removed_keys {
        if !removed_seen.contains(&key) {
            return Err(GraphError::Precondition(format!(
                "atomic edge {key:?} does not exist at {at:?}"
            )));
        }
    }

    for news in replaced.values_mut() {
        news.sort_unstable();
        news.dedup();
    }
    Ok((new_l2_ids, replaced))
}

/// Re-partitions one layer: retires every parent of a replaced child and mints a parent per
/// component of the merged child pools. Returns the next replacement frontier.
#[allow(clippy::too_many_arguments)]
fn recompute_layer(
    graph: &ChunkedGraph,
    layer: Layer,
    at: Stamp,
    frontier: Replacements,
    overlay: &mut Overlay,
    mutations: &mut Vec<Mutation>,
    new_roots: &mut Vec<NodeId>,
    former_roots: &mut Vec<NodeId>,
) -> Result<Replacements> {
    let meta = graph.meta();
    let root_layer = meta.root_layer();

    // Only entries whose old parent sits at this layer are resolved now; the rest (skip
    // connections) wait for their parent's layer.
    let mut deferred = Replacements::default();
    let mut parents_by_chunk: SmallKeyHashMap<ChunkId, SmallKeyHashSet<NodeId>> =
        SmallKeyHashMap::default();
    let mut children_of_old: Replacements = Replacements::default();

    for (old, news) in frontier {
        let Some((parent, _)) = graph.get_parent(old, at)? else {
            if old.layer() == root_layer {
                // The retired node was itself a root; nothing above it to rewrite.
                former_roots.push(old);
                continue;
            }
            return Err(GraphError::Internal(format!(
                "non-root node {old:?} has no parent at {at:?}"
            )));
        };
        if parent.layer() > layer {
            deferred.insert(old, news);
            continue;
        }
        parents_by_chunk
            .entry(meta.chunk_of(parent))
            .or_default()
            .insert(parent);
        children_of_old.insert(old, news);
    }

    let mut replaced = Replacements::default();

    for chunk in parents_by_chunk.keys().copied().sorted() {
        let old_parents: Vec<NodeId> = parents_by_chunk[&chunk].iter().copied().sorted().collect();

        // Child pool with replaced children substituted by their (non-promoted) successors.
        let mut origin: SmallKeyHashMap<NodeId, NodeId> = SmallKeyHashMap::default();
        for &parent in &old_parents {
            for child in graph.get_children(parent, at)? {
                match children_of_old.get(&child) {
                    Some(news) => {
                        for &new_child in news {
                            if new_child.layer() < root_layer {
                                origin.insert(new_child, parent);
                            }
                        }
                    }
                    None => {
                        origin.insert(child, parent);
                    }
                }
            }
        }

        let members: Vec<NodeId> = origin.keys().copied().sorted().collect();
        let member_set: SmallKeyHashSet<NodeId> = members.iter().copied().collect();
        let index: SmallKeyHashMap<NodeId, usize> = members
            .iter()
            .copied()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        let mut uf = UnionFind::<usize>::new(members.len());

        // Children connect through cross-chunk edges whose endpoints both resolve into this pool.
        // All crossing layers are considered: skip connections can carry an edge of any crossing
        // layer into this pool unconsumed, and resolution filters out edges that leave the chunk.
        for &member in &members {
            let cross = overlay.cross_edges_at_or_above(graph, member, EDIT_LAYER, at)?;
            for edges in cross.values() {
                for edge in edges {
                    for (own, other) in [
                        (edge.node_a, edge.node_b),
                        (edge.node_b, edge.node_a),
                    ] {
                        let Some(own_member) =
                            overlay.resolve_into_pool(graph, own, &member_set, layer, at)?
                        else {
                            continue;
                        };
                        if own_member != member {
                            continue;
                        }
                        if let Some(other_member) =
                            overlay.resolve_into_pool(graph, other, &member_set, layer, at)?
                        {
                            uf.union(index[&own_member], index[&other_member]);
                        }
                    }
                }
            }
        }

        let components = collect_components(&members, &uf);
        let chunk_coords = meta.coords_of(NodeId(chunk.0));

        for component in components {
            let mut rolled_up: SmallKeyHashMap<Layer, Vec<Edge>> = SmallKeyHashMap::default();
            let mut has_cross_edges = false;
            for &member in &component {
                for (j, edges) in overlay.cross_edges_at_or_above(graph, member, EDIT_LAYER, at)? {
                    has_cross_edges |= !edges.is_empty();
                    if j >= layer {
                        rolled_up.entry(j).or_default().extend(edges);
                    }
                }
            }

            // Skip connection: a lone, fully disconnected child goes straight to the root layer.
            let skip = meta.use_skip_connections
                && layer < root_layer
                && component.len() == 1
                && !has_cross_edges;
            let (parent_layer, parent_coords, parent_chunk) = if skip {
                let root_chunk = meta.chunk_at_layer(root_layer, meta.grid_coords_of(component[0]));
                (root_layer, meta.coords_of(NodeId(root_chunk.0)), root_chunk)
            } else {
                (layer, chunk_coords, chunk)
            };

            let mut segments = graph.store().next_segment_range(parent_chunk, 1)?;
            let segment = segments.next().expect("one segment reserved");
            let parent = meta.node_id(parent_layer, parent_coords, segment);

            mutations.push(Mutation::new(parent, Column::Children, &component));
            if parent_layer < root_layer {
                for (&j, edges) in &rolled_up {
                    mutations.push(Mutation::raw(
                        parent,
                        Column::CrossEdges(j),
                        compress_edges(edges).into_vec(),
                    ));
                }
            }
            for &member in &component {
                mutations.push(Mutation::new(member, Column::Parent, &parent));
                overlay.parent.insert(member, parent);
                replaced.entry(origin[&member]).or_default().push(parent);
            }
            overlay.cross.insert(parent, rolled_up);

            if parent_layer == root_layer {
                new_roots.push(parent);
            }
        }

        if layer < root_layer {
            // A parent retired with its whole pool promoted away still needs a frontier entry so
            // that its own parent gets rewritten.
            for &parent in &old_parents {
                replaced.entry(parent).or_default();
            }
        }
    }

    if layer == root_layer {
        for chunk_parents in parents_by_chunk.values() {
            former_roots.extend(chunk_parents.iter().copied());
        }
    }

    for news in replaced.values_mut() {
        news.sort_unstable();
        news.dedup();
    }

    for (old, news) in deferred {
        replaced.insert(old, news);
    }
    Ok(replaced)
}

fn inside_endpoint(meta: &GraphMeta, edge: &Edge, chunk_coords: IVec3) -> Option<NodeId> {
    if meta.coords_of(edge.node_a) == chunk_coords {
        Some(edge.node_a)
    } else if meta.coords_of(edge.node_b) == chunk_coords {
        Some(edge.node_b)
    } else {
        None
    }
}

/// Components sorted by smallest member, members sorted, for deterministic minting order.
fn collect_components(members: &[NodeId], uf: &UnionFind<usize>) -> Vec<Vec<NodeId>> {
    let mut buckets: SmallKeyHashMap<usize, Vec<NodeId>> = SmallKeyHashMap::default();
    for (i, &member) in members.iter().enumerate() {
        buckets.entry(uf.find(i)).or_default().push(member);
    }
    let mut components: Vec<Vec<NodeId>> = buckets.drain().map(|(_, v)| v).collect();
    for component in &mut components {
        component.sort_unstable();
    }
    components.sort_by_key(|c| c[0]);
    components
}
