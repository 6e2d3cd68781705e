use crate::edges::{compress_edges, Edge};
use crate::errors::{GraphError, Result};
use crate::graph::ChunkedGraph;
use crate::node_id::{ChunkId, Layer, NodeId, EDIT_LAYER, SUPERVOXEL_LAYER};
use crate::stamp::Stamp;
use crate::store::{Column, Mutation};

use gneiss_core::glam::IVec3;
use gneiss_core::{SmallKeyHashMap, SmallKeyHashSet};
use itertools::Itertools;
use petgraph::unionfind::UnionFind;

/// The store-facing half of the ingest pipeline: writing the initial hierarchy that edits later
/// rewrite. The voxel-level agglomeration that produces supervoxels and affinities happens
/// upstream; this module receives its per-chunk output.
impl ChunkedGraph {
    /// Writes one atomic chunk: its supervoxels and every incident atomic edge (cross-chunk edges
    /// are passed to both of their chunks). Partitions the supervoxels into layer-2 nodes and
    /// returns them.
    ///
    /// Supervoxel IDs are assigned upstream; their segment counter watermark is recorded so edits
    /// never mint colliding IDs.
    pub fn write_atomic_chunk(
        &self,
        coords: IVec3,
        supervoxels: &[NodeId],
        edges: &[Edge],
        stamp: Stamp,
    ) -> Result<Vec<NodeId>> {
        let meta = self.meta();
        let root_shift = (meta.root_layer() - EDIT_LAYER) as i32;
        if (coords >> root_shift) != IVec3::ZERO {
            return Err(GraphError::BadRequest(format!(
                "chunk {coords:?} lies outside of the root chunk; raise layer_count"
            )));
        }

        let sv_set: SmallKeyHashSet<NodeId> = supervoxels.iter().copied().collect();
        let mut max_segment = 0;
        for &sv in supervoxels {
            if sv.layer() != SUPERVOXEL_LAYER || meta.coords_of(sv) != coords {
                return Err(GraphError::BadRequest(format!(
                    "{sv:?} is not a supervoxel of chunk {coords:?}"
                )));
            }
            max_segment = max_segment.max(meta.segment_of(sv));
        }

        let mut intra = Vec::new();
        let mut cross: Vec<(NodeId, Layer, Edge)> = Vec::new();
        for edge in edges {
            let inside_a = sv_set.contains(&edge.node_a);
            let inside_b = sv_set.contains(&edge.node_b);
            match (inside_a, inside_b) {
                (true, true) => intra.push(*edge),
                (true, false) | (false, true) => {
                    let inside = if inside_a { edge.node_a } else { edge.node_b };
                    let other = edge.other(inside);
                    let layer = meta
                        .crossing_layer(coords, meta.coords_of(other))
                        .ok_or_else(|| {
                            GraphError::BadRequest(format!(
                                "edge {edge:?} does not cross a chunk boundary"
                            ))
                        })?;
                    cross.push((inside, layer, *edge));
                }
                (false, false) => {
                    return Err(GraphError::BadRequest(format!(
                        "edge {edge:?} has no endpoint in chunk {coords:?}"
                    )))
                }
            }
        }

        // Partition and mint one layer-2 node per component.
        let members: Vec<NodeId> = supervoxels.iter().copied().sorted().dedup().collect();
        let index: SmallKeyHashMap<NodeId, usize> = members
            .iter()
            .copied()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        let mut uf = UnionFind::<usize>::new(members.len());
        for edge in &intra {
            uf.union(index[&edge.node_a], index[&edge.node_b]);
        }
        let mut buckets: SmallKeyHashMap<usize, Vec<NodeId>> = SmallKeyHashMap::default();
        for (i, &member) in members.iter().enumerate() {
            buckets.entry(uf.find(i)).or_default().push(member);
        }
        let mut components: Vec<Vec<NodeId>> = buckets.drain().map(|(_, v)| v).collect();
        for component in &mut components {
            component.sort_unstable();
        }
        components.sort_by_key(|c| c[0]);

        let sv_chunk = meta.chunk_at_layer(SUPERVOXEL_LAYER, coords);
        self.store().reserve_segments_through(sv_chunk, max_segment)?;
        let l2_chunk = meta.chunk_at_layer(EDIT_LAYER, coords);
        let mut segments = self
            .store()
            .next_segment_range(l2_chunk, components.len() as u64)?;

        let mut mutations = Vec::new();
        let mut l2_ids = Vec::new();
        for component in components {
            let segment = segments.next().expect("one segment reserved per component");
            let l2 = meta.node_id(EDIT_LAYER, coords, segment);
            l2_ids.push(l2);

            let member_set: SmallKeyHashSet<NodeId> = component.iter().copied().collect();
            let own_intra: Vec<Edge> = intra
                .iter()
                .filter(|e| member_set.contains(&e.node_a) && member_set.contains(&e.node_b))
                .copied()
                .collect();
            let mut own_cross: SmallKeyHashMap<Layer, Vec<Edge>> = SmallKeyHashMap::default();
            for (inside, layer, edge) in &cross {
                if member_set.contains(inside) {
                    own_cross.entry(*layer).or_default().push(*edge);
                }
            }

            mutations.push(Mutation::new(l2, Column::Children, &component));
            mutations.push(Mutation::raw(
                l2,
                Column::AtomicEdges,
                compress_edges(&own_intra).into_vec(),
            ));
            for (&layer, edges) in &own_cross {
                mutations.push(Mutation::raw(
                    l2,
                    Column::CrossEdges(layer),
                    compress_edges(edges).into_vec(),
                ));
            }
            for &sv in &component {
                mutations.push(Mutation::new(sv, Column::Parent, &l2));
            }
        }

        // Ingest precedes the edit service; no root locks exist yet.
        self.store().bulk_write(&mutations, stamp, None, &[], 0, true)?;
        Ok(l2_ids)
    }

    /// Builds all layers above 2, bottom-up, from the layer-2 nodes the atomic chunks produced.
    /// Returns the minted roots.
    ///
    /// Chunks of one layer are independent, so each layer fans out over a bounded worker pool;
    /// results merge through a channel, and the next layer starts only when the previous one is
    /// fully written.
    pub fn build_hierarchy(
        &self,
        l2_ids: &[NodeId],
        stamp: Stamp,
        workers: usize,
    ) -> Result<Vec<NodeId>> {
        let meta = self.meta();
        let root_layer = meta.root_layer();
        let workers = workers.max(1);

        let mut roots = Vec::new();
        let mut current: Vec<NodeId> = l2_ids.to_vec();

        for layer in EDIT_LAYER + 1..=root_layer {
            let mut by_chunk: SmallKeyHashMap<ChunkId, Vec<NodeId>> = SmallKeyHashMap::default();
            for &node in &current {
                let chunk = meta.chunk_at_layer(layer, meta.grid_coords_of(node));
                by_chunk.entry(chunk).or_default().push(node);
            }
            let chunk_jobs: Vec<(ChunkId, Vec<NodeId>)> =
                by_chunk.into_iter().sorted_by_key(|(chunk, _)| *chunk).collect();

            let share = chunk_jobs.len().div_ceil(workers).max(1);
            let outcomes: Vec<Result<LayerChunkOutcome>> =
                crossbeam::thread::scope(|scope| {
                    let (tx, rx) = crossbeam::channel::unbounded();
                    for jobs in chunk_jobs.chunks(share) {
                        let tx = tx.clone();
                        scope.spawn(move |_| {
                            for (chunk, children) in jobs {
                                let outcome = self.build_layer_chunk(layer, *chunk, children, stamp);
                                if tx.send(outcome).is_err() {
                                    return;
                                }
                            }
                        });
                    }
                    drop(tx);
                    rx.iter().collect()
                })
                .map_err(|_| GraphError::Internal("ingest worker panicked".into()))?;

            current.clear();
            for outcome in outcomes {
                let outcome = outcome?;
                roots.extend(outcome.roots);
                current.extend(outcome.next_layer_nodes);
            }
        }

        roots.sort_unstable();
        Ok(roots)
    }

    /// Partitions one chunk of one layer and writes its parents (the ingest analog of the edit
    /// engine's layer recomputation, minus the replacement bookkeeping).
    fn build_layer_chunk(
        &self,
        layer: Layer,
        chunk: ChunkId,
        children: &[NodeId],
        stamp: Stamp,
    ) -> Result<LayerChunkOutcome> {
        let meta = self.meta();
        let root_layer = meta.root_layer();

        let members: Vec<NodeId> = children.iter().copied().sorted().collect();
        let member_set: SmallKeyHashSet<NodeId> = members.iter().copied().collect();
        let index: SmallKeyHashMap<NodeId, usize> = members
            .iter()
            .copied()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        let mut uf = UnionFind::<usize>::new(members.len());

        let mut cross_of: SmallKeyHashMap<NodeId, SmallKeyHashMap<Layer, Vec<Edge>>> =
            SmallKeyHashMap::default();
        for &member in &members {
            let by_layer = self.node_cross_edges(member, stamp)?;
            for (&j, edges) in by_layer.iter() {
                if j + 1 != layer {
                    continue;
                }
                for edge in edges {
                    for endpoint in [edge.node_a, edge.node_b] {
                        let resolved = self.get_root(endpoint, stamp, Some(layer - 1))?;
                        if resolved != member && member_set.contains(&resolved) {
                            uf.union(index[&member], index[&resolved]);
                        }
                    }
                }
            }
            cross_of.insert(member, by_layer);
        }

        let mut buckets: SmallKeyHashMap<usize, Vec<NodeId>> = SmallKeyHashMap::default();
        for (i, &member) in members.iter().enumerate() {
            buckets.entry(uf.find(i)).or_default().push(member);
        }
        let mut components: Vec<Vec<NodeId>> = buckets.drain().map(|(_, v)| v).collect();
        for component in &mut components {
            component.sort_unstable();
        }
        components.sort_by_key(|c| c[0]);

        let mut mutations = Vec::new();
        let mut outcome = LayerChunkOutcome::default();
        for component in components {
            let mut pending: SmallKeyHashMap<Layer, Vec<Edge>> = SmallKeyHashMap::default();
            for member in &component {
                for (&j, edges) in cross_of[member].iter() {
                    if j >= layer - 1 {
                        pending.entry(j).or_default().extend(edges.iter().copied());
                    }
                }
            }

            let skip = meta.use_skip_connections
                && layer < root_layer
                && component.len() == 1
                && pending.is_empty();
            let (parent_layer, parent_chunk) = if skip {
                (
                    root_layer,
                    meta.chunk_at_layer(root_layer, meta.grid_coords_of(component[0])),
                )
            } else {
                (layer, chunk)
            };
            let parent_coords = meta.coords_of(NodeId(parent_chunk.0));

            let mut segments = self.store().next_segment_range(parent_chunk, 1)?;
            let segment = segments.next().expect("one segment reserved");
            let parent = meta.node_id(parent_layer, parent_coords, segment);

            mutations.push(Mutation::new(parent, Column::Children, &component));
            if parent_layer < root_layer {
                for (&j, edges) in pending.iter() {
                    if j < layer {
                        continue;
                    }
                    mutations.push(Mutation::raw(
                        parent,
                        Column::CrossEdges(j),
                        compress_edges(edges).into_vec(),
                    ));
                }
            }
            for &member in &component {
                mutations.push(Mutation::new(member, Column::Parent, &parent));
            }

            if parent_layer == root_layer {
                outcome.roots.push(parent);
            } else {
                outcome.next_layer_nodes.push(parent);
            }
        }

        self.store().bulk_write(&mutations, stamp, None, &[], 0, true)?;
        Ok(outcome)
    }
}

#[derive(Default)]
struct LayerChunkOutcome {
    roots: Vec<NodeId>,
    next_layer_nodes: Vec<NodeId>,
}
