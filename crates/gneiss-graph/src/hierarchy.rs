use crate::edges::{decompress_edges, Edge};
use crate::errors::{GraphError, Result};
use crate::graph::ChunkedGraph;
use crate::node_id::{Layer, NodeId, EDIT_LAYER, SUPERVOXEL_LAYER};
use crate::stamp::Stamp;
use crate::store::Column;

use gneiss_core::glam::IVec3;
use gneiss_core::ilattice::prelude::Extent;
use gneiss_core::{SmallKeyHashMap, SmallKeyHashSet};

/// Read path of the hierarchy. Every query takes a stamp `at` and resolves against the newest
/// cells at or before it, so historical reads cross edit history for free.
impl ChunkedGraph {
    /// The parent of `node` at `at`, with the stamp of the parent cell.
    pub fn get_parent(&self, node: NodeId, at: Stamp) -> Result<Option<(NodeId, Stamp)>> {
        Ok(self
            .store()
            .latest_cell(node, Column::Parent, at)?
            .map(|cell| (cell.decode::<NodeId>(), cell.stamp)))
    }

    /// The children of `node` at `at`. Supervoxels have none.
    pub fn get_children(&self, node: NodeId, at: Stamp) -> Result<Vec<NodeId>> {
        if node.layer() == SUPERVOXEL_LAYER {
            return Ok(Vec::new());
        }
        Ok(self
            .store()
            .latest_cell(node, Column::Children, at)?
            .map(|cell| cell.decode())
            .unwrap_or_default())
    }

    /// Walks `Parent` cells upward from `node`, stopping at `stop_layer` (default: the root
    /// layer). A node that is interior at some later time resolves correctly because each step
    /// picks the newest parent cell stamped at or before `at`.
    pub fn get_root(&self, node: NodeId, at: Stamp, stop_layer: Option<Layer>) -> Result<NodeId> {
        let stop = stop_layer
            .unwrap_or_else(|| self.meta().root_layer())
            .min(self.meta().root_layer());
        let mut current = node;
        while current.layer() < stop {
            match self.get_parent(current, at)? {
                Some((parent, _)) => current = parent,
                None => {
                    return Err(GraphError::Precondition(format!(
                        "node {current:?} has no parent at {at:?}; it does not exist at that time"
                    )))
                }
            }
        }
        Ok(current)
    }

    /// Batched [`get_root`](Self::get_root). Shares parent lookups between queries; results come
    /// back in input order. With `assert_roots`, every result must be a current root at `at`.
    pub fn get_roots(
        &self,
        nodes: &[NodeId],
        at: Stamp,
        stop_layer: Option<Layer>,
        assert_roots: bool,
    ) -> Result<Vec<NodeId>> {
        let stop = stop_layer
            .unwrap_or_else(|| self.meta().root_layer())
            .min(self.meta().root_layer());

        let mut resolved: SmallKeyHashMap<NodeId, NodeId> = SmallKeyHashMap::default();
        let mut results = Vec::with_capacity(nodes.len());
        for &node in nodes {
            if let Some(&root) = resolved.get(&node) {
                results.push(root);
                continue;
            }
            let mut path = Vec::new();
            let mut current = node;
            while current.layer() < stop && !resolved.contains_key(&current) {
                path.push(current);
                match self.get_parent(current, at)? {
                    Some((parent, _)) => current = parent,
                    None => {
                        return Err(GraphError::Precondition(format!(
                            "node {current:?} has no parent at {at:?}; it does not exist at that time"
                        )))
                    }
                }
            }
            let root = resolved.get(&current).copied().unwrap_or(current);
            for walked in path {
                resolved.insert(walked, root);
            }
            results.push(root);
        }

        if assert_roots && stop == self.meta().root_layer() {
            let unique: SmallKeyHashSet<NodeId> = results.iter().copied().collect();
            for root in unique {
                let latest = self.is_latest_roots(&[root], at)?;
                if !latest[0] {
                    return Err(GraphError::Precondition(format!(
                        "root {root:?} is outdated at {at:?}"
                    )));
                }
            }
        }
        Ok(results)
    }

    /// A root is latest at `at` iff no later edit has retired it (no `NewIds` cell at or before
    /// `at`).
    pub fn is_latest_roots(&self, roots: &[NodeId], at: Stamp) -> Result<Vec<bool>> {
        let root_layer = self.meta().root_layer();
        let mut results = Vec::with_capacity(roots.len());
        for &root in roots {
            if root.layer() != root_layer {
                return Err(GraphError::BadRequest(format!(
                    "node {root:?} is not a layer {root_layer} root"
                )));
            }
            if self
                .store()
                .latest_cell(root, Column::Children, at)?
                .is_none()
            {
                return Err(GraphError::Precondition(format!(
                    "root {root:?} does not exist at {at:?}"
                )));
            }
            let retired = self
                .store()
                .latest_cell(root, Column::NewIds, at)?
                .is_some();
            results.push(!retired);
        }
        Ok(results)
    }

    /// Creation stamp of each root (the stamp of its child-list cell).
    pub fn root_timestamps(&self, roots: &[NodeId]) -> Result<Vec<Stamp>> {
        let mut results = Vec::with_capacity(roots.len());
        for &root in roots {
            let cells = self.store().read_cells(root, Column::Children, Stamp::MAX)?;
            let creation = cells
                .last()
                .ok_or_else(|| GraphError::NotFound(format!("node {root:?}")))?;
            results.push(creation.stamp);
        }
        Ok(results)
    }

    /// Descends by child lists from `root`, pruning sub-trees whose chunk does not intersect
    /// `bounds`, and returns the nodes at (or skip-connected past) `stop_layer`.
    pub fn get_subgraph_nodes(
        &self,
        root: NodeId,
        bounds: Option<Extent<IVec3>>,
        stop_layer: Layer,
        at: Stamp,
    ) -> Result<Vec<NodeId>> {
        if stop_layer < SUPERVOXEL_LAYER || stop_layer > root.layer() {
            return Err(GraphError::BadRequest(format!(
                "stop layer {stop_layer} outside of 1..={}",
                root.layer()
            )));
        }

        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if node.layer() <= stop_layer {
                out.push(node);
                continue;
            }
            for child in self.get_children(node, at)? {
                if let Some(bounds) = &bounds {
                    if !self.meta().chunk_intersects(child, bounds) {
                        continue;
                    }
                }
                stack.push(child);
            }
        }
        Ok(out)
    }

    /// All supervoxels beneath `root`, optionally restricted to a voxel-space box.
    pub fn leaves(
        &self,
        root: NodeId,
        bounds: Option<Extent<IVec3>>,
        at: Stamp,
    ) -> Result<Vec<NodeId>> {
        self.get_subgraph_nodes(root, bounds, SUPERVOXEL_LAYER, at)
    }

    /// Leaves plus the atomic edges induced on them (edges with both endpoints in the result).
    pub fn get_subgraph(
        &self,
        root: NodeId,
        bounds: Option<Extent<IVec3>>,
        at: Stamp,
    ) -> Result<(Vec<NodeId>, Vec<Edge>)> {
        let l2_nodes = self.get_subgraph_nodes(root, bounds, EDIT_LAYER, at)?;

        let mut leaves = Vec::new();
        let mut candidate_edges = Vec::new();
        for l2 in l2_nodes {
            leaves.extend(self.get_children(l2, at)?);
            candidate_edges.extend(self.node_atomic_edges(l2, at)?);
            for (_, edges) in self.node_cross_edges(l2, at)? {
                candidate_edges.extend(edges);
            }
        }

        let leaf_set: SmallKeyHashSet<NodeId> = leaves.iter().copied().collect();
        let mut seen = SmallKeyHashSet::default();
        let edges = candidate_edges
            .into_iter()
            .filter(|e| leaf_set.contains(&e.node_a) && leaf_set.contains(&e.node_b))
            .filter(|e| seen.insert(e.key()))
            .collect();
        Ok((leaves, edges))
    }

    /// Intra-chunk atomic edges stored on a layer-2 node.
    pub(crate) fn node_atomic_edges(&self, node: NodeId, at: Stamp) -> Result<Vec<Edge>> {
        Ok(self
            .store()
            .latest_cell(node, Column::AtomicEdges, at)?
            .map(|cell| decompress_edges(&cell.bytes))
            .unwrap_or_default())
    }

    /// All cross-chunk half-edges stored on a node, keyed by crossing layer.
    pub(crate) fn node_cross_edges(
        &self,
        node: NodeId,
        at: Stamp,
    ) -> Result<SmallKeyHashMap<Layer, Vec<Edge>>> {
        let mut by_layer = SmallKeyHashMap::default();
        for layer in EDIT_LAYER..self.meta().root_layer() {
            if let Some(cell) = self
                .store()
                .latest_cell(node, Column::CrossEdges(layer), at)?
            {
                let edges = decompress_edges(&cell.bytes);
                if !edges.is_empty() {
                    by_layer.insert(layer, edges);
                }
            }
        }
        Ok(by_layer)
    }
}
