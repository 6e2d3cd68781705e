pub(crate) mod components;

use crate::edges::Edge;
use crate::errors::{GraphError, Result};
use crate::graph::ChunkedGraph;
use crate::lock::RootLock;
use crate::mincut;
use crate::node_id::{NodeId, SUPERVOXEL_LAYER};
use crate::oplog::{OperationRecord, OperationStatus};
use crate::stamp::Stamp;
use crate::store::codec;

use gneiss_core::glam::IVec3;
use gneiss_core::SmallKeyHashSet;
use itertools::Itertools;

/// One atomic user edit. The variants share the apply protocol (resolve roots, lock, recompute,
/// journal, conditional write); they differ only in how the edited atomic edge set is obtained.
#[derive(Clone, Debug)]
pub enum Edit {
    /// Connect known pairs of supervoxels by adding (weighted) atomic edges.
    Merge {
        user_id: String,
        added_edges: Vec<Edge>,
        source_coords: Vec<IVec3>,
        sink_coords: Vec<IVec3>,
        allow_same_segment_merge: bool,
    },
    /// Cut known pairs of supervoxels that are directly connected by an edge.
    Split {
        user_id: String,
        removed_edges: Vec<Edge>,
        source_coords: Vec<IVec3>,
        sink_coords: Vec<IVec3>,
    },
    /// Separate two groups of supervoxels along a computed min-cut.
    Multicut {
        user_id: String,
        source_ids: Vec<NodeId>,
        sink_ids: Vec<NodeId>,
        source_coords: Vec<IVec3>,
        sink_coords: Vec<IVec3>,
        bbox_offset: Option<IVec3>,
    },
}

/// What a committed edit hands back to the caller.
#[derive(Clone, Debug)]
pub struct EditResult {
    pub operation_id: u64,
    /// The lock stamp; the logical time of the edit.
    pub stamp: Stamp,
    pub new_root_ids: Vec<NodeId>,
    pub new_lvl2_ids: Vec<NodeId>,
}

/// Journal back-pointer carried by undo/redo re-applications.
#[derive(Clone, Copy, Debug)]
pub(crate) enum LogLink {
    UndoOf(u64),
    RedoOf(u64),
}

impl Edit {
    pub fn user_id(&self) -> &str {
        match self {
            Edit::Merge { user_id, .. }
            | Edit::Split { user_id, .. }
            | Edit::Multicut { user_id, .. } => user_id,
        }
    }

    /// Reconstructs the edit a log record describes. Records carrying removed edges are replayed
    /// as plain splits unless `multicut_as_split` is disabled, so history stays deterministic
    /// (the stored cut is trusted; it is never recomputed).
    pub fn from_record(record: &OperationRecord, multicut_as_split: bool) -> Result<Self> {
        let ivec = |c: &[i32; 3]| IVec3::from(*c);
        if !record.added_edges.is_empty() {
            return Ok(Edit::Merge {
                user_id: record.user_id.clone(),
                added_edges: record.added_edges.clone(),
                source_coords: record.source_coords.iter().map(ivec).collect(),
                sink_coords: record.sink_coords.iter().map(ivec).collect(),
                allow_same_segment_merge: true,
            });
        }
        if !record.removed_edges.is_empty() {
            if multicut_as_split || record.bbox_offset.is_none() {
                return Ok(Edit::Split {
                    user_id: record.user_id.clone(),
                    removed_edges: record.removed_edges.clone(),
                    source_coords: record.source_coords.iter().map(ivec).collect(),
                    sink_coords: record.sink_coords.iter().map(ivec).collect(),
                });
            }
            return Ok(Edit::Multicut {
                user_id: record.user_id.clone(),
                source_ids: record.source_ids.clone(),
                sink_ids: record.sink_ids.clone(),
                source_coords: record.source_coords.iter().map(ivec).collect(),
                sink_coords: record.sink_coords.iter().map(ivec).collect(),
                bbox_offset: record.bbox_offset.map(IVec3::from),
            });
        }
        Err(GraphError::Precondition(
            "log record contains neither added nor removed edges".into(),
        ))
    }

    /// The edit that reverses a logged operation: swap added and removed edges. A reversed cut
    /// replays the logged removed edges as a merge with their original affinities.
    pub fn inverse_of(record: &OperationRecord, user_id: &str) -> Result<Self> {
        let ivec = |c: &[i32; 3]| IVec3::from(*c);
        if !record.added_edges.is_empty() {
            return Ok(Edit::Split {
                user_id: user_id.to_owned(),
                removed_edges: record.added_edges.clone(),
                source_coords: record.source_coords.iter().map(ivec).collect(),
                sink_coords: record.sink_coords.iter().map(ivec).collect(),
            });
        }
        if !record.removed_edges.is_empty() {
            return Ok(Edit::Merge {
                user_id: user_id.to_owned(),
                added_edges: record.removed_edges.clone(),
                source_coords: record.source_coords.iter().map(ivec).collect(),
                sink_coords: record.sink_coords.iter().map(ivec).collect(),
                allow_same_segment_merge: true,
            });
        }
        Err(GraphError::Precondition(
            "log record contains neither added nor removed edges".into(),
        ))
    }

    fn source_and_sink_ids(&self) -> (Vec<NodeId>, Vec<NodeId>) {
        match self {
            Edit::Merge { added_edges, .. } => (
                added_edges.iter().map(|e| e.node_a).collect(),
                added_edges.iter().map(|e| e.node_b).collect(),
            ),
            Edit::Split { removed_edges, .. } => (
                removed_edges.iter().map(|e| e.node_a).collect(),
                removed_edges.iter().map(|e| e.node_b).collect(),
            ),
            Edit::Multicut {
                source_ids,
                sink_ids,
                ..
            } => (source_ids.clone(), sink_ids.clone()),
        }
    }

    fn validate(&self) -> Result<()> {
        let (sources, sinks) = self.source_and_sink_ids();
        if sources.is_empty() || sinks.is_empty() {
            return Err(GraphError::BadRequest(
                "an edit needs at least one source and one sink supervoxel".into(),
            ));
        }
        let source_set: SmallKeyHashSet<NodeId> = sources.iter().copied().collect();
        if sinks.iter().any(|sink| source_set.contains(sink)) {
            return Err(GraphError::Precondition(
                "one or more supervoxels exist as both sink and source".into(),
            ));
        }
        for &node in sources.iter().chain(&sinks) {
            if node.layer() != SUPERVOXEL_LAYER {
                return Err(GraphError::Precondition(format!(
                    "supervoxel expected, but {node:?} is a layer {} node",
                    node.layer()
                )));
            }
        }
        Ok(())
    }

    /// The common edit protocol. Holds the root locks from before the edge set is fixed until the
    /// conditional bulk write has committed; every emitted cell carries the lock stamp.
    pub(crate) fn apply(
        &self,
        graph: &ChunkedGraph,
        link: Option<LogLink>,
        priority: bool,
    ) -> Result<EditResult> {
        self.validate()?;

        let (sources, sinks) = self.source_and_sink_ids();
        let endpoints: Vec<NodeId> = sources.iter().chain(&sinks).copied().collect();
        let now = graph.store().now();
        let roots: Vec<NodeId> = graph
            .get_roots(&endpoints, now, None, false)?
            .into_iter()
            .sorted()
            .dedup()
            .collect();

        match self {
            Edit::Merge {
                allow_same_segment_merge,
                ..
            } => {
                if !allow_same_segment_merge && roots.len() == 1 {
                    return Err(GraphError::Precondition(
                        "supervoxels already belong to the same object".into(),
                    ));
                }
            }
            Edit::Split { .. } | Edit::Multicut { .. } => {
                if roots.len() > 1 {
                    return Err(GraphError::Precondition(
                        "all supervoxels must belong to the same object; already split?".into(),
                    ));
                }
            }
        }

        let operation_id = graph.store().next_operation_id()?;
        let lock = RootLock::acquire(graph.store(), &roots, operation_id)?;
        let stamp = lock.stamp();

        let (added, removed) = match self {
            Edit::Merge { added_edges, .. } => (added_edges.clone(), Vec::new()),
            Edit::Split { removed_edges, .. } => (Vec::new(), removed_edges.clone()),
            Edit::Multicut {
                source_ids,
                sink_ids,
                source_coords,
                sink_coords,
                bbox_offset,
                ..
            } => {
                let cut = mincut::run_mincut(
                    graph,
                    &mincut::MincutRequest {
                        source_ids: source_ids.clone(),
                        sink_ids: sink_ids.clone(),
                        source_coords: source_coords.clone(),
                        sink_coords: sink_coords.clone(),
                        bbox_offset: *bbox_offset,
                    },
                    stamp,
                )?;
                if cut.is_empty() {
                    let record = self.log_record(
                        operation_id,
                        stamp,
                        OperationStatus::Failed,
                        &[],
                        &[],
                        &[],
                        link,
                    );
                    graph
                        .store()
                        .write_log(operation_id, codec::to_bytes(&record).as_slice().to_vec())?;
                    return Err(GraphError::Postcondition(
                        "min-cut could not find any edges to remove".into(),
                    ));
                }
                (Vec::new(), cut)
            }
        };

        let outcome = components::recompute(graph, operation_id, stamp, &added, &removed)?;

        let record = self.log_record(
            operation_id,
            stamp,
            OperationStatus::Success,
            &removed,
            &outcome.new_roots,
            &outcome.former_roots,
            link,
        );

        // The log row goes into the same conditional write as the hierarchy mutations, so a lost
        // lock leaves neither behind.
        graph.store().bulk_write(
            &outcome.mutations,
            stamp,
            Some((operation_id, codec::to_bytes(&record).as_slice().to_vec())),
            lock.roots(),
            operation_id,
            !priority,
        )?;
        drop(lock);

        let result = EditResult {
            operation_id,
            stamp,
            new_root_ids: outcome.new_roots,
            new_lvl2_ids: outcome.new_l2_ids,
        };
        graph.publish_committed(&result);
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn log_record(
        &self,
        operation_id: u64,
        stamp: Stamp,
        status: OperationStatus,
        computed_removed: &[Edge],
        new_roots: &[NodeId],
        former_roots: &[NodeId],
        link: Option<LogLink>,
    ) -> OperationRecord {
        let arr = |c: &IVec3| c.to_array();
        let (sources, sinks) = self.source_and_sink_ids();
        let (added_edges, removed_edges, source_coords, sink_coords, bbox_offset) = match self {
            Edit::Merge {
                added_edges,
                source_coords,
                sink_coords,
                ..
            } => (
                added_edges.clone(),
                Vec::new(),
                source_coords.iter().map(arr).collect(),
                sink_coords.iter().map(arr).collect(),
                None,
            ),
            Edit::Split {
                removed_edges,
                source_coords,
                sink_coords,
                ..
            } => (
                Vec::new(),
                removed_edges.clone(),
                source_coords.iter().map(arr).collect(),
                sink_coords.iter().map(arr).collect(),
                None,
            ),
            Edit::Multicut {
                source_coords,
                sink_coords,
                bbox_offset,
                ..
            } => (
                Vec::new(),
                computed_removed.to_vec(),
                source_coords.iter().map(arr).collect(),
                sink_coords.iter().map(arr).collect(),
                bbox_offset.map(|o| o.to_array()),
            ),
        };
        let (undo_of, redo_of) = match link {
            Some(LogLink::UndoOf(id)) => (Some(id), None),
            Some(LogLink::RedoOf(id)) => (None, Some(id)),
            None => (None, None),
        };
        OperationRecord {
            operation_id,
            user_id: self.user_id().to_owned(),
            stamp,
            status,
            source_ids: sources,
            sink_ids: sinks,
            source_coords,
            sink_coords,
            added_edges,
            removed_edges,
            bbox_offset,
            new_root_ids: new_roots.to_vec(),
            former_root_ids: former_roots.to_vec(),
            undo_of,
            redo_of,
        }
    }
}
