use crate::edges::Edge;
use crate::edit::{Edit, EditResult, LogLink};
use crate::errors::{GraphError, Result};
use crate::graph::ChunkedGraph;
use crate::node_id::NodeId;
use crate::stamp::Stamp;
use crate::store::{codec, Column};

use gneiss_core::{SmallKeyHashMap, SmallKeyHashSet};
use rkyv::{Archive, Deserialize, Serialize};

#[derive(Archive, Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OperationStatus {
    Success,
    Failed,
}

/// One row of the append-only operation journal, keyed by operation ID.
///
/// Exactly one of `added_edges` / `removed_edges` is populated; which one, together with the
/// bounding-box offset, discriminates the edit kind on replay (see [`Edit::from_record`]).
#[derive(Archive, Clone, Debug, Deserialize, Serialize)]
pub struct OperationRecord {
    pub operation_id: u64,
    pub user_id: String,
    /// The lock stamp of the edit; its logical commit time.
    pub stamp: Stamp,
    pub status: OperationStatus,
    pub source_ids: Vec<NodeId>,
    pub sink_ids: Vec<NodeId>,
    pub source_coords: Vec<[i32; 3]>,
    pub sink_coords: Vec<[i32; 3]>,
    pub added_edges: Vec<Edge>,
    pub removed_edges: Vec<Edge>,
    pub bbox_offset: Option<[i32; 3]>,
    pub new_root_ids: Vec<NodeId>,
    pub former_root_ids: Vec<NodeId>,
    pub undo_of: Option<u64>,
    pub redo_of: Option<u64>,
}

/// A change-log entry for one operation along a root's lineage.
#[derive(Clone, Debug)]
pub struct ChangeLogEntry {
    pub operation_id: u64,
    pub record: OperationRecord,
    pub is_undone: bool,
}

/// The lineage DAG of a root across edits: retired IDs linked to their successors.
#[derive(Clone, Debug, Default)]
pub struct LineageGraph {
    pub nodes: Vec<LineageNode>,
    /// Directed `(former, successor)` pairs.
    pub links: Vec<(NodeId, NodeId)>,
}

#[derive(Clone, Copy, Debug)]
pub struct LineageNode {
    pub id: NodeId,
    pub created: Stamp,
    pub operation_id: Option<u64>,
}

impl ChunkedGraph {
    pub fn read_operation(&self, operation_id: u64) -> Result<OperationRecord> {
        let bytes = self
            .store()
            .read_log(operation_id)?
            .ok_or_else(|| GraphError::NotFound(format!("operation {operation_id}")))?;
        Ok(codec::from_bytes(&bytes))
    }

    /// Reverses a logged operation by applying its inverse edit and journaling the `undo_of`
    /// back-pointer. Undoing an undo record redirects to a redo of its target, and vice versa, so
    /// chains of undo/redo never nest.
    pub fn undo_operation(
        &self,
        user_id: &str,
        operation_id: u64,
        priority: bool,
    ) -> Result<EditResult> {
        let record = self.read_operation(operation_id)?;
        if let Some(target) = record.undo_of {
            return self.redo_operation(user_id, target, priority);
        }
        if let Some(target) = record.redo_of {
            return self.undo_operation(user_id, target, priority);
        }
        if record.status == OperationStatus::Failed {
            return Err(GraphError::Precondition(format!(
                "operation {operation_id} failed; there is nothing to undo"
            )));
        }
        if self.undone_operations()?.contains(&operation_id) {
            return Err(GraphError::Precondition(format!(
                "operation {operation_id} is already undone"
            )));
        }
        let inverse = Edit::inverse_of(&record, user_id)?;
        inverse.apply(self, Some(LogLink::UndoOf(operation_id)), priority)
    }

    /// Re-applies a currently undone operation, journaling the `redo_of` back-pointer. The edit
    /// is replayed from the logged edge set; a multicut is never re-cut.
    pub fn redo_operation(
        &self,
        user_id: &str,
        operation_id: u64,
        priority: bool,
    ) -> Result<EditResult> {
        let record = self.read_operation(operation_id)?;
        if let Some(target) = record.undo_of {
            return self.undo_operation(user_id, target, priority);
        }
        if let Some(target) = record.redo_of {
            return self.redo_operation(user_id, target, priority);
        }
        if record.status == OperationStatus::Failed {
            return Err(GraphError::Precondition(format!(
                "operation {operation_id} failed; there is nothing to redo"
            )));
        }
        if !self.undone_operations()?.contains(&operation_id) {
            return Err(GraphError::Precondition(format!(
                "operation {operation_id} is not undone"
            )));
        }
        let mut replay = Edit::from_record(&record, true)?;
        match &mut replay {
            Edit::Merge { user_id: uid, .. }
            | Edit::Split { user_id: uid, .. }
            | Edit::Multicut { user_id: uid, .. } => *uid = user_id.to_owned(),
        }
        replay.apply(self, Some(LogLink::RedoOf(operation_id)), priority)
    }

    /// The set of operations that are effectively undone right now: undo/redo back-pointers
    /// replayed in commit order.
    pub(crate) fn undone_operations(&self) -> Result<SmallKeyHashSet<u64>> {
        let mut records = self.all_records()?;
        records.sort_by_key(|r| r.stamp);
        let mut undone = SmallKeyHashSet::default();
        for record in &records {
            if let Some(target) = record.undo_of {
                undone.insert(target);
            }
            if let Some(target) = record.redo_of {
                undone.remove(&target);
            }
        }
        Ok(undone)
    }

    fn all_records(&self) -> Result<Vec<OperationRecord>> {
        Ok(self
            .store()
            .scan_logs()?
            .into_iter()
            .map(|(_, bytes)| codec::from_bytes::<OperationRecord>(&bytes))
            .collect())
    }

    /// All of a user's operations since `since`, newest last. Without `include_undone`, undo/redo
    /// records themselves and operations that are currently undone are filtered away.
    pub fn user_operations(
        &self,
        user_id: &str,
        since: Stamp,
        include_undone: bool,
    ) -> Result<Vec<OperationRecord>> {
        let mut records = self.all_records()?;
        records.sort_by_key(|r| r.stamp);

        let undone = self.undone_operations()?;
        let mut results = Vec::new();
        for record in records {
            if record.user_id != user_id || record.stamp < since {
                continue;
            }
            if record.status == OperationStatus::Failed {
                continue;
            }
            if !include_undone {
                if record.undo_of.is_some() || record.redo_of.is_some() {
                    continue;
                }
                if undone.contains(&record.operation_id) {
                    continue;
                }
            }
            results.push(record);
        }
        Ok(results)
    }

    /// Undoes every still-effective operation of `user_id`, newest first. Returns the results of
    /// the applied undos.
    pub fn rollback_user(&self, user_id: &str, priority: bool) -> Result<Vec<EditResult>> {
        let mut effective = self.user_operations(user_id, Stamp::ZERO, false)?;
        effective.sort_by_key(|r| std::cmp::Reverse(r.stamp));

        let mut results = Vec::with_capacity(effective.len());
        for record in effective {
            results.push(self.undo_operation(user_id, record.operation_id, priority)?);
        }
        Ok(results)
    }

    /// The operations along the lineage of `root`, oldest first: every edit that produced `root`
    /// or one of its ancestors, flagged with its current undone state.
    pub fn change_log(&self, root: NodeId) -> Result<Vec<ChangeLogEntry>> {
        let undone = self.undone_operations()?;
        let mut entries: SmallKeyHashMap<u64, OperationRecord> = SmallKeyHashMap::default();

        let mut queue = vec![root];
        let mut visited: SmallKeyHashSet<NodeId> = queue.iter().copied().collect();
        while let Some(node) = queue.pop() {
            if let Some(cell) = self.store().latest_cell(node, Column::OperationId, Stamp::MAX)? {
                let operation_id: u64 = cell.decode();
                if !entries.contains_key(&operation_id) {
                    let record = self.read_operation(operation_id)?;
                    entries.insert(operation_id, record);
                }
            }
            if let Some(cell) = self.store().latest_cell(node, Column::FormerIds, Stamp::MAX)? {
                for former in cell.decode::<Vec<NodeId>>() {
                    if visited.insert(former) {
                        queue.push(former);
                    }
                }
            }
        }

        let mut log: Vec<ChangeLogEntry> = entries
            .into_iter()
            .map(|(operation_id, record)| ChangeLogEntry {
                operation_id,
                is_undone: undone.contains(&operation_id),
                record,
            })
            .collect();
        log.sort_by_key(|e| e.record.stamp);
        Ok(log)
    }

    /// The lineage DAG around `root`, bounded by `[past, future]`: `FormerIds` links are followed
    /// back until nodes predate `past`, `NewIds` links forward through cells stamped at or before
    /// `future`.
    pub fn lineage_graph(&self, root: NodeId, past: Stamp, future: Stamp) -> Result<LineageGraph> {
        let mut graph = LineageGraph::default();
        let mut queue = vec![root];
        let mut visited: SmallKeyHashSet<NodeId> = queue.iter().copied().collect();

        while let Some(node) = queue.pop() {
            let created = self.root_timestamps(&[node])?[0];
            let operation_id = self
                .store()
                .latest_cell(node, Column::OperationId, Stamp::MAX)?
                .map(|cell| cell.decode());
            graph.nodes.push(LineageNode {
                id: node,
                created,
                operation_id,
            });

            if created > past {
                if let Some(cell) = self.store().latest_cell(node, Column::FormerIds, Stamp::MAX)? {
                    for former in cell.decode::<Vec<NodeId>>() {
                        graph.links.push((former, node));
                        if visited.insert(former) {
                            queue.push(former);
                        }
                    }
                }
            }
            if let Some(cell) = self.store().latest_cell(node, Column::NewIds, future)? {
                for newer in cell.decode::<Vec<NodeId>>() {
                    graph.links.push((node, newer));
                    if visited.insert(newer) {
                        queue.push(newer);
                    }
                }
            }
        }

        graph.links.sort_unstable();
        graph.links.dedup();
        Ok(graph)
    }

    /// For each given current root, the set of its lineage ancestors that were the valid roots at
    /// `at`.
    pub fn past_id_mapping(
        &self,
        roots: &[NodeId],
        at: Stamp,
    ) -> Result<SmallKeyHashMap<NodeId, Vec<NodeId>>> {
        let mut mapping = SmallKeyHashMap::default();
        for &root in roots {
            let mut past_ids = Vec::new();
            let mut queue = vec![root];
            let mut visited: SmallKeyHashSet<NodeId> = queue.iter().copied().collect();
            while let Some(node) = queue.pop() {
                let created = self.root_timestamps(&[node])?[0];
                if created <= at {
                    past_ids.push(node);
                    continue;
                }
                if let Some(cell) = self.store().latest_cell(node, Column::FormerIds, Stamp::MAX)? {
                    for former in cell.decode::<Vec<NodeId>>() {
                        if visited.insert(former) {
                            queue.push(former);
                        }
                    }
                }
            }
            past_ids.sort_unstable();
            mapping.insert(root, past_ids);
        }
        Ok(mapping)
    }
}
