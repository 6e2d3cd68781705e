pub(crate) mod codec;
mod columns;

pub use columns::Column;

use crate::errors::{GraphError, Result};
use crate::node_id::{ChunkId, NodeId};
use crate::stamp::{MonotonicClock, Stamp};

use gneiss_core::SmallKeyHashMap;
use rkyv::{Archive, Deserialize, Serialize};
use sled::transaction::abort;
use sled::{IVec, Transactional, Tree};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

/// # Graph Store
///
/// The wide-column store backing one graph table, realized over [`sled`].
///
/// ## Layout
///
/// Three trees per table. The *graph tree* holds all node rows: one entry per cell, keyed
/// `node_id (BE) ++ column tag ++ !stamp (BE)`, so that a per-column scan yields cells
/// newest-first and a whole chunk is one contiguous range. The *log tree* maps operation IDs to
/// archived operation records. The *ids tree* holds per-chunk segment counters plus the operation
/// counter; counters only move forward, even when the edit that reserved a range aborts, so IDs
/// are never reused.
///
/// ## Writes
///
/// All mutations of an edit go through [`bulk_write`](GraphStore::bulk_write): a single sled
/// transaction that re-checks every root lock cell and applies either all mutations or none.
/// Lock cells live at a fixed key per root (they are compare-and-set state, not history).
#[derive(Clone)]
pub struct GraphStore {
    graph_tree: Tree,
    log_tree: Tree,
    ids_tree: Tree,
    clock: Arc<MonotonicClock>,
}

/// One versioned value of a node row column.
#[derive(Clone, Debug)]
pub struct Cell {
    pub stamp: Stamp,
    pub bytes: IVec,
}

impl Cell {
    pub fn decode<T>(&self) -> T
    where
        T: Archive,
        T::Archived: Deserialize<T, rkyv::Infallible>,
    {
        codec::from_bytes(&self.bytes)
    }
}

/// A pending cell write. The stamp is applied by `bulk_write`, which stamps every mutation of an
/// edit with the single lock timestamp.
#[derive(Clone, Debug)]
pub struct Mutation {
    pub node: NodeId,
    pub column: Column,
    pub bytes: Vec<u8>,
}

impl Mutation {
    pub fn new<T>(node: NodeId, column: Column, value: &T) -> Self
    where
        T: rkyv::Serialize<rkyv::ser::serializers::AllocSerializer<1024>>,
    {
        Self {
            node,
            column,
            bytes: codec::to_bytes(value).as_slice().to_vec(),
        }
    }

    pub fn raw(node: NodeId, column: Column, bytes: Vec<u8>) -> Self {
        Self {
            node,
            column,
            bytes,
        }
    }
}

/// The compare-and-set payload of a root's lock cell.
#[derive(Archive, Clone, Copy, Debug, Deserialize, Serialize)]
pub struct LockValue {
    pub operation_id: u64,
    /// Acquisition time; the logical timestamp of the whole edit. Renewal never changes it.
    pub stamp: Stamp,
    pub expires: Stamp,
}

#[derive(Debug)]
pub(crate) enum StoreAbort {
    LockHeld { root: NodeId, by: u64 },
    LockLost { root: NodeId },
}

impl From<StoreAbort> for GraphError {
    fn from(abort: StoreAbort) -> Self {
        match abort {
            StoreAbort::LockHeld { root, by } => GraphError::Locking(format!(
                "root {root:?} is locked by operation {by}"
            )),
            StoreAbort::LockLost { root } => GraphError::Locking(format!(
                "lock on root {root:?} was lost before the write committed"
            )),
        }
    }
}

const CELL_KEY_LEN: usize = 8 + Column::TAG_LEN + 8;
const OPERATION_COUNTER_KEY: &[u8] = b"operation-counter";

fn cell_key(node: NodeId, column: Column, stamp: Stamp) -> [u8; CELL_KEY_LEN] {
    let mut key = [0; CELL_KEY_LEN];
    key[..8].copy_from_slice(&node.to_be_bytes());
    key[8..10].copy_from_slice(&column.tag());
    key[10..].copy_from_slice(&stamp.to_reverse_be_bytes());
    key
}

/// Lock cells are single-versioned; their stamp field is pinned to all-zero key bytes.
fn lock_key(root: NodeId) -> [u8; CELL_KEY_LEN] {
    cell_key(root, Column::Lock, Stamp::MAX)
}

fn parse_cell_key(key: &[u8]) -> Option<(NodeId, Column, Stamp)> {
    if key.len() != CELL_KEY_LEN {
        return None;
    }
    let node = NodeId::from_be_bytes(key[..8].try_into().unwrap());
    let column = Column::from_tag([key[8], key[9]])?;
    let stamp = Stamp::from_reverse_be_bytes(key[10..].try_into().unwrap());
    Some((node, column, stamp))
}

fn parse_counter(bytes: Option<&[u8]>) -> u64 {
    bytes
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

impl GraphStore {
    pub fn open(db: &sled::Db, table_id: &str) -> sled::Result<Self> {
        Ok(Self {
            graph_tree: db.open_tree(format!("{}-graph", table_id))?,
            log_tree: db.open_tree(format!("{}-log", table_id))?,
            ids_tree: db.open_tree(format!("{}-ids", table_id))?,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// The store's authoritative clock.
    pub fn now(&self) -> Stamp {
        self.clock.now()
    }

    /// Newest cell of `(node, column)` with stamp `<= at`.
    pub fn latest_cell(&self, node: NodeId, column: Column, at: Stamp) -> Result<Option<Cell>> {
        let lo = cell_key(node, column, at);
        let hi = cell_key(node, column, Stamp::ZERO);
        if let Some(kv) = self.graph_tree.range(lo.to_vec()..=hi.to_vec()).next() {
            let (key, bytes) = kv?;
            let (_, _, stamp) = parse_cell_key(&key)
                .ok_or_else(|| GraphError::Internal("malformed cell key".into()))?;
            return Ok(Some(Cell { stamp, bytes }));
        }
        Ok(None)
    }

    /// All cells of `(node, column)` with stamp `<= at`, newest first.
    pub fn read_cells(&self, node: NodeId, column: Column, at: Stamp) -> Result<Vec<Cell>> {
        let lo = cell_key(node, column, at);
        let hi = cell_key(node, column, Stamp::ZERO);
        let mut cells = Vec::new();
        for kv in self.graph_tree.range(lo.to_vec()..=hi.to_vec()) {
            let (key, bytes) = kv?;
            let (_, _, stamp) = parse_cell_key(&key)
                .ok_or_else(|| GraphError::Internal("malformed cell key".into()))?;
            cells.push(Cell { stamp, bytes });
        }
        Ok(cells)
    }

    /// Reads every node row of a chunk, newest-first per column, filtered to stamps `<= at`.
    pub fn scan_chunk(
        &self,
        chunk: ChunkId,
        segment_mask: u64,
        at: Stamp,
        columns: Option<&[Column]>,
    ) -> Result<SmallKeyHashMap<NodeId, SmallKeyHashMap<Column, Vec<Cell>>>> {
        let mut lo = [0u8; CELL_KEY_LEN];
        lo[..8].copy_from_slice(&chunk.to_be_bytes());
        let mut hi = [0xffu8; CELL_KEY_LEN];
        hi[..8].copy_from_slice(&NodeId(chunk.0 | segment_mask).to_be_bytes());

        let mut rows: SmallKeyHashMap<NodeId, SmallKeyHashMap<Column, Vec<Cell>>> =
            SmallKeyHashMap::default();
        for kv in self.graph_tree.range(lo.to_vec()..=hi.to_vec()) {
            let (key, bytes) = kv?;
            let Some((node, column, stamp)) = parse_cell_key(&key) else {
                continue;
            };
            if matches!(column, Column::Lock) || stamp > at {
                continue;
            }
            if let Some(filter) = columns {
                if !filter.contains(&column) {
                    continue;
                }
            }
            rows.entry(node)
                .or_default()
                .entry(column)
                .or_default()
                .push(Cell { stamp, bytes });
        }
        Ok(rows)
    }

    /// Atomically applies all `mutations` (stamped `stamp`) and the optional log record, iff every
    /// root in `lock_roots` is still locked by `operation_id`.
    ///
    /// `slow_retry` selects the patient backoff profile for storage faults; a rejected lock check
    /// is never retried here, it surfaces as [`GraphError::Locking`].
    pub fn bulk_write(
        &self,
        mutations: &[Mutation],
        stamp: Stamp,
        log_record: Option<(u64, Vec<u8>)>,
        lock_roots: &[NodeId],
        operation_id: u64,
        slow_retry: bool,
    ) -> Result<()> {
        let (max_attempts, backoff) = if slow_retry {
            (10, Duration::from_millis(500))
        } else {
            (3, Duration::from_millis(20))
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: std::result::Result<(), sled::transaction::TransactionError<StoreAbort>> =
                (&self.graph_tree, &self.log_tree).transaction(|(graph_txn, log_txn)| {
                    let now = self.clock.now();
                    for &root in lock_roots {
                        let Some(bytes) = graph_txn.get(&lock_key(root))? else {
                            return abort(StoreAbort::LockLost { root });
                        };
                        let lock: LockValue = codec::from_bytes(&bytes);
                        if lock.operation_id != operation_id || lock.expires < now {
                            return abort(StoreAbort::LockLost { root });
                        }
                    }
                    for mutation in mutations {
                        graph_txn.insert(
                            &cell_key(mutation.node, mutation.column, stamp)[..],
                            mutation.bytes.clone(),
                        )?;
                    }
                    if let Some((operation_id, bytes)) = &log_record {
                        log_txn.insert(&operation_id.to_be_bytes()[..], bytes.clone())?;
                    }
                    Ok(())
                });

            match result {
                Ok(()) => return Ok(()),
                Err(sled::transaction::TransactionError::Abort(reason)) => {
                    return Err(reason.into())
                }
                Err(sled::transaction::TransactionError::Storage(err)) => {
                    if attempt >= max_attempts {
                        return Err(GraphError::Store(err));
                    }
                    log::warn!("bulk_write storage fault (attempt {attempt}): {err}");
                    std::thread::sleep(backoff);
                }
            }
        }
    }

    /// Compare-and-set acquisition of a root's lock cell. Returns the acquisition stamp, the
    /// logical timestamp of the edit. Fails if a different, unexpired operation owns the cell.
    pub fn lock_root(&self, root: NodeId, operation_id: u64, lease: Duration) -> Result<Stamp> {
        let result: std::result::Result<Stamp, sled::transaction::TransactionError<StoreAbort>> =
            self.graph_tree.transaction(|txn| {
                let now = self.clock.now();
                if let Some(bytes) = txn.get(&lock_key(root))? {
                    let held: LockValue = codec::from_bytes(&bytes);
                    if held.operation_id != operation_id && now <= held.expires {
                        return abort(StoreAbort::LockHeld {
                            root,
                            by: held.operation_id,
                        });
                    }
                }
                let value = LockValue {
                    operation_id,
                    stamp: now,
                    expires: now.saturating_add(lease),
                };
                txn.insert(&lock_key(root)[..], codec::to_bytes(&value).as_slice())?;
                Ok(now)
            });
        result.map_err(GraphError::from_transaction)
    }

    /// Releases the lock iff still held by `operation_id`.
    pub fn unlock_root(&self, root: NodeId, operation_id: u64) -> Result<()> {
        let result: std::result::Result<(), sled::transaction::TransactionError<StoreAbort>> =
            self.graph_tree.transaction(|txn| {
                if let Some(bytes) = txn.get(&lock_key(root))? {
                    let held: LockValue = codec::from_bytes(&bytes);
                    if held.operation_id == operation_id {
                        txn.remove(&lock_key(root)[..])?;
                    }
                }
                Ok(())
            });
        result.map_err(GraphError::from_transaction)
    }

    /// Extends the lease of a held lock. The acquisition stamp is preserved.
    pub fn renew_lock(&self, root: NodeId, operation_id: u64, lease: Duration) -> Result<()> {
        let result: std::result::Result<(), sled::transaction::TransactionError<StoreAbort>> =
            self.graph_tree.transaction(|txn| {
                let now = self.clock.now();
                let Some(bytes) = txn.get(&lock_key(root))? else {
                    return abort(StoreAbort::LockLost { root });
                };
                let mut held: LockValue = codec::from_bytes(&bytes);
                if held.operation_id != operation_id || held.expires < now {
                    return abort(StoreAbort::LockLost { root });
                }
                held.expires = now.saturating_add(lease);
                txn.insert(&lock_key(root)[..], codec::to_bytes(&held).as_slice())?;
                Ok(())
            });
        result.map_err(GraphError::from_transaction)
    }

    pub fn read_lock(&self, root: NodeId) -> Result<Option<LockValue>> {
        Ok(self
            .graph_tree
            .get(lock_key(root))?
            .map(|bytes| codec::from_bytes(&bytes)))
    }

    /// Reserves `count` fresh segment IDs in `chunk`. Counters start at 1; segment 0 is the chunk
    /// itself.
    pub fn next_segment_range(&self, chunk: ChunkId, count: u64) -> Result<Range<u64>> {
        let new = self
            .ids_tree
            .update_and_fetch(chunk.to_be_bytes(), |old| {
                Some((parse_counter(old) + count).to_be_bytes().to_vec())
            })?
            .expect("counter update always yields a value");
        let end = parse_counter(Some(new.as_ref()));
        Ok(end - count + 1..end + 1)
    }

    /// Raises a chunk's segment counter to at least `segment` (used by ingest, which assigns
    /// supervoxel segments itself).
    pub fn reserve_segments_through(&self, chunk: ChunkId, segment: u64) -> Result<()> {
        self.ids_tree.update_and_fetch(chunk.to_be_bytes(), |old| {
            Some(parse_counter(old).max(segment).to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    pub fn next_operation_id(&self) -> Result<u64> {
        let new = self
            .ids_tree
            .update_and_fetch(OPERATION_COUNTER_KEY, |old| {
                Some((parse_counter(old) + 1).to_be_bytes().to_vec())
            })?
            .expect("counter update always yields a value");
        Ok(parse_counter(Some(new.as_ref())))
    }

    /// Writes a log record outside of `bulk_write`, e.g. a FAILED record for an operation that
    /// never produced mutations.
    pub fn write_log(&self, operation_id: u64, bytes: Vec<u8>) -> Result<()> {
        self.log_tree.insert(operation_id.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn read_log(&self, operation_id: u64) -> Result<Option<IVec>> {
        Ok(self.log_tree.get(operation_id.to_be_bytes())?)
    }

    /// All log records in operation-ID order.
    pub fn scan_logs(&self) -> Result<Vec<(u64, IVec)>> {
        let mut records = Vec::new();
        for kv in self.log_tree.iter() {
            let (key, bytes) = kv?;
            let Ok(key) = <[u8; 8]>::try_from(key.as_ref()) else {
                continue;
            };
            records.push((u64::from_be_bytes(key), bytes));
        }
        Ok(records)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
