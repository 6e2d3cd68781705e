//! The gneiss agglomeration graph.
//!
//! # Chunked Graph
//!
//! A [`ChunkedGraph`] is a versioned, hierarchical, spatially partitioned agglomeration graph
//! over a 3D segmentation. Supervoxels (layer 1) are grouped into connected components per chunk
//! (layer 2), and chunks coarsen layer by layer up to the root layer, whose nodes are the public
//! identities of whole segments.
//!
//! # Edits
//!
//! Users merge, split and min-cut segments concurrently. Every edit locks the affected roots,
//! recomputes connected components locally in the touched chunks, mints new node IDs, and commits
//! hierarchy rows plus a journal record in one conditional write. Node rows are never
//! overwritten; readers pass a [`Stamp`] and see the graph as of that time.
//!
//! # Storage
//!
//! All state lives in a [`sled`] database behind [`GraphStore`]: timestamped cells keyed so that
//! per-chunk scans are contiguous, per-chunk segment counters that only move forward, and an
//! append-only operation log with undo/redo linkage.

mod edges;
mod edit;
mod errors;
mod graph;
mod hierarchy;
mod ingest;
mod lock;
mod meta;
mod mincut;
mod node_id;
mod oplog;
mod publish;
mod stamp;
mod store;

pub use edges::*;
pub use edit::{Edit, EditResult};
pub use errors::*;
pub use graph::*;
pub use lock::{RootLock, LOCK_LEASE};
pub use meta::GraphMeta;
pub use mincut::{MincutRequest, SplitPreview, DEFAULT_BBOX_OFFSET};
pub use node_id::*;
pub use oplog::*;
pub use publish::*;
pub use stamp::{MonotonicClock, Stamp};
pub use store::{Cell, Column, GraphStore, LockValue, Mutation};
