use crate::node_id::NodeId;

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use rkyv::{Archive, Deserialize, Serialize};
use std::io;

/// Affinity given to edges drawn by a user merge. Infinite, so a later min-cut will never sever
/// them.
pub const USER_EDGE_AFFINITY: f32 = f32::INFINITY;

/// An atomic (supervoxel-to-supervoxel) edge with its agglomeration affinity.
///
/// Edges are undirected; `key` canonicalizes the endpoint order for set membership.
#[derive(Archive, Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Edge {
    pub node_a: NodeId,
    pub node_b: NodeId,
    pub affinity: f32,
}

impl Edge {
    pub fn new(node_a: NodeId, node_b: NodeId, affinity: f32) -> Self {
        Self {
            node_a,
            node_b,
            affinity,
        }
    }

    pub fn key(&self) -> (NodeId, NodeId) {
        if self.node_a <= self.node_b {
            (self.node_a, self.node_b)
        } else {
            (self.node_b, self.node_a)
        }
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.node_a == node || self.node_b == node
    }

    pub fn other(&self, node: NodeId) -> NodeId {
        if self.node_a == node {
            self.node_b
        } else {
            self.node_a
        }
    }
}

/// Compresses an edge list into the bytes of one stored cell.
///
/// Edge cells are the bulky ones (everything else is a handful of IDs), so they get LZ4 frame
/// compression on top of the archived form.
pub fn compress_edges(edges: &[Edge]) -> Box<[u8]> {
    let archived = crate::store::codec::to_bytes(&edges.to_vec());
    let mut encoder = FrameEncoder::new(Vec::new());
    let mut reader = archived.as_slice();
    io::copy(&mut reader, &mut encoder).unwrap();
    encoder.finish().unwrap().into_boxed_slice()
}

pub fn decompress_edges(bytes: &[u8]) -> Vec<Edge> {
    let mut decoder = FrameDecoder::new(bytes);
    let mut archived = Vec::new();
    io::copy(&mut decoder, &mut archived).unwrap();
    crate::store::codec::from_bytes(&archived)
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

    #[test]
    fn key_is_unordered() {
        let a = NodeId(7);
        let b = NodeId(3);
        assert_eq!(Edge::new(a, b, 0.5).key(), Edge::new(b, a, 0.1).key());
    }

    #[test]
    fn compress_round_trip() {
        let edges = vec![
            Edge::new(NodeId(1), NodeId(2), 0.25),
            Edge::new(NodeId(2), NodeId(3), USER_EDGE_AFFINITY),
        ];
        let bytes = compress_edges(&edges);
        assert_eq!(decompress_edges(&bytes), edges);
    }

    #[test]
    fn empty_list_round_trip() {
        let bytes = compress_edges(&[]);
        assert!(decompress_edges(&bytes).is_empty());
    }
}
