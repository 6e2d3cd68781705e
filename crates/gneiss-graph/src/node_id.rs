use gneiss_core::static_assertions::const_assert_eq;
use rkyv::{Archive, Deserialize, Serialize};

use gneiss_core::glam::IVec3;

/// Hierarchy layer. Layer 1 holds supervoxels, layer 2 the finest editable nodes, and the top
/// layer ([`GraphMeta::layer_count`](crate::GraphMeta)) the roots.
pub type Layer = u8;

pub const SUPERVOXEL_LAYER: Layer = 1;
pub const EDIT_LAYER: Layer = 2;

/// Number of high bits holding the layer, at every layer.
pub const LAYER_FIELD_BITS: u32 = 8;
/// Bits shared between the three coordinate fields and the segment field.
pub const PACKED_FIELD_BITS: u32 = 56;
const_assert_eq!(LAYER_FIELD_BITS + PACKED_FIELD_BITS, 64);

/// A 64-bit node identifier: `[layer:8][x:sb][y:sb][z:sb][segment:56-3sb]`.
///
/// `sb` is the per-axis coordinate width of the node's layer (see
/// [`GraphMeta::spatial_bits`](crate::GraphMeta::spatial_bits)); it shrinks as the layer rises
/// because chunks double per axis with each layer. The segment field is a per-chunk counter that
/// only ever grows, so a `(chunk, segment)` pair is never reused.
#[derive(
    Archive, Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord,
    Serialize,
)]
#[archive_attr(derive(Debug, Eq, Hash, PartialEq, PartialOrd, Ord))]
pub struct NodeId(pub u64);

/// A node ID with a zeroed segment field. Identifies one chunk at one layer.
///
/// All node rows of a chunk share this prefix, so the big-endian encoding makes a whole chunk one
/// contiguous key range in the backing store.
#[derive(
    Archive, Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord,
    Serialize,
)]
#[archive_attr(derive(Debug, Eq, Hash, PartialEq, PartialOrd, Ord))]
pub struct ChunkId(pub u64);

impl NodeId {
    pub const fn layer(self) -> Layer {
        (self.0 >> PACKED_FIELD_BITS) as Layer
    }

    pub const fn is_supervoxel(self) -> bool {
        self.layer() == SUPERVOXEL_LAYER
    }

    /// We serialize big-endian so that the `Ord` as interpreted by sled sorts a chunk's rows into
    /// one contiguous range.
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        NodeId(u64::from_be_bytes(bytes))
    }
}

impl ChunkId {
    pub const fn layer(self) -> Layer {
        (self.0 >> PACKED_FIELD_BITS) as Layer
    }

    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

/// Branch-free field packing for one layer's bit budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LayerBits {
    pub spatial: u32,
    pub segment: u32,
}

impl LayerBits {
    pub const fn new(spatial_bits: u32) -> Self {
        Self {
            spatial: spatial_bits,
            segment: PACKED_FIELD_BITS - 3 * spatial_bits,
        }
    }

    pub const fn segment_mask(self) -> u64 {
        (1 << self.segment) - 1
    }

    pub const fn max_coord(self) -> i32 {
        ((1u64 << self.spatial) - 1) as i32
    }

    pub const fn encode(self, layer: Layer, coords: IVec3, segment: u64) -> u64 {
        let z_shift = self.segment;
        let y_shift = z_shift + self.spatial;
        let x_shift = y_shift + self.spatial;
        (layer as u64) << PACKED_FIELD_BITS
            | (coords.x as u64) << x_shift
            | (coords.y as u64) << y_shift
            | (coords.z as u64) << z_shift
            | segment
    }

    pub const fn coords(self, id: u64) -> IVec3 {
        let coord_mask = (1u64 << self.spatial) - 1;
        let z_shift = self.segment;
        let y_shift = z_shift + self.spatial;
        let x_shift = y_shift + self.spatial;
        IVec3 {
            x: ((id >> x_shift) & coord_mask) as i32,
            y: ((id >> y_shift) & coord_mask) as i32,
            z: ((id >> z_shift) & coord_mask) as i32,
        }
    }

    pub const fn segment(self, id: u64) -> u64 {
        id & self.segment_mask()
    }

    pub const fn chunk(self, id: u64) -> ChunkId {
        ChunkId(id & !self.segment_mask())
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
