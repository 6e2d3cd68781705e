use crate::errors::{GraphError, Result};
use crate::node_id::{ChunkId, Layer, LayerBits, NodeId, EDIT_LAYER, PACKED_FIELD_BITS};

use gneiss_core::glam::IVec3;
use gneiss_core::ilattice::prelude::Extent;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Static shape of one graph table: the ID bit budget, the layer pyramid, and the chunking of the
/// underlying segmentation volume.
///
/// Layers 1 and 2 share one chunk grid (supervoxels live in the chunk of their layer-2 parents).
/// Above layer 2, chunks double per axis with every layer, so the per-axis coordinate width
/// shrinks by one and the segment field widens.
#[derive(
    Archive, Clone, Debug, Deserialize, PartialEq, RkyvDeserialize, RkyvSerialize, Serialize,
)]
pub struct GraphMeta {
    /// Total number of layers; the root layer.
    pub layer_count: Layer,
    /// Per-axis coordinate bits at layers 1 and 2.
    pub bits_per_dim: u8,
    /// Voxel shape of a layer-2 chunk.
    pub chunk_shape: [i32; 3],
    /// Voxel size in nanometers.
    pub resolution_nm: [f32; 3],
    /// Promote single-child components straight to the root layer.
    pub use_skip_connections: bool,
}

impl GraphMeta {
    /// Reads a RON metadata file, e.g. for table creation from a deployment config.
    pub fn read_file(path: &str) -> std::result::Result<Self, ron::Error> {
        let reader = std::fs::File::open(path)?;
        ron::de::from_reader(reader)
    }

    pub fn validate(&self) -> Result<()> {
        if self.layer_count < 3 {
            return Err(GraphError::BadRequest(
                "layer_count must be at least 3 (supervoxels, edit layer, roots)".into(),
            ));
        }
        if self.bits_per_dim == 0 || 3 * self.bits_per_dim as u32 >= PACKED_FIELD_BITS {
            return Err(GraphError::BadRequest(format!(
                "bits_per_dim {} leaves no room for segment IDs",
                self.bits_per_dim
            )));
        }
        if self.chunk_shape.iter().any(|&d| d <= 0) {
            return Err(GraphError::BadRequest("chunk_shape must be positive".into()));
        }
        Ok(())
    }

    /// Per-axis coordinate bits at `layer`.
    pub fn spatial_bits(&self, layer: Layer) -> u32 {
        let above_edit = layer.max(EDIT_LAYER) - EDIT_LAYER;
        (self.bits_per_dim as u32).saturating_sub(above_edit as u32)
    }

    pub fn layer_bits(&self, layer: Layer) -> LayerBits {
        LayerBits::new(self.spatial_bits(layer))
    }

    pub fn root_layer(&self) -> Layer {
        self.layer_count
    }

    pub fn node_id(&self, layer: Layer, coords: IVec3, segment: u64) -> NodeId {
        NodeId(self.layer_bits(layer).encode(layer, coords, segment))
    }

    pub fn chunk_id(&self, layer: Layer, coords: IVec3) -> ChunkId {
        self.layer_bits(layer).chunk(self.layer_bits(layer).encode(layer, coords, 0))
    }

    pub fn chunk_of(&self, node: NodeId) -> ChunkId {
        self.layer_bits(node.layer()).chunk(node.0)
    }

    pub fn coords_of(&self, node: NodeId) -> IVec3 {
        self.layer_bits(node.layer()).coords(node.0)
    }

    pub fn segment_of(&self, node: NodeId) -> u64 {
        self.layer_bits(node.layer()).segment(node.0)
    }

    pub fn segment_mask(&self, layer: Layer) -> u64 {
        self.layer_bits(layer).segment_mask()
    }

    /// Chunk coordinates of `node` expressed in the layer-2 grid (the minimum corner for coarse
    /// chunks).
    pub fn grid_coords_of(&self, node: NodeId) -> IVec3 {
        let layer = node.layer();
        let coords = self.coords_of(node);
        if layer <= EDIT_LAYER {
            coords
        } else {
            coords << (layer - EDIT_LAYER) as i32
        }
    }

    /// The chunk at `layer` containing the layer-2 chunk at `grid_coords`.
    pub fn chunk_at_layer(&self, layer: Layer, grid_coords: IVec3) -> ChunkId {
        let coords = if layer <= EDIT_LAYER {
            grid_coords
        } else {
            grid_coords >> (layer - EDIT_LAYER) as i32
        };
        self.chunk_id(layer, coords)
    }

    /// The layer-2 chunk containing a voxel.
    pub fn chunk_containing_voxel(&self, voxel: IVec3) -> IVec3 {
        IVec3::new(
            voxel.x.div_euclid(self.chunk_shape[0]),
            voxel.y.div_euclid(self.chunk_shape[1]),
            voxel.z.div_euclid(self.chunk_shape[2]),
        )
    }

    /// The extent in voxel coordinates of the chunk found at `(layer, chunk coordinates)`.
    pub fn chunk_extent_voxels(&self, layer: Layer, coords: IVec3) -> Extent<IVec3> {
        let scale = 1i32 << layer.max(EDIT_LAYER).saturating_sub(EDIT_LAYER) as i32;
        let shape = IVec3::from(self.chunk_shape) * scale;
        Extent::from_min_and_shape(coords * shape, shape)
    }

    /// Does the chunk of `node` intersect the voxel-space box?
    pub fn chunk_intersects(&self, node: NodeId, bounds: &Extent<IVec3>) -> bool {
        let chunk = self.chunk_extent_voxels(node.layer(), self.coords_of(node));
        let disjoint = chunk
            .minimum
            .cmpge(bounds.least_upper_bound())
            .any()
            || bounds.minimum.cmpge(chunk.least_upper_bound()).any();
        !disjoint
    }

    /// Highest layer at which two layer-2 chunks still lie in different chunks, if any.
    ///
    /// This keys cross-chunk edge storage: an edge with crossing layer `j` connects its endpoints'
    /// layer-`j` ancestors when components are recomputed at layer `j + 1`.
    pub fn crossing_layer(&self, a: IVec3, b: IVec3) -> Option<Layer> {
        if a == b {
            return None;
        }
        let mut highest = EDIT_LAYER;
        for layer in EDIT_LAYER + 1..self.layer_count {
            let shift = (layer - EDIT_LAYER) as i32;
            if (a >> shift) != (b >> shift) {
                highest = layer;
            }
        }
        Some(highest)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
