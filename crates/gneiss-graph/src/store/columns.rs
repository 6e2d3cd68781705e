use crate::node_id::Layer;

/// The column families of a node row.
///
/// Hierarchy columns (`Parent`, `Children`) and lineage columns (`FormerIds`, `NewIds`,
/// `OperationId`) hold archived ID lists; connectivity columns hold compressed edge lists keyed
/// by the crossing layer; `Lock` is the single non-versioned cell, compare-and-set by the root
/// lock protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Column {
    Parent,
    Children,
    AtomicEdges,
    CrossEdges(Layer),
    FormerIds,
    NewIds,
    OperationId,
    Lock,
}

impl Column {
    pub const TAG_LEN: usize = 2;

    /// Two key bytes: family, then qualifier (the layer for cross-chunk edges).
    pub const fn tag(self) -> [u8; 2] {
        match self {
            Column::Parent => [0, 0],
            Column::Children => [1, 0],
            Column::AtomicEdges => [2, 0],
            Column::CrossEdges(layer) => [3, layer],
            Column::FormerIds => [4, 0],
            Column::NewIds => [5, 0],
            Column::OperationId => [6, 0],
            Column::Lock => [7, 0],
        }
    }

    pub const fn from_tag(tag: [u8; 2]) -> Option<Self> {
        match tag {
            [0, 0] => Some(Column::Parent),
            [1, 0] => Some(Column::Children),
            [2, 0] => Some(Column::AtomicEdges),
            [3, layer] => Some(Column::CrossEdges(layer)),
            [4, 0] => Some(Column::FormerIds),
            [5, 0] => Some(Column::NewIds),
            [6, 0] => Some(Column::OperationId),
            [7, 0] => Some(Column::Lock),
            _ => None,
        }
    }
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
    fn tags_round_trip() {
        let columns = [
            Column::Parent,
            Column::Children,
            Column::AtomicEdges,
            Column::CrossEdges(2),
            Column::CrossEdges(9),
            Column::FormerIds,
            Column::NewIds,
            Column::OperationId,
            Column::Lock,
        ];
        for column in columns {
            assert_eq!(Column::from_tag(column.tag()), Some(column));
        }
        assert_eq!(Column::from_tag([9, 0]), None);
    }
}
