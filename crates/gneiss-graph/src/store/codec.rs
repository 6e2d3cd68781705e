use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{archived_root, AlignedVec, Archive, Deserialize, Infallible};

/// Archives `value` into an owned, aligned buffer.
pub fn to_bytes<T>(value: &T) -> AlignedVec
where
    T: rkyv::Serialize<AllocSerializer<1024>>,
{
    let mut serializer = AllocSerializer::<1024>::default();
    serializer.serialize_value(value).unwrap();
    serializer.into_serializer().into_inner()
}

/// Deserializes an archived `T` from raw cell bytes.
///
/// Stable sled makes no alignment guarantee for `IVec` buffers, so the bytes are first copied
/// into an [`AlignedVec`] before interpreting them as an archive root.
pub fn from_bytes<T>(bytes: &[u8]) -> T
where
    T: Archive,
    T::Archived: Deserialize<T, Infallible>,
{
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let archived = unsafe { archived_root::<T>(&aligned) };
    archived.deserialize(&mut Infallible).unwrap()
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
    use crate::node_id::NodeId;

    #[test]
    fn round_trip_through_unaligned_bytes() {
        let ids = vec![NodeId(1), NodeId(u64::MAX), NodeId(42)];
        let bytes = to_bytes(&ids);

        // Force a misaligned source buffer, like an IVec fetched from disk.
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(bytes.as_slice());
        let decoded: Vec<NodeId> = from_bytes(&shifted[1..]);
        assert_eq!(decoded, ids);
    }
}
