use blake3::hash;
use tracing::trace;

use super::{error::Error, hex::HexDisplayExt};

/// Returns the partition, in `[0, partitions)`, that owns the primitive with
/// the given name.
///
/// The result depends on nothing but the name and the partition count, so
/// every session opened for a primitive lands on the same server for as long
/// as the topology holds. Nothing is promised across topology changes.
pub fn route(name: &str, partitions: usize) -> Result<usize, Error> {
    if partitions == 0 {
        return Err(Error::InvalidTopology);
    }
    let digest = hash(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    let index = (u64::from_le_bytes(prefix) % partitions as u64) as usize;
    trace!(
        name,
        partitions,
        index,
        digest = %prefix.hex(),
        "routed primitive to partition"
    );
    Ok(index)
}

/// Picks the connection that owns `name` out of the cluster's partitions.
pub fn select<'a, T>(name: &str, partitions: &'a [T]) -> Result<&'a T, Error> {
    let index = route(name, partitions.len())?;
    Ok(&partitions[index])
}
