//! Collective communication over a fixed group of ranks `[0, world_size)`.
//!
//! A [`Communicator`] only has to provide two byte level collectives, an
//! all-gather and a broadcast. The typed collectives that the rest of the
//! crate uses are built on top of those:
//!
//! - [`all_gather`]: one value from every rank, in rank order
//! - [`all_gather_counts`]: the fixed size first round of a variable length
//!   all-gather
//! - [`all_gather_variable`]: the second round, concatenating every rank's
//!   items using the counts from the first round
//! - [`all_reduce_sum`]: element-wise sum of a buffer across ranks
//! - [`broadcast`]: a value from one root rank to all ranks
//!
//! ## Lock-step
//! Every rank must call the same collectives in the same order. A rank that
//! skips one, or calls a different one, leaves the others waiting forever.
//! The provided [`Group`] implementation stamps every collective with a
//! sequence number and operation, so a mismatch that it can observe is
//! reported as `MlError::CollectiveProtocol` rather than mixing data from
//! different steps, but a rank that never shows up cannot be detected.
use crate::error::MlError;
use async_trait::async_trait;
use bincode::{deserialize, serialize};
use serde::de::DeserializeOwned;
use serde::Serialize;

mod group;
pub use group::{Envelope, Group, Op, Outbox};

mod local;
pub use local::{LocalCommunicator, LocalOutbox};

mod tcp;
pub use tcp::{TcpCommunicator, TcpOutbox};

/// A member of a fixed group of ranks that can take part in collectives.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// The rank of this member, in `[0, world_size)`
    fn rank(&self) -> usize;

    /// The number of ranks in the group
    fn world_size(&self) -> usize;

    /// Contributes `blob` and returns every rank's blob, indexed by rank.
    async fn all_gather_bytes(
        &self,
        blob: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>, MlError>;

    /// Returns the blob supplied by `root`. Only `root` needs to pass
    /// `Some`, other ranks' `blob`s are ignored.
    async fn broadcast_bytes(
        &self,
        blob: Option<Vec<u8>>,
        root: usize,
    ) -> Result<Vec<u8>, MlError>;
}

/// Gathers one `value` from every rank, returned in rank order.
pub async fn all_gather<C, T>(comm: &C, value: &T) -> Result<Vec<T>, MlError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned + Send + Sync,
{
    let blobs = comm.all_gather_bytes(serialize(value)?).await?;
    blobs
        .iter()
        .map(|blob| -> Result<T, MlError> { Ok(deserialize(blob)?) })
        .collect()
}

/// Gathers every rank's item count. This is the first round of a variable
/// length all-gather and every rank must take part, even with a count of 0.
pub async fn all_gather_counts<C>(
    comm: &C,
    count: usize,
) -> Result<Vec<usize>, MlError>
where
    C: Communicator + ?Sized,
{
    let counts: Vec<u64> = all_gather(comm, &(count as u64)).await?;
    Ok(counts.into_iter().map(|c| c as usize).collect())
}

/// The offset of each rank's segment in the concatenated receive buffer,
/// given every rank's count.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, count| {
            let offset = *acc;
            *acc += count;
            Some(offset)
        })
        .collect()
}

/// Concatenates every rank's `local` items in rank order. `counts` must be
/// the result of [`all_gather_counts`] for this exchange. Every rank checks
/// every segment against its announced count, so a mismatch is reported
/// identically on all ranks.
pub async fn all_gather_variable<C, T>(
    comm: &C,
    local: &[T],
    counts: &[usize],
) -> Result<Vec<T>, MlError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned + Send + Sync,
{
    if counts.len() != comm.world_size() {
        return Err(MlError::CollectiveProtocol(format!(
            "got {} counts for a group of {}",
            counts.len(),
            comm.world_size()
        )));
    }
    let offsets = displacements(counts);
    let total: usize = counts.iter().sum();

    let blobs = comm.all_gather_bytes(serialize(local)?).await?;
    let mut gathered = Vec::with_capacity(total);
    for (rank, blob) in blobs.iter().enumerate() {
        let segment: Vec<T> = deserialize(blob)?;
        if segment.len() != counts[rank] {
            return Err(MlError::CollectiveProtocol(format!(
                "rank {} sent {} items but announced {}",
                rank,
                segment.len(),
                counts[rank]
            )));
        }
        debug_assert_eq!(gathered.len(), offsets[rank]);
        gathered.extend(segment);
    }
    Ok(gathered)
}

/// Sums `local` element-wise across all ranks. Contributions are added in
/// rank order on every rank, so every rank gets a bit-identical result.
pub async fn all_reduce_sum<C>(
    comm: &C,
    local: &[f64],
) -> Result<Vec<f64>, MlError>
where
    C: Communicator + ?Sized,
{
    let blobs = comm.all_gather_bytes(serialize(local)?).await?;
    let mut sum: Option<Vec<f64>> = None;
    for (rank, blob) in blobs.iter().enumerate() {
        let part: Vec<f64> = deserialize(blob)?;
        match sum.as_mut() {
            None => sum = Some(part),
            Some(acc) => {
                if acc.len() != part.len() {
                    return Err(MlError::CollectiveProtocol(format!(
                        "rank {} reduced {} values, rank 0 reduced {}",
                        rank,
                        part.len(),
                        acc.len()
                    )));
                }
                for (a, p) in acc.iter_mut().zip(part) {
                    *a += p;
                }
            }
        }
    }
    Ok(sum.unwrap_or_default())
}

/// Returns the `value` supplied by `root` on every rank.
pub async fn broadcast<C, T>(
    comm: &C,
    value: Option<&T>,
    root: usize,
) -> Result<T, MlError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned + Send + Sync,
{
    let blob = match value {
        Some(v) if comm.rank() == root => Some(serialize(v)?),
        _ => None,
    };
    let received = comm.broadcast_bytes(blob, root).await?;
    Ok(deserialize(&received)?)
}

/// Waits until every rank has reached this point.
pub async fn barrier<C>(comm: &C) -> Result<(), MlError>
where
    C: Communicator + ?Sized,
{
    comm.all_gather_bytes(Vec::new()).await?;
    Ok(())
}
