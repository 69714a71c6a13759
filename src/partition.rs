//! Equal, contiguous partitioning of a dataset's rows across ranks.
//!
//! Every rank computes the partition independently from globally known
//! inputs (the total row count from the source's metadata and the size of
//! the group), so no communication is needed to agree on who owns what.
use crate::error::MlError;
use std::ops::Range;

/// The chunk of a dataset owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// The number of rows in the whole dataset
    pub total_rows: u64,
    /// The number of ranks the rows are divided between
    pub num_workers: u32,
    /// The rank that owns this chunk
    pub rank: u32,
    /// The number of rows owned by `rank`
    pub local_rows: u64,
    /// The global index of the first row owned by `rank`
    pub row_offset: u64,
}

/// Returns `(local_rows, row_offset)` for `rank`.
///
/// The first `total_rows % num_workers` ranks get one extra row, so chunk
/// sizes differ by at most one. Ranks beyond `total_rows` get empty chunks.
///
/// `num_workers` must be non-zero; use [`Partition::new`] for a checked
/// version.
pub fn partition(total_rows: u64, num_workers: u32, rank: u32) -> (u64, u64) {
    let workers = u64::from(num_workers);
    let rank = u64::from(rank);
    let base = total_rows / workers;
    let remainder = total_rows % workers;
    let local_rows = if rank < remainder { base + 1 } else { base };
    let row_offset = rank * base + rank.min(remainder);
    (local_rows, row_offset)
}

impl Partition {
    /// Computes the partition owned by `rank` in a group of `num_workers`.
    ///
    /// ## Errors
    /// `MlError::Configuration` if `num_workers` is zero or `rank` is not in
    /// `[0, num_workers)`.
    pub fn new(
        total_rows: u64,
        num_workers: u32,
        rank: u32,
    ) -> Result<Self, MlError> {
        if num_workers == 0 {
            return Err(MlError::Configuration(
                "num_workers must be greater than zero".into(),
            ));
        }
        if rank >= num_workers {
            return Err(MlError::Configuration(format!(
                "rank {} is out of range for {} workers",
                rank, num_workers
            )));
        }
        let (local_rows, row_offset) =
            partition(total_rows, num_workers, rank);
        Ok(Partition {
            total_rows,
            num_workers,
            rank,
            local_rows,
            row_offset,
        })
    }

    /// The global row range `[row_offset, row_offset + local_rows)`
    pub fn range(&self) -> Range<u64> {
        self.row_offset..self.row_offset + self.local_rows
    }

    /// The rank that owns the given global row, or `None` if `row` is past
    /// the end of the dataset.
    pub fn owner_of(total_rows: u64, num_workers: u32, row: u64) -> Option<u32> {
        if num_workers == 0 || row >= total_rows {
            return None;
        }
        let workers = u64::from(num_workers);
        let base = total_rows / workers;
        let remainder = total_rows % workers;
        let big = (base + 1) * remainder;
        let rank = if row < big {
            row / (base + 1)
        } else {
            remainder + (row - big) / base
        };
        Some(rank as u32)
    }
}
