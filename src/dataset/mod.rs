//! A rank-local shard of a dataset that is partitioned across a group.
//!
//! A `Dataset` is either created from a [`RowSource`] and a dataset name, in
//! which case nothing is read until [`Dataset::load_equal_chunks`] is called,
//! or directly from an in-memory array, in which case it is considered
//! loaded from the start.
//!
//! When loading, each rank asks the source for the total number of rows,
//! computes its own [`Partition`] and reads only that row range.
use crate::collective::{all_gather, Communicator};
use crate::error::{DataAccessError, MlError};
use crate::partition::Partition;
use log::{debug, info};
use ndarray::Array2;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod source;
pub use source::{CsvSource, MemorySource, RowSource};

/// Where the rows of a `Dataset` come from.
#[derive(Clone)]
struct Origin {
    source: Arc<dyn RowSource>,
    name: String,
    rank: u32,
    num_workers: u32,
}

/// The shard of a dataset owned by this rank, as a dense `rows x features`
/// array.
#[derive(Clone)]
pub struct Dataset {
    origin: Option<Origin>,
    data: Array2<f64>,
    loaded: bool,
    loading_time: Duration,
    partition: Option<Partition>,
}

impl Dataset {
    /// Creates an unloaded `Dataset` for the rows of `name` in `source` that
    /// belong to the rank of `comm`.
    pub fn from_source<C: Communicator + ?Sized>(
        source: Arc<dyn RowSource>,
        name: &str,
        comm: &C,
    ) -> Self {
        Dataset {
            origin: Some(Origin {
                source,
                name: name.to_string(),
                rank: comm.rank() as u32,
                num_workers: comm.world_size() as u32,
            }),
            data: Array2::zeros((0, 0)),
            loaded: false,
            loading_time: Duration::from_secs(0),
            partition: None,
        }
    }

    /// Reads this rank's equal chunk of the dataset. Does nothing if the
    /// data is already resident, either because it was loaded before or
    /// because this `Dataset` was created from an array.
    ///
    /// ## Errors
    /// `MlError::DataAccess` if the source cannot provide the rows. The
    /// `Dataset` is left unloaded so the call may be retried.
    pub fn load_equal_chunks(&mut self) -> Result<(), MlError> {
        if self.loaded {
            return Ok(());
        }
        let origin = match &self.origin {
            Some(o) => o.clone(),
            None => return Ok(()),
        };

        let start = Instant::now();
        let total_rows = origin.source.total_rows(&origin.name)?;
        let partition =
            Partition::new(total_rows, origin.num_workers, origin.rank)?;
        debug!(
            "Rank {} reading rows {:?} of {} from `{}`",
            origin.rank,
            partition.range(),
            total_rows,
            origin.name
        );
        let data = origin.source.read_rows(
            &origin.name,
            partition.row_offset,
            partition.local_rows,
        )?;
        if data.nrows() as u64 != partition.local_rows {
            return Err(DataAccessError::ShortRead {
                offset: partition.row_offset,
                expected: partition.local_rows,
                got: data.nrows() as u64,
            }
            .into());
        }
        let elapsed = start.elapsed();

        self.data = data;
        self.partition = Some(partition);
        self.loading_time = elapsed;
        self.loaded = true;
        info!(
            "Rank {} loaded {} rows of `{}` in {:?}",
            origin.rank, partition.local_rows, origin.name, elapsed
        );
        Ok(())
    }

    /// A read-only view of the local shard. Empty until loaded.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// How long the successful load took, zero if this `Dataset` was never
    /// loaded from a source.
    pub fn loading_time(&self) -> Duration {
        self.loading_time
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The partition this shard was loaded with, `None` for in-memory data or
    /// before loading.
    pub fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    /// Number of rows in the local shard
    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of features (columns) in the local shard
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }

    /// Interprets a one column shard as integer class labels.
    ///
    /// ## Errors
    /// `DataAccessError::Malformed` if the shard has more than one column or
    /// holds a value that is not an integer.
    pub fn labels(&self) -> Result<Vec<i64>, MlError> {
        if self.data.nrows() > 0 && self.data.ncols() != 1 {
            return Err(DataAccessError::Malformed(format!(
                "labels must be a single column, got {}",
                self.data.ncols()
            ))
            .into());
        }
        self.data
            .iter()
            .map(|v| -> Result<i64, MlError> {
                if v.fract() == 0.0 && v.is_finite() {
                    Ok(*v as i64)
                } else {
                    Err(DataAccessError::Malformed(format!(
                        "label {} is not an integer",
                        v
                    ))
                    .into())
                }
            })
            .collect()
    }
}

/// The shape of a dataset over all ranks of a group. Rows are numbered
/// globally by concatenating the shards in rank order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalShape {
    /// Every rank's local row count, by rank
    pub rows_per_rank: Vec<u64>,
    /// The feature count shared by every non-empty shard, `0` if all shards
    /// are empty
    pub n_features: usize,
}

impl GlobalShape {
    pub fn total_rows(&self) -> u64 {
        self.rows_per_rank.iter().sum()
    }

    /// The global index of the first row held by `rank`
    pub fn row_offset(&self, rank: usize) -> u64 {
        self.rows_per_rank.iter().take(rank).sum()
    }

    /// The rank holding the global row `row` and the row's index in that
    /// rank's shard.
    pub fn locate(&self, row: u64) -> Option<(usize, usize)> {
        let mut offset = 0;
        for (rank, rows) in self.rows_per_rank.iter().enumerate() {
            if row < offset + rows {
                return Some((rank, (row - offset) as usize));
            }
            offset += rows;
        }
        None
    }
}

/// Exchanges the shape of every rank's shard. A collective.
///
/// ## Errors
/// `MlError::Configuration` on every rank if two non-empty shards have a
/// different number of features.
pub async fn global_shape<C: Communicator + ?Sized>(
    comm: &C,
    local: &Array2<f64>,
) -> Result<GlobalShape, MlError> {
    let shape = (local.nrows() as u64, local.ncols() as u64);
    let shapes = all_gather(comm, &shape).await?;
    let mut n_features: Option<u64> = None;
    for (rank, (rows, cols)) in shapes.iter().enumerate() {
        if *rows == 0 {
            continue;
        }
        match n_features {
            None => n_features = Some(*cols),
            Some(expected) if expected != *cols => {
                return Err(MlError::Configuration(format!(
                    "rank {} has {} features, other ranks have {}",
                    rank, cols, expected
                )))
            }
            Some(_) => {}
        }
    }
    Ok(GlobalShape {
        rows_per_rank: shapes.iter().map(|(rows, _)| *rows).collect(),
        n_features: n_features.unwrap_or(0) as usize,
    })
}

impl From<Array2<f64>> for Dataset {
    /// Wraps an array that is already resident. `load_equal_chunks` will
    /// never do anything on the result.
    fn from(data: Array2<f64>) -> Self {
        Dataset {
            origin: None,
            data,
            loaded: true,
            loading_time: Duration::from_secs(0),
            partition: None,
        }
    }
}

impl From<&[i64]> for Dataset {
    /// Wraps a slice of labels as a one column shard
    fn from(labels: &[i64]) -> Self {
        let col = Array2::from_shape_fn((labels.len(), 1), |(i, _)| {
            labels[i] as f64
        });
        Dataset::from(col)
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.origin.as_ref().map(|o| &o.name))
            .field("shape", &self.data.shape())
            .field("loaded", &self.loaded)
            .field("loading_time", &self.loading_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCommunicator;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` reads, and sleeps on each read so the
    /// recorded loading time is never zero.
    struct Flaky {
        inner: MemorySource,
        failures: AtomicUsize,
        reads: AtomicUsize,
    }

    impl RowSource for Flaky {
        fn total_rows(&self, name: &str) -> Result<u64, DataAccessError> {
            self.inner.total_rows(name)
        }

        fn read_rows(
            &self,
            name: &str,
            offset: u64,
            count: u64,
        ) -> Result<Array2<f64>, DataAccessError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(DataAccessError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk on fire",
                )));
            }
            self.inner.read_rows(name, offset, count)
        }
    }

    fn rank_rows(n: usize) -> MemorySource {
        let data = Array2::from_shape_fn((n, 2), |(i, j)| (i * 10 + j) as f64);
        MemorySource::new().with_dataset("rows", data)
    }

    #[test]
    fn test_load_equal_chunks() {
        let source: Arc<dyn RowSource> = Arc::new(rank_rows(10));
        let group = LocalCommunicator::group(4);
        let expected = [(3, 0), (3, 3), (2, 6), (2, 8)];
        for (comm, (rows, offset)) in group.iter().zip(expected.iter()) {
            let mut ds = Dataset::from_source(source.clone(), "rows", comm);
            assert!(!ds.is_loaded());
            assert_eq!(ds.n_rows(), 0);
            ds.load_equal_chunks().unwrap();
            assert_eq!(ds.n_rows(), *rows);
            assert_eq!(ds.partition().unwrap().row_offset, *offset as u64);
            assert_eq!(ds.data()[[0, 0]], (*offset * 10) as f64);
        }
    }

    #[test]
    fn test_prevent_reload() {
        let flaky = Arc::new(Flaky {
            inner: rank_rows(6),
            failures: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        });
        let group = LocalCommunicator::group(1);
        let mut ds = Dataset::from_source(flaky.clone(), "rows", &group[0]);
        assert_eq!(ds.loading_time(), Duration::from_secs(0));
        ds.load_equal_chunks().unwrap();
        let first = ds.loading_time();
        assert!(first > Duration::from_secs(0));
        let before = ds.data().clone();

        ds.load_equal_chunks().unwrap();
        assert_eq!(ds.loading_time(), first);
        assert_eq!(ds.data(), &before);
        assert_eq!(flaky.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_can_be_retried() {
        let flaky = Arc::new(Flaky {
            inner: rank_rows(6),
            failures: AtomicUsize::new(1),
            reads: AtomicUsize::new(0),
        });
        let group = LocalCommunicator::group(2);
        let mut ds = Dataset::from_source(flaky, "rows", &group[1]);
        assert!(matches!(
            ds.load_equal_chunks(),
            Err(MlError::DataAccess(DataAccessError::Io(_)))
        ));
        assert!(!ds.is_loaded());
        assert_eq!(ds.loading_time(), Duration::from_secs(0));
        ds.load_equal_chunks().unwrap();
        assert!(ds.is_loaded());
        assert_eq!(ds.n_rows(), 3);
    }

    #[test]
    fn test_missing_dataset() {
        let group = LocalCommunicator::group(1);
        let mut ds =
            Dataset::from_source(Arc::new(rank_rows(3)), "other", &group[0]);
        assert!(matches!(
            ds.load_equal_chunks(),
            Err(MlError::DataAccess(DataAccessError::NotFound(_)))
        ));
        assert!(!ds.is_loaded());
    }

    #[test]
    fn test_create_from_array() {
        let data = Array2::from_elem((4, 4), 1.0);
        let mut ds = Dataset::from(data.clone());
        assert!(ds.is_loaded());
        assert_eq!(ds.data(), &data);
        ds.load_equal_chunks().unwrap();
        assert_eq!(ds.data(), &data);
        assert_eq!(ds.loading_time(), Duration::from_secs(0));
    }

    #[tokio::test]
    async fn test_global_shape() {
        let shapes = LocalCommunicator::run(3, |comm| async move {
            let local = match comm.rank() {
                0 => Array2::<f64>::zeros((2, 3)),
                1 => Array2::<f64>::zeros((0, 0)),
                _ => Array2::<f64>::zeros((5, 3)),
            };
            global_shape(&comm, &local).await.unwrap()
        })
        .await
        .unwrap();
        for shape in shapes {
            assert_eq!(shape.rows_per_rank, vec![2, 0, 5]);
            assert_eq!(shape.n_features, 3);
            assert_eq!(shape.total_rows(), 7);
            assert_eq!(shape.row_offset(2), 2);
            assert_eq!(shape.locate(0), Some((0, 0)));
            assert_eq!(shape.locate(2), Some((2, 0)));
            assert_eq!(shape.locate(6), Some((2, 4)));
            assert_eq!(shape.locate(7), None);
        }
    }

    #[tokio::test]
    async fn test_global_shape_feature_mismatch() {
        let results = LocalCommunicator::run(2, |comm| async move {
            let local = Array2::<f64>::zeros((1, comm.rank() + 1));
            global_shape(&comm, &local).await
        })
        .await
        .unwrap();
        for r in results {
            assert!(matches!(r, Err(MlError::Configuration(_))));
        }
    }

    #[test]
    fn test_labels() {
        let ds = Dataset::from(array![[3.0], [1.0], [-2.0]]);
        assert_eq!(ds.labels().unwrap(), vec![3, 1, -2]);
        let ds = Dataset::from(array![[0.5]]);
        assert!(ds.labels().is_err());
        let ds = Dataset::from(array![[1.0, 2.0]]);
        assert!(ds.labels().is_err());
        let labels: &[i64] = &[4, 5];
        assert_eq!(Dataset::from(labels).labels().unwrap(), vec![4, 5]);
    }
}
