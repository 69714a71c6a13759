//! Lloyd's k-means over a dataset that is partitioned across ranks.
//!
//! Each iteration assigns the local rows to their nearest centroid, sums the
//! rows and counts of every cluster locally, and combines those with one
//! all-reduce. Every rank then computes the same new centroids from the same
//! reduced values, so they also agree on convergence without any further
//! communication.
use crate::clustering::{
    Clusterer, FitReport, Initialization, KMeansConfig, KMeansState,
};
use crate::collective::{
    all_gather, all_gather_counts, all_gather_variable, all_reduce_sum,
    broadcast, Communicator,
};
use crate::dataset::{global_shape, GlobalShape};
use crate::error::MlError;
use crate::kernels::{assign, squared_distance};
use async_trait::async_trait;
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A k-means model, see [`KMeansConfig`] for its options.
#[derive(Debug, Clone)]
pub struct KMeans {
    config: KMeansConfig,
    centroids: Option<Array2<f64>>,
    state: KMeansState,
    /// The number of threads used to assign rows to centroids
    pub n_threads: usize,
}

impl KMeans {
    pub fn new(config: KMeansConfig) -> Self {
        KMeans {
            config,
            centroids: None,
            state: KMeansState::Uninitialized,
            n_threads: num_cpus::get(),
        }
    }

    pub fn config(&self) -> &KMeansConfig {
        &self.config
    }

    /// The trained centroids, one per row, if fitted
    pub fn centroids(&self) -> Option<&Array2<f64>> {
        self.centroids.as_ref()
    }

    pub fn state(&self) -> KMeansState {
        self.state
    }

    /// Runs the iterations starting from the given centroids instead of
    /// initializing them. `initial` must be the same on every rank.
    ///
    /// ## Errors
    /// `MlError::Configuration` if `initial` does not have `k` rows of the
    /// dataset's feature count.
    pub async fn fit_from(
        &mut self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
        initial: Array2<f64>,
    ) -> Result<FitReport, MlError> {
        self.config.validate()?;
        self.reset();
        let shape = self.agree_on_shape(comm, x).await?;
        if initial.nrows() != self.config.k
            || initial.ncols() != shape.n_features
        {
            return Err(MlError::Configuration(format!(
                "initial centroids are {}x{}, expected {}x{}",
                initial.nrows(),
                initial.ncols(),
                self.config.k,
                shape.n_features
            )));
        }
        self.state = KMeansState::CentroidsInitialized;
        self.iterate(comm, x, initial).await
    }

    fn reset(&mut self) {
        self.centroids = None;
        self.state = KMeansState::Uninitialized;
    }

    /// Exchanges the shard shapes and checks that there are at least `k`
    /// rows in total.
    async fn agree_on_shape(
        &self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
    ) -> Result<GlobalShape, MlError> {
        let shape = global_shape(comm, x).await?;
        if self.config.k as u64 > shape.total_rows() {
            return Err(MlError::Configuration(format!(
                "k = {} but the dataset only has {} rows",
                self.config.k,
                shape.total_rows()
            )));
        }
        Ok(shape)
    }

    /// Draws `k` distinct global rows. Every rank draws the same indices
    /// from the shared seed, and the rows are gathered from the ranks that
    /// hold them.
    async fn init_random(
        &self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
        shape: &GlobalShape,
        rng: &mut ChaCha8Rng,
    ) -> Result<Array2<f64>, MlError> {
        let k = self.config.k;
        let picks = sample(rng, shape.total_rows() as usize, k).into_vec();
        let offset = shape.row_offset(comm.rank()) as usize;
        let owned: Vec<(u64, Vec<f64>)> = picks
            .iter()
            .enumerate()
            .filter(|(_, row)| **row >= offset && **row < offset + x.nrows())
            .map(|(slot, row)| (slot as u64, x.row(row - offset).to_vec()))
            .collect();

        let counts = all_gather_counts(comm, owned.len()).await?;
        let gathered = all_gather_variable(comm, &owned, &counts).await?;
        let mut centroids = Array2::zeros((k, shape.n_features));
        for (slot, row) in gathered {
            centroids.row_mut(slot as usize).assign(&Array1::from(row));
        }
        Ok(centroids)
    }

    /// k-means++ seeding. Each round gathers every rank's sum of squared
    /// distances to the closest centroid so far, and all ranks use the
    /// shared random stream to pick the rank and then the row of the next
    /// centroid, which that rank broadcasts.
    async fn init_plus_plus(
        &self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
        shape: &GlobalShape,
        rng: &mut ChaCha8Rng,
    ) -> Result<Array2<f64>, MlError> {
        let k = self.config.k;
        let total_rows = shape.total_rows();
        let mut centroids = Array2::zeros((k, shape.n_features));

        let first = rng.gen_range(0..total_rows);
        let row = fetch_row(comm, x, shape, first).await?;
        centroids.row_mut(0).assign(&Array1::from(row));
        let mut closest: Vec<f64> = x
            .rows()
            .into_iter()
            .map(|r| squared_distance(r, centroids.row(0)))
            .collect();

        for c in 1..k {
            let local_weight: f64 = closest.iter().sum();
            let weights: Vec<f64> = all_gather(comm, &local_weight).await?;
            let total_weight: f64 = weights.iter().sum();
            let row = if total_weight > 0.0 {
                let target = rng.gen::<f64>() * total_weight;
                let (owner, remaining) = weighted_choice(&weights, target);
                let mine = if owner == comm.rank() {
                    let (i, _) = weighted_choice(&closest, remaining);
                    Some(x.row(i).to_vec())
                } else {
                    None
                };
                broadcast(comm, mine.as_ref(), owner).await?
            } else {
                // every row is already a centroid
                let pick = rng.gen_range(0..total_rows);
                fetch_row(comm, x, shape, pick).await?
            };
            centroids.row_mut(c).assign(&Array1::from(row));
            for (dist, r) in closest.iter_mut().zip(x.rows()) {
                let d = squared_distance(r, centroids.row(c));
                if d < *dist {
                    *dist = d;
                }
            }
        }
        Ok(centroids)
    }

    /// The assignment and update loop.
    async fn iterate(
        &mut self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
        mut centroids: Array2<f64>,
    ) -> Result<FitReport, MlError> {
        let k = self.config.k;
        let n_features = centroids.ncols();
        let patience = self.config.empty_cluster_patience;
        // per cluster sums, then per cluster counts, then the inertia
        let counts_at = k * n_features;
        let inertia_at = counts_at + k;

        let mut empty_streak = vec![0usize; k];
        let mut iterations = 0;
        let mut inertia = 0.0;
        let mut state = KMeansState::IterationLimitReached;
        while iterations < self.config.max_iterations {
            iterations += 1;
            let mut assignments =
                assign(x.view(), centroids.view(), self.n_threads)?;

            let mut local = vec![0.0; inertia_at + 1];
            for (row, (c, dist)) in x.rows().into_iter().zip(&assignments) {
                let sums = &mut local[c * n_features..(c + 1) * n_features];
                for (s, v) in sums.iter_mut().zip(row.iter()) {
                    *s += v;
                }
                local[counts_at + c] += 1.0;
                local[inertia_at] += dist;
            }
            let global = all_reduce_sum(comm, &local).await?;
            inertia = global[inertia_at];

            let previous = centroids.clone();
            let mut stale = Vec::new();
            for c in 0..k {
                let count = global[counts_at + c];
                if count > 0.0 {
                    empty_streak[c] = 0;
                    for f in 0..n_features {
                        centroids[[c, f]] = global[c * n_features + f] / count;
                    }
                } else {
                    empty_streak[c] += 1;
                    if patience > 0 && empty_streak[c] >= patience {
                        stale.push(c);
                    }
                }
            }
            let shift = previous
                .rows()
                .into_iter()
                .zip(centroids.rows())
                .map(|(a, b)| squared_distance(a, b).sqrt())
                .fold(0.0, f64::max);
            debug!(
                "Rank {} iteration {}: inertia {}, largest shift {}",
                comm.rank(),
                iterations,
                inertia,
                shift
            );

            if !stale.is_empty() {
                warn!(
                    "Clusters {:?} were empty for {} iterations, relocating",
                    stale, patience
                );
                relocate(comm, x, &mut centroids, &mut assignments, &stale)
                    .await?;
                for c in stale {
                    empty_streak[c] = 0;
                }
                continue;
            }
            if shift < self.config.tolerance {
                state = KMeansState::Converged;
                break;
            }
        }

        info!(
            "Rank {} finished k-means with k = {} after {} iterations: {:?}",
            comm.rank(),
            k,
            iterations,
            state
        );
        self.centroids = Some(centroids);
        self.state = state;
        Ok(FitReport {
            state,
            iterations,
            inertia,
        })
    }
}

#[async_trait]
impl Clusterer for KMeans {
    /// Initializes the centroids with the configured strategy and iterates
    /// until convergence or until `max_iterations` is reached.
    ///
    /// ## Errors
    /// `MlError::Configuration` on every rank, before any other collective,
    /// if the configuration is invalid. Also on every rank if the shards have
    /// different feature counts or there are fewer than `k` rows in total.
    async fn fit(
        &mut self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
    ) -> Result<FitReport, MlError> {
        self.config.validate()?;
        self.reset();
        let shape = self.agree_on_shape(comm, x).await?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let centroids = match self.config.initialization {
            Initialization::Random => {
                self.init_random(comm, x, &shape, &mut rng).await?
            }
            Initialization::KMeansPlusPlus => {
                self.init_plus_plus(comm, x, &shape, &mut rng).await?
            }
        };
        self.state = KMeansState::CentroidsInitialized;
        debug!(
            "Rank {} initialized {} centroids with {}",
            comm.rank(),
            self.config.k,
            self.config.initialization
        );
        self.iterate(comm, x, centroids).await
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>, MlError> {
        let centroids = self.centroids.as_ref().ok_or(MlError::NotFitted)?;
        if x.nrows() > 0 && x.ncols() != centroids.ncols() {
            return Err(MlError::Configuration(format!(
                "expected {} features, got {}",
                centroids.ncols(),
                x.ncols()
            )));
        }
        Ok(assign(x.view(), centroids.view(), self.n_threads)?
            .into_iter()
            .map(|(c, _)| c)
            .collect())
    }
}

/// Broadcasts the global row `row` from the rank that holds it.
async fn fetch_row(
    comm: &dyn Communicator,
    x: &Array2<f64>,
    shape: &GlobalShape,
    row: u64,
) -> Result<Vec<f64>, MlError> {
    let (owner, local) = shape.locate(row).ok_or_else(|| {
        MlError::Configuration(format!("row {} is out of range", row))
    })?;
    let mine = if owner == comm.rank() {
        Some(x.row(local).to_vec())
    } else {
        None
    };
    broadcast(comm, mine.as_ref(), owner).await
}

/// Walks `weights` until `target` falls inside one, returning its index and
/// what is left of `target` at that point. Zero weights are never chosen. If
/// rounding carries `target` past the end, the last positive weight is
/// chosen.
fn weighted_choice(weights: &[f64], target: f64) -> (usize, f64) {
    let mut remaining = target;
    let mut last = (0, 0.0);
    for (i, w) in weights.iter().enumerate() {
        if *w <= 0.0 {
            continue;
        }
        if remaining < *w {
            return (i, remaining);
        }
        remaining -= w;
        last = (i, *w);
    }
    last
}

/// Moves each cluster in `clusters` to the row farthest from its assigned
/// centroid over all ranks. Ties go to the lower rank, then the lower row.
/// A row that was taken has its distance zeroed so the next cluster gets a
/// different one.
async fn relocate(
    comm: &dyn Communicator,
    x: &Array2<f64>,
    centroids: &mut Array2<f64>,
    assignments: &mut [(usize, f64)],
    clusters: &[usize],
) -> Result<(), MlError> {
    for &cluster in clusters {
        let farthest = assignments.iter().enumerate().fold(
            None,
            |best: Option<(usize, f64)>, (i, (_, dist))| match best {
                Some((_, b)) if b >= *dist => best,
                _ => Some((i, *dist)),
            },
        );
        let proposal = farthest.map(|(_, dist)| dist);
        let proposals: Vec<Option<f64>> = all_gather(comm, &proposal).await?;
        let winner = proposals.iter().enumerate().fold(
            None,
            |best: Option<(usize, f64)>, (rank, p)| match (best, p) {
                (_, None) => best,
                (Some((_, b)), Some(d)) if b >= *d => best,
                (_, Some(d)) => Some((rank, *d)),
            },
        );
        let (owner, _) = winner.ok_or_else(|| {
            MlError::Configuration("no rank has rows to relocate to".into())
        })?;

        let mine = match farthest {
            Some((i, _)) if owner == comm.rank() => {
                assignments[i] = (cluster, 0.0);
                Some(x.row(i).to_vec())
            }
            _ => None,
        };
        let row: Vec<f64> = broadcast(comm, mine.as_ref(), owner).await?;
        centroids.row_mut(cluster).assign(&Array1::from(row));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCommunicator;
    use ndarray::array;

    fn shard(rank: usize) -> Array2<f64> {
        if rank == 0 {
            array![[0.0], [1.0]]
        } else {
            array![[10.0], [11.0]]
        }
    }

    #[test]
    fn test_weighted_choice() {
        assert_eq!(weighted_choice(&[1.0, 0.0, 3.0], 0.5), (0, 0.5));
        assert_eq!(weighted_choice(&[1.0, 0.0, 3.0], 1.0), (2, 0.0));
        assert_eq!(weighted_choice(&[1.0, 0.0, 3.0], 3.5), (2, 2.5));
        assert_eq!(weighted_choice(&[0.0, 2.0, 0.0], 9.0), (1, 2.0));
    }

    #[test]
    fn test_predict_before_fit() {
        let km = KMeans::new(KMeansConfig::new(2));
        assert_eq!(km.state(), KMeansState::Uninitialized);
        assert!(matches!(km.predict(&array![[0.0]]), Err(MlError::NotFitted)));
    }

    #[tokio::test]
    async fn test_empty_cluster_keeps_centroid() {
        let results = LocalCommunicator::run(2, |comm| async move {
            let mut config = KMeansConfig::new(3);
            config.empty_cluster_patience = 0;
            let mut km = KMeans::new(config);
            let initial = array![[0.5], [10.5], [100.0]];
            let report = km
                .fit_from(&comm, &shard(comm.rank()), initial)
                .await
                .unwrap();
            (km, report)
        })
        .await
        .unwrap();
        for (km, report) in results {
            assert_eq!(report.state, KMeansState::Converged);
            assert_eq!(report.iterations, 1);
            assert_eq!(report.inertia, 1.0);
            assert_eq!(km.centroids().unwrap(), &array![[0.5], [10.5], [100.0]]);
        }
    }

    #[tokio::test]
    async fn test_stale_cluster_is_relocated() {
        let results = LocalCommunicator::run(2, |comm| async move {
            let mut config = KMeansConfig::new(3);
            config.empty_cluster_patience = 1;
            let mut km = KMeans::new(config);
            let initial = array![[0.5], [10.5], [100.0]];
            let report = km
                .fit_from(&comm, &shard(comm.rank()), initial)
                .await
                .unwrap();
            (km, report)
        })
        .await
        .unwrap();
        for (km, report) in results {
            assert_eq!(report.state, KMeansState::Converged);
            assert_eq!(report.iterations, 3);
            assert_eq!(report.inertia, 0.5);
            assert_eq!(km.centroids().unwrap(), &array![[1.0], [10.5], [0.0]]);
            assert_eq!(km.predict(&array![[0.1], [9.0]]).unwrap(), vec![2, 1]);
        }
    }

    #[tokio::test]
    async fn test_several_stale_clusters_get_distinct_rows() {
        let results = LocalCommunicator::run(2, |comm| async move {
            let mut config = KMeansConfig::new(4);
            config.empty_cluster_patience = 1;
            config.max_iterations = 1;
            let initial = array![[0.5], [10.5], [100.0], [200.0]];
            let x = shard(comm.rank());

            let mut relocated = KMeans::new(config.clone());
            let first = relocated
                .fit_from(&comm, &x, initial.clone())
                .await
                .unwrap();

            config.max_iterations = 100;
            let mut converged = KMeans::new(config);
            let report = converged.fit_from(&comm, &x, initial).await.unwrap();
            (relocated, first, converged, report)
        })
        .await
        .unwrap();
        for (relocated, first, converged, report) in results {
            // both empty clusters moved in the same iteration, to different rows
            assert_eq!(first.state, KMeansState::IterationLimitReached);
            assert_eq!(
                relocated.centroids().unwrap(),
                &array![[0.5], [10.5], [0.0], [1.0]]
            );

            assert_eq!(report.state, KMeansState::Converged);
            assert_eq!(report.iterations, 4);
            assert_eq!(report.inertia, 0.0);
            assert_eq!(
                converged.centroids().unwrap(),
                &array![[10.0], [11.0], [0.0], [1.0]]
            );
        }
    }

    #[tokio::test]
    async fn test_plus_plus_with_identical_rows() {
        let results = LocalCommunicator::run(3, |comm| async move {
            let x = match comm.rank() {
                0 => array![[2.0], [2.0]],
                1 => array![[2.0]],
                _ => Array2::zeros((0, 1)),
            };
            let mut config = KMeansConfig::new(3);
            config.initialization = Initialization::KMeansPlusPlus;
            let mut km = KMeans::new(config);
            let report = km.fit(&comm, &x).await.unwrap();
            (km, report)
        })
        .await
        .unwrap();
        for (km, report) in results {
            assert_eq!(report.state, KMeansState::Converged);
            assert_eq!(report.iterations, 1);
            assert_eq!(report.inertia, 0.0);
            assert_eq!(km.centroids().unwrap(), &array![[2.0], [2.0], [2.0]]);
            assert_eq!(km.predict(&array![[5.0]]).unwrap(), vec![0]);
        }
    }

    #[tokio::test]
    async fn test_k_larger_than_dataset() {
        let results = LocalCommunicator::run(2, |comm| async move {
            let mut km = KMeans::new(KMeansConfig::new(5));
            km.fit(&comm, &shard(comm.rank())).await
        })
        .await
        .unwrap();
        for r in results {
            assert!(matches!(r, Err(MlError::Configuration(_))));
        }
    }

    #[tokio::test]
    async fn test_iteration_limit_is_not_an_error() {
        let results = LocalCommunicator::run(2, |comm| async move {
            let mut config = KMeansConfig::new(2);
            config.max_iterations = 1;
            let mut km = KMeans::new(config);
            km.fit_from(&comm, &shard(comm.rank()), array![[0.0], [1.0]])
                .await
                .unwrap()
        })
        .await
        .unwrap();
        for report in results {
            assert_eq!(report.state, KMeansState::IterationLimitReached);
            assert_eq!(report.iterations, 1);
        }
    }
}
