use crate::classification::Classifier;
use crate::collective::{all_reduce_sum, Communicator};
use crate::dataset::global_shape;
use crate::error::MlError;
use crate::kernels::assign;
use crate::preprocessing::LabelNormalizer;
use async_trait::async_trait;
use log::debug;
use ndarray::Array2;

/// Predicts the class whose mean, over the training rows of all ranks, is
/// closest to a row.
#[derive(Debug, Clone)]
pub struct NearestCentroidClassifier {
    normalizer: LabelNormalizer,
    /// One row per dense class index, `None` until fitted
    means: Option<Array2<f64>>,
    /// The number of threads used to predict
    pub n_threads: usize,
}

impl Default for NearestCentroidClassifier {
    fn default() -> Self {
        NearestCentroidClassifier {
            normalizer: LabelNormalizer::new(),
            means: None,
            n_threads: num_cpus::get(),
        }
    }
}

impl NearestCentroidClassifier {
    pub fn new() -> Self {
        NearestCentroidClassifier::default()
    }

    /// The class means in the order of [`classes`](Self::classes), if
    /// fitted.
    pub fn means(&self) -> Option<&Array2<f64>> {
        self.means.as_ref()
    }

    /// The original labels known to this classifier, ascending
    pub fn classes(&self) -> &[i64] {
        self.normalizer.classes()
    }
}

#[async_trait]
impl Classifier for NearestCentroidClassifier {
    /// Sums the rows of every class locally and combines them across ranks
    /// with a single all-reduce.
    ///
    /// ## Errors
    /// `MlError::Configuration` on every rank if no rank has any labels, if
    /// the shards have different feature counts or if any rank has a
    /// different number of labels than rows. A failed fit keeps the previous
    /// classes and means.
    async fn fit(
        &mut self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
        y: &[i64],
    ) -> Result<(), MlError> {
        let mut normalizer = LabelNormalizer::new();
        normalizer.index(comm, y).await?;
        let n_classes = normalizer.n_classes();
        if n_classes == 0 {
            return Err(MlError::Configuration(
                "no rank has any labels to fit on".into(),
            ));
        }
        let n_features = global_shape(comm, x).await?.n_features;

        // per class sums, then per class counts, then a mismatch flag
        let mut local = vec![0.0; n_classes * n_features + n_classes + 1];
        let counts_at = n_classes * n_features;
        if y.len() != x.nrows() {
            local[counts_at + n_classes] = 1.0;
        } else {
            for (row, label) in x.rows().into_iter().zip(y) {
                let class = normalizer.transform(*label)?;
                let sums = &mut local
                    [class * n_features..(class + 1) * n_features];
                for (s, v) in sums.iter_mut().zip(row.iter()) {
                    *s += v;
                }
                local[counts_at + class] += 1.0;
            }
        }

        let global = all_reduce_sum(comm, &local).await?;
        if global[counts_at + n_classes] > 0.0 {
            return Err(MlError::Configuration(
                "a rank has a different number of labels than rows".into(),
            ));
        }
        let means = Array2::from_shape_fn((n_classes, n_features), |(c, f)| {
            let count = global[counts_at + c];
            if count > 0.0 {
                global[c * n_features + f] / count
            } else {
                0.0
            }
        });
        debug!(
            "Rank {} fitted {} class means over {} features",
            comm.rank(),
            n_classes,
            n_features
        );
        self.normalizer = normalizer;
        self.means = Some(means);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Vec<i64>, MlError> {
        let means = self.means.as_ref().ok_or(MlError::NotFitted)?;
        if x.nrows() > 0 && x.ncols() != means.ncols() {
            return Err(MlError::Configuration(format!(
                "expected {} features, got {}",
                means.ncols(),
                x.ncols()
            )));
        }
        assign(x.view(), means.view(), self.n_threads)?
            .into_iter()
            .map(|(class, _)| self.normalizer.inverse(class))
            .collect()
    }

    /// Every rank takes part in the final reduction even if its own
    /// prediction failed, and then all ranks fail together.
    async fn accuracy(
        &self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
        y: &[i64],
    ) -> Result<f64, MlError> {
        let outcome = self.predict(x).and_then(|predicted| {
            if predicted.len() != y.len() {
                return Err(MlError::Configuration(format!(
                    "{} rows but {} labels",
                    predicted.len(),
                    y.len()
                )));
            }
            Ok(predicted.iter().zip(y).filter(|(p, t)| p == t).count())
        });
        let local = match &outcome {
            Ok(correct) => [*correct as f64, y.len() as f64, 0.0],
            Err(_) => [0.0, 0.0, 1.0],
        };
        let global = all_reduce_sum(comm, &local).await?;
        outcome?;
        if global[2] > 0.0 {
            return Err(MlError::Configuration(
                "accuracy failed on another rank".into(),
            ));
        }
        if global[1] == 0.0 {
            return Ok(0.0);
        }
        Ok(global[0] / global[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCommunicator;
    use ndarray::array;

    fn shard(rank: usize) -> (Array2<f64>, Vec<i64>) {
        match rank {
            0 => (array![[0.0, 0.0], [10.0, 10.0]], vec![-1, 7]),
            1 => (array![[2.0, 0.0], [12.0, 10.0], [0.0, 2.0]], vec![-1, 7, -1]),
            _ => (Array2::zeros((0, 2)), vec![]),
        }
    }

    #[tokio::test]
    async fn test_fit_predict() {
        let results = LocalCommunicator::run(3, |comm| async move {
            let (x, y) = shard(comm.rank());
            let mut clf = NearestCentroidClassifier::new();
            clf.fit(&comm, &x, &y).await.unwrap();
            let accuracy = clf.accuracy(&comm, &x, &y).await.unwrap();
            (clf, accuracy)
        })
        .await
        .unwrap();
        for (clf, accuracy) in results {
            assert_eq!(clf.classes(), &[-1, 7]);
            let means = clf.means().unwrap();
            assert!((means[[0, 0]] - 2.0 / 3.0).abs() < 1e-12);
            assert!((means[[0, 1]] - 2.0 / 3.0).abs() < 1e-12);
            assert_eq!(means.row(1).to_vec(), vec![11.0, 10.0]);
            assert_eq!(accuracy, 1.0);
            let predicted = clf.predict(&array![[9.0, 9.0], [1.0, -1.0]]).unwrap();
            assert_eq!(predicted, vec![7, -1]);
        }
    }

    #[test]
    fn test_predict_before_fit() {
        let clf = NearestCentroidClassifier::new();
        assert!(matches!(
            clf.predict(&array![[1.0]]),
            Err(MlError::NotFitted)
        ));
    }

    #[tokio::test]
    async fn test_failed_refit_keeps_previous_model() {
        let mut group = LocalCommunicator::group(1);
        let comm = group.remove(0);
        let mut clf = NearestCentroidClassifier::new();
        clf.fit(&comm, &array![[0.0], [10.0]], &[1, 2]).await.unwrap();

        let refit = clf
            .fit(&comm, &array![[0.0], [10.0], [20.0]], &[5, 6])
            .await;
        assert!(matches!(refit, Err(MlError::Configuration(_))));
        assert_eq!(clf.classes(), &[1, 2]);
        assert_eq!(clf.means().unwrap(), &array![[0.0], [10.0]]);
        assert_eq!(clf.predict(&array![[0.0], [10.0]]).unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_label_row_mismatch_fails_everywhere() {
        let results = LocalCommunicator::run(2, |comm| async move {
            let x = array![[1.0], [2.0]];
            let y = if comm.rank() == 0 { vec![1, 2] } else { vec![1] };
            let mut clf = NearestCentroidClassifier::new();
            clf.fit(&comm, &x, &y).await
        })
        .await
        .unwrap();
        for r in results {
            assert!(matches!(r, Err(MlError::Configuration(_))));
        }
    }
}
