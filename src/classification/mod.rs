//! Supervised models that are trained collectively on partitioned data.
//!
//! Every [`Classifier`] starts training by indexing the labels of all ranks
//! with a [`LabelNormalizer`](crate::preprocessing::LabelNormalizer), so
//! that internally classes are dense indices that mean the same thing on
//! every rank. Once trained, prediction is local.
use crate::collective::Communicator;
use crate::error::MlError;
use async_trait::async_trait;
use ndarray::Array2;

mod nearest_centroid;
pub use nearest_centroid::NearestCentroidClassifier;

/// The capabilities shared by all classifiers.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Trains on this rank's rows `x` and their labels `y`. A collective,
    /// every rank of `comm` must call it at the same step.
    async fn fit(
        &mut self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
        y: &[i64],
    ) -> Result<(), MlError>;

    /// Predicts the original label of every row of `x`, without any
    /// communication.
    fn predict(&self, x: &Array2<f64>) -> Result<Vec<i64>, MlError>;

    /// The fraction of rows predicted correctly over all ranks. A
    /// collective.
    async fn accuracy(
        &self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
        y: &[i64],
    ) -> Result<f64, MlError>;
}
