//! Unsupervised models that are trained collectively on partitioned data.
//!
//! Each rank only ever holds its own shard, but after every collective step
//! all ranks hold the same model, so prediction is local.
use crate::collective::Communicator;
use crate::error::MlError;
use async_trait::async_trait;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod kmeans;
pub use kmeans::KMeans;

/// The capabilities shared by all clusterers.
#[async_trait]
pub trait Clusterer: Send + Sync {
    /// Trains on this rank's rows `x`. A collective, every rank of `comm`
    /// must call it at the same step.
    async fn fit(
        &mut self,
        comm: &dyn Communicator,
        x: &Array2<f64>,
    ) -> Result<FitReport, MlError>;

    /// The cluster of every row of `x`, without any communication.
    fn predict(&self, x: &Array2<f64>) -> Result<Vec<usize>, MlError>;
}

/// How the first centroids are chosen.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Initialization {
    /// `k` distinct rows drawn uniformly from the whole dataset
    Random,
    /// Each next centroid drawn with probability proportional to the squared
    /// distance to the closest centroid chosen so far
    KMeansPlusPlus,
}

impl Default for Initialization {
    fn default() -> Self {
        Initialization::Random
    }
}

impl fmt::Display for Initialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initialization::Random => write!(f, "random"),
            Initialization::KMeansPlusPlus => write!(f, "kmeans++"),
        }
    }
}

impl FromStr for Initialization {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(Initialization::Random),
            "kmeans++" | "k-means++" => Ok(Initialization::KMeansPlusPlus),
            other => Err(MlError::Configuration(format!(
                "unsupported initialization `{}`",
                other
            ))),
        }
    }
}

/// Configuration of a k-means run. Must be identical on every rank.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KMeansConfig {
    /// The number of clusters
    pub k: usize,
    /// The most assignment and update steps to run
    pub max_iterations: usize,
    pub initialization: Initialization,
    /// Converged once no centroid moves by this distance or more
    pub tolerance: f64,
    /// Seeds the random choices, which every rank makes identically
    pub seed: u64,
    /// A cluster that is empty for this many consecutive iterations is moved
    /// to the point farthest from its centroid. `0` never moves it.
    pub empty_cluster_patience: usize,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        KMeansConfig {
            k: 8,
            max_iterations: 100,
            initialization: Initialization::default(),
            tolerance: 1e-3,
            seed: 42,
            empty_cluster_patience: 3,
        }
    }
}

impl KMeansConfig {
    /// The default configuration with `k` clusters
    pub fn new(k: usize) -> Self {
        KMeansConfig {
            k,
            ..KMeansConfig::default()
        }
    }

    /// Checks the values that do not depend on any data. Since the
    /// configuration is the same on every rank, so is the result.
    pub fn validate(&self) -> Result<(), MlError> {
        if self.k == 0 {
            return Err(MlError::Configuration(
                "k must be greater than zero".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(MlError::Configuration(
                "max_iterations must be greater than zero".into(),
            ));
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(MlError::Configuration(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Where a k-means model is in its life.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KMeansState {
    Uninitialized,
    CentroidsInitialized,
    /// The last update moved no centroid by `tolerance` or more
    Converged,
    /// `max_iterations` ran out before convergence. Not an error, the
    /// centroids are still usable.
    IterationLimitReached,
}

/// What a call to `fit` ended with. Identical on every rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    pub state: KMeansState,
    /// The number of assignment and update steps that ran
    pub iterations: usize,
    /// The sum over all rows of all ranks of the squared distance to the
    /// assigned centroid, at the last assignment step
    pub inertia: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialization_from_str() {
        assert_eq!(
            "random".parse::<Initialization>().unwrap(),
            Initialization::Random
        );
        assert_eq!(
            " KMeans++ ".parse::<Initialization>().unwrap(),
            Initialization::KMeansPlusPlus
        );
        assert!("forgy".parse::<Initialization>().is_err());
        assert_eq!(Initialization::KMeansPlusPlus.to_string(), "kmeans++");
    }

    #[test]
    fn test_validate() {
        assert!(KMeansConfig::new(3).validate().is_ok());
        assert!(KMeansConfig::new(0).validate().is_err());
        let mut config = KMeansConfig::new(2);
        config.max_iterations = 0;
        assert!(config.validate().is_err());
        config.max_iterations = 5;
        config.tolerance = 0.0;
        assert!(config.validate().is_err());
        config.tolerance = f64::NAN;
        assert!(config.validate().is_err());
    }
}
