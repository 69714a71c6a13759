//! # shard_ml
//!
//! Machine learning on datasets that are partitioned across a fixed group of
//! cooperating processes.
//!
//! Each process (a rank) loads only its own contiguous chunk of a dataset
//! with [`Dataset::load_equal_chunks`](dataset::Dataset::load_equal_chunks).
//! Models are then trained collectively: every rank calls `fit` on its shard
//! and the ranks exchange just enough through a
//! [`Communicator`](collective::Communicator) that they all end up with the
//! same model, which can then predict locally.
//!
//! - [`partition`]: who owns which rows
//! - [`dataset`]: loading a rank's rows from a [`RowSource`](dataset::RowSource)
//! - [`collective`]: the collectives, in process or over TCP
//! - [`preprocessing`]: globally consistent label indexing
//! - [`clustering`]: distributed k-means
//! - [`classification`]: a distributed nearest centroid classifier
//!
//! ## Example
//! ```no_run
//! use shard_ml::clustering::{Clusterer, KMeans, KMeansConfig};
//! use shard_ml::collective::TcpCommunicator;
//! use shard_ml::dataset::{CsvSource, Dataset};
//! use shard_ml::error::MlError;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), MlError> {
//! let comm =
//!     TcpCommunicator::connect("127.0.0.1:9000", "127.0.0.1:0", 3).await?;
//! let source = Arc::new(CsvSource::new("data"));
//! let mut points = Dataset::from_source(source, "points", &comm);
//! points.load_equal_chunks()?;
//!
//! let mut kmeans = KMeans::new(KMeansConfig::new(4));
//! let report = kmeans.fit(&comm, points.data()).await?;
//! println!("{:?}", report.state);
//! # Ok(())
//! # }
//! ```
pub mod classification;
pub mod clustering;
pub mod collective;
pub mod dataset;
pub mod error;
pub mod kernels;
pub mod network;
pub mod partition;
pub mod preprocessing;
