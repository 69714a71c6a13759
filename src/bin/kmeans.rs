use clap::Parser;
use log::{info, Level};
use shard_ml::clustering::{Clusterer, Initialization, KMeans, KMeansConfig};
use shard_ml::collective::{barrier, Communicator, TcpCommunicator};
use shard_ml::dataset::{CsvSource, Dataset};
use shard_ml::error::MlError;
use std::sync::Arc;

/// Joins a group through the registration server, loads this process's equal
/// chunk of a CSV dataset and clusters the whole dataset with k-means
#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// The IP:Port at which the registration server is running
    #[clap(
        short = 's',
        long = "server_addr",
        default_value = "127.0.0.1:9000"
    )]
    server_address: String,
    /// The IP:Port at which this process accepts connections from the
    /// others. Port 0 lets the OS pick one.
    #[clap(short = 'm', long = "my_addr", default_value = "127.0.0.1:0")]
    my_address: String,
    /// The number of processes in the group
    #[clap(short = 'n', long = "num_nodes", default_value = "1")]
    num_nodes: usize,
    /// The directory holding `<dataset>.csv`
    #[clap(short = 'd', long = "data_dir", default_value = ".")]
    data_dir: String,
    /// The name of the dataset
    #[clap(long = "dataset")]
    dataset: String,
    /// Whether the first line of the CSV file is a header
    #[clap(long = "headers")]
    has_headers: bool,
    /// The number of clusters
    #[clap(short = 'k', long = "k", default_value = "8")]
    k: usize,
    #[clap(long = "max_iterations", default_value = "100")]
    max_iterations: usize,
    /// `random` or `kmeans++`
    #[clap(long = "init", default_value = "random")]
    init: String,
    #[clap(long = "tolerance", default_value = "0.001")]
    tolerance: f64,
    /// Must be the same for every process
    #[clap(long = "seed", default_value = "42")]
    seed: u64,
    /// Iterations a cluster may stay empty before it is moved, 0 to never
    /// move it
    #[clap(long = "patience", default_value = "3")]
    empty_cluster_patience: usize,
}

#[tokio::main]
async fn main() -> Result<(), MlError> {
    let opts: Opts = Opts::parse();
    simple_logger::init_with_level(Level::Info)
        .map_err(|e| MlError::Configuration(e.to_string()))?;
    let config = KMeansConfig {
        k: opts.k,
        max_iterations: opts.max_iterations,
        initialization: opts.init.parse::<Initialization>()?,
        tolerance: opts.tolerance,
        seed: opts.seed,
        empty_cluster_patience: opts.empty_cluster_patience,
    };
    config.validate()?;

    let comm = TcpCommunicator::connect(
        &opts.server_address,
        &opts.my_address,
        opts.num_nodes,
    )
    .await?;
    let source = Arc::new(
        CsvSource::new(&opts.data_dir).has_headers(opts.has_headers),
    );
    let mut points = Dataset::from_source(source, &opts.dataset, &comm);
    points.load_equal_chunks()?;
    info!(
        "Rank {} loaded {} rows in {:?}",
        comm.rank(),
        points.n_rows(),
        points.loading_time()
    );

    let mut kmeans = KMeans::new(config);
    let report = kmeans.fit(&comm, points.data()).await?;
    if comm.rank() == 0 {
        println!(
            "{:?} after {} iterations, inertia {}",
            report.state, report.iterations, report.inertia
        );
        if let Some(centroids) = kmeans.centroids() {
            for centroid in centroids.rows() {
                println!("{}", centroid);
            }
        }
    }
    // nobody hangs up while a peer may still be reading
    barrier(&comm).await?;
    Ok(())
}
