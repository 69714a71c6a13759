use clap::Parser;
use log::Level;
use shard_ml::error::MlError;
use shard_ml::network::Server;

/// Runs the registration server that assigns ranks to the processes of a
/// group, in the order they connect
#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// The IP:Port to listen on
    #[clap(short = 'a', long = "address", default_value = "127.0.0.1:9000")]
    address: String,
    /// Exit once this many processes have registered, instead of running
    /// forever
    #[clap(short = 'n', long = "num_nodes")]
    num_nodes: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), MlError> {
    let opts: Opts = Opts::parse();
    simple_logger::init_with_level(Level::Info)
        .map_err(|e| MlError::Configuration(e.to_string()))?;
    let mut s = Server::new(&opts.address).await?;
    s.accept_new_connections(opts.num_nodes).await?;
    Ok(())
}
