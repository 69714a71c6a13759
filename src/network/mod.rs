//! A module with methods to communicate with nodes in a distributed system
//! over TCP, as well as the `Client` and `Server` implementations used by
//! [`TcpCommunicator`].
//!
//! A registration [`Server`] hands out ranks in connection order. Every new
//! [`Client`] is told the addresses of the ranks registered before it,
//! connects to each of them and then waits for the ranks registered after it
//! to connect, so that once all `num_nodes` clients have started every pair
//! of ranks shares exactly one connection.
//!
//! All traffic is framed with a length delimited codec and serialized with
//! `bincode`.
//!
//! [`TcpCommunicator`]: crate::collective::TcpCommunicator
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

mod client;
pub use client::Client;

mod message;
pub(crate) use message::{existing_conn_err, read_msg, send_msg};

mod server;
pub use server::Server;

/// A stream of messages of type `T` from one other node
pub type FramedStream<T> = FramedRead<ReadHalf<TcpStream>, MessageCodec<T>>;
/// A buffered sink of messages of type `T` to one other node
pub type FramedSink<T> = FramedWrite<WriteHalf<TcpStream>, MessageCodec<T>>;

/// A connection to another node, used for sending directed communication
#[derive(Debug)]
pub struct Connection<T> {
    /// The `IP:Port` of the other node
    pub address: SocketAddr,
    /// The buffered sink used for sending messages to the other node
    pub sink: FramedSink<T>,
}

/// A message for communication between nodes
#[derive(Serialize, Deserialize, Debug)]
pub struct Message<T> {
    /// The id of this message
    pub(crate) msg_id: usize,
    /// The id of the sender
    pub(crate) sender_id: usize,
    /// The id of the node this message is being sent to
    pub(crate) target_id: usize,
    /// The body of the message
    pub(crate) msg: T,
}

/// Control messages to facilitate registration with the `Server`
#[derive(Serialize, Deserialize, Debug)]
pub enum ControlMsg {
    /// Sent by the `Server` to a newly registered `Client`, addressed to the
    /// rank assigned to it, listing the ranks that registered before it
    Directory { dir: Vec<(usize, SocketAddr)> },
    /// Sent by a new `Client` to the `Server` and to every existing `Client`
    Introduction { address: SocketAddr },
}

/// Encodes and decodes length delimited, `bincode` serialized
/// `Message<T>`s
#[derive(Debug)]
pub struct MessageCodec<T> {
    phantom: std::marker::PhantomData<T>,
    pub(crate) codec: LengthDelimitedCodec,
}
