//! Represents a client node in a distributed system, with one direct
//! connection to every other client.
use crate::error::MlError;
use crate::network::{
    existing_conn_err, read_msg, send_msg, Connection,
    ControlMsg, FramedStream, Message, MessageCodec,
};
use futures::stream::{self, SelectAll};
use futures::SinkExt;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Represents a `Client` node in a distributed system that is generic for
/// type `T`, where `T` is the types of messages that can be sent between
/// `Client`s
#[derive(Debug)]
pub struct Client<T> {
    /// The `id` of this `Client`, assigned by the [`Server`] on startup
    /// in order of registration starting from `0`. This is the rank.
    ///
    /// [`Server`]: struct.Server.html
    pub id: usize,
    /// The number of `Client`s in the network
    pub num_nodes: usize,
    /// The `address` this `Client` accepts connections on
    pub address: SocketAddr,
    /// The id of the next message this `Client` sends
    pub(crate) msg_id: usize,
    /// A directory which is a map of client id to the [`Connection`] with that
    /// `Client`
    ///
    /// [`Connection`]: struct.Connection.html
    pub(crate) directory: HashMap<usize, Connection<T>>,
    /// The connection to the [`Server`](struct.Server.html)
    server: Connection<ControlMsg>,
}

impl<T: Send + Sync + DeserializeOwned + Serialize + 'static> Client<T> {
    /// Create a new [`Client`] listening on `my_addr` in `IP:Port` format. A
    /// port of `0` lets the OS pick one.
    ///
    /// Constructing the [`Client`] does these things:
    /// 1. Connects to the [`Server`]
    /// 2. Sends the server a [`ControlMsg::Introduction`] containing our
    ///    `IP:Port`
    /// 3. The [`Server`] responds with a [`ControlMsg::Directory`], addressed
    ///    to our newly assigned id, containing the addresses of all
    ///    `Client`s that registered before us
    /// 4. Connects to all of those `Client`s
    /// 5. Waits for all `Client`s registering after us to connect, until
    ///    there is a connection to each of the other `num_nodes - 1`
    ///
    /// Returns the `Client`, which is used for sending, and the merged
    /// stream of messages from every other `Client`.
    ///
    /// [`Client`]: struct.Client.html
    /// [`Server`]: struct.Server.html
    /// [`ControlMsg::Directory`]: enum.ControlMsg.html#variant.Directory
    /// [`ControlMsg::Introduction`]: enum.ControlMsg.html#variant.Introduction
    pub async fn new(
        server_addr: &str,
        my_addr: &str,
        num_nodes: usize,
    ) -> Result<(Self, SelectAll<FramedStream<T>>), MlError> {
        // Setup a TCPListener
        let listener = TcpListener::bind(my_addr).await?;
        let my_address = listener.local_addr()?;

        // Connect to the server
        let server_stream = TcpStream::connect(server_addr).await?;
        let server_address = server_stream.peer_addr()?;
        let (reader, writer) = io::split(server_stream);
        let mut stream =
            FramedRead::new(reader, MessageCodec::<ControlMsg>::new());
        let sink = FramedWrite::new(writer, MessageCodec::new());
        let mut server = Connection {
            address: server_address,
            sink,
        };
        // Tell the server our address
        server
            .sink
            .send(Message::new(
                0,
                0,
                0,
                ControlMsg::Introduction {
                    address: my_address,
                },
            ))
            .await?;
        // Server responds with the addresses of all earlier clients
        let dir_msg = read_msg(&mut stream).await?;
        let dir = match dir_msg.msg {
            ControlMsg::Directory { dir } => dir,
            _ => return Err(MlError::UnexpectedMessage),
        };

        info!(
            "Client got id {} running at address {}",
            dir_msg.target_id, &my_address
        );

        let mut c = Client {
            id: dir_msg.target_id,
            num_nodes,
            address: my_address,
            msg_id: dir_msg.msg_id + 1,
            directory: HashMap::new(),
            server,
        };

        // Connect to all the currently existing clients. This is done
        // serially since there will only ever be a (relatively) small
        // number of nodes
        let mut streams = Vec::new();
        for (id, addr) in dir.into_iter() {
            streams.push(c.connect(id, addr).await?);
        }
        // block until all the later clients start up and connect to us
        streams.extend(c.accept_new_connections(listener).await?);

        Ok((c, stream::select_all(streams)))
    }

    /// Accepts connections from `Client`s that registered after this one
    /// until this `Client` is connected to all `num_nodes - 1` others.
    async fn accept_new_connections(
        &mut self,
        listener: TcpListener,
    ) -> Result<Vec<FramedStream<T>>, MlError> {
        let mut streams: Vec<FramedStream<T>> = Vec::new();
        while self.directory.len() + 1 < self.num_nodes {
            // wait on connections from new clients
            let (socket, _) = listener.accept().await?;
            let (reader, writer) = io::split(socket);
            let mut stream =
                FramedRead::new(reader, MessageCodec::<ControlMsg>::new());
            let sink = FramedWrite::new(writer, MessageCodec::<T>::new());
            // read the introduction message from the new client
            let intro = read_msg(&mut stream).await?;
            let address = match intro.msg {
                ControlMsg::Introduction { address } => address,
                // we should only receive introductions here
                _ => return Err(MlError::UnexpectedMessage),
            };

            if self.directory.contains_key(&intro.sender_id) {
                return Err(existing_conn_err(stream, sink));
            }

            self.directory
                .insert(intro.sender_id, Connection { address, sink });
            streams.push(stream.map_decoder(|codec| codec.retype()));
            info!(
                "Connected to id: {:#?} at address: {:#?}",
                intro.sender_id, address
            );
        }
        Ok(streams)
    }

    /// Connects to the `Client` with `client_id` running at `client_addr`,
    /// introduces ourselves and adds the [`Connection`] to our directory.
    ///
    /// [`Connection`]: struct.Connection.html
    async fn connect(
        &mut self,
        client_id: usize,
        client_addr: SocketAddr,
    ) -> Result<FramedStream<T>, MlError> {
        let socket = TcpStream::connect(&client_addr).await?;
        let (reader, writer) = io::split(socket);
        let stream = FramedRead::new(reader, MessageCodec::<T>::new());
        let mut sink =
            FramedWrite::new(writer, MessageCodec::<ControlMsg>::new());

        if self.directory.contains_key(&client_id) {
            return Err(existing_conn_err(stream, sink));
        }
        sink.send(Message::new(
            self.msg_id,
            self.id,
            client_id,
            ControlMsg::Introduction {
                address: self.address,
            },
        ))
        .await?;
        self.msg_id += 1;

        let conn = Connection {
            address: client_addr,
            sink: sink.map_encoder(|codec| codec.retype()),
        };
        self.directory.insert(client_id, conn);
        info!(
            "Connected to id: {:#?} at address: {:#?}",
            client_id, client_addr
        );
        Ok(stream)
    }

    /// Send the given `msg` to the [`Client`] with the given `target_id`.
    ///
    /// [`Client`]: struct.Client.html
    pub async fn send_msg(
        &mut self,
        target_id: usize,
        msg: T,
    ) -> Result<(), MlError> {
        let m = Message::new(self.msg_id, self.id, target_id, msg);
        send_msg(target_id, m, &mut self.directory).await?;
        debug!("sent a message with id, {}", self.msg_id);
        self.msg_id += 1;
        Ok(())
    }

    /// The address of the registration `Server` this `Client` joined through
    pub fn server_address(&self) -> SocketAddr {
        self.server.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::Envelope;
    use crate::network::Server;

    #[tokio::test]
    async fn test_single_client_registers() {
        let mut server = Server::new("127.0.0.1:0").await.unwrap();
        let server_addr = server.address;
        let registration = tokio::spawn(async move {
            server.accept_new_connections(Some(1)).await.unwrap();
        });
        let (client, _) =
            Client::<Envelope>::new(&server_addr.to_string(), "127.0.0.1:0", 1)
                .await
                .unwrap();
        registration.await.unwrap();

        assert_eq!(client.id, 0);
        assert_eq!(client.server_address(), server_addr);
        // the directory reply was message 0
        assert_eq!(client.msg_id, 1);
        assert!(client.directory.is_empty());
    }
}
