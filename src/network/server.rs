//! The registration `Server` that assigns ranks to `Client`s.
use crate::error::MlError;
use crate::network::{
    read_msg, send_msg, Connection, ControlMsg, Message, MessageCodec,
};
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io;
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Represents a registration `Server` in a distributed system.
#[derive(Debug)]
pub struct Server {
    /// The `address` of this `Server`
    pub address: SocketAddr,
    /// The id of the current message
    pub msg_id: usize,
    /// A directory which is a map of client id to a [`Connection`](Connection)
    pub directory: HashMap<usize, Connection<ControlMsg>>,
    /// A `TcpListener` which listens for connections from new `Client`s
    listener: TcpListener,
}

impl Server {
    /// Create a new `Server` running on the given `address` in `IP:Port`
    /// format. A port of `0` lets the OS pick one, see `self.address`.
    pub async fn new(address: &str) -> Result<Self, MlError> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        info!("Registration server listening on {}", address);
        Ok(Server {
            address,
            msg_id: 0,
            directory: HashMap::new(),
            listener,
        })
    }

    /// Registers new `Client`s, assigning each the next rank and replying
    /// with the addresses of all previously registered `Client`s. Returns once
    /// `max_clients` have registered, or never if it is `None`.
    pub async fn accept_new_connections(
        &mut self,
        max_clients: Option<usize>,
    ) -> Result<(), MlError> {
        loop {
            if let Some(max) = max_clients {
                if self.directory.len() >= max {
                    return Ok(());
                }
            }
            // wait on connections from new clients
            let (socket, _) = self.listener.accept().await?;
            let (reader, writer) = io::split(socket);
            let mut stream =
                FramedRead::new(reader, MessageCodec::<ControlMsg>::new());
            let sink = FramedWrite::new(writer, MessageCodec::new());
            // Read the IP:Port from the client
            let intro = read_msg(&mut stream).await?;
            let address = match intro.msg {
                ControlMsg::Introduction { address } => address,
                _ => return Err(MlError::UnexpectedMessage),
            };

            let assigned_id = self.directory.len();
            let mut dir: Vec<(usize, SocketAddr)> = self
                .directory
                .iter()
                .map(|(k, v)| (*k, v.address))
                .collect();
            dir.sort_unstable();

            let conn = Connection { address, sink };
            if self.directory.insert(assigned_id, conn).is_some() {
                return Err(MlError::ReconnectionError);
            }
            self.send_msg(assigned_id, ControlMsg::Directory { dir })
                .await?;
            info!("Registered rank {} at {}", assigned_id, address);
        }
    }

    /// Send a message to a client with the given `target_id`.
    pub(crate) async fn send_msg(
        &mut self,
        target_id: usize,
        message: ControlMsg,
    ) -> Result<(), MlError> {
        let m = Message::new(self.msg_id, 0, target_id, message);
        send_msg(target_id, m, &mut self.directory).await?;
        self.msg_id += 1;
        Ok(())
    }
}
