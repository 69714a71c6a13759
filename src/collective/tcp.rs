//! A group whose ranks are separate processes connected in a full TCP mesh
//! through a [`Client`](crate::network::Client).
use crate::collective::{Envelope, Group, Outbox};
use crate::error::MlError;
use crate::network::{Client, FramedStream};
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::SelectAll;
use futures::StreamExt;
use log::{debug, error, info};
use tokio::sync::Mutex;

/// Sends envelopes over the `Client`'s connection to each peer.
pub struct TcpOutbox {
    client: Mutex<Client<Envelope>>,
}

#[async_trait]
impl Outbox for TcpOutbox {
    async fn send(
        &self,
        target: usize,
        envelope: Envelope,
    ) -> Result<(), MlError> {
        self.client.lock().await.send_msg(target, envelope).await
    }
}

/// A member of a group of processes connected over TCP
pub type TcpCommunicator = Group<TcpOutbox>;

impl Group<TcpOutbox> {
    /// Registers with the [`Server`](crate::network::Server) at
    /// `server_addr`, listens on `my_addr`, connects to the other
    /// `num_nodes - 1` members and returns this process's member of the
    /// group. The rank is the id the server assigned, in order of
    /// registration.
    pub async fn connect(
        server_addr: &str,
        my_addr: &str,
        num_nodes: usize,
    ) -> Result<TcpCommunicator, MlError> {
        let (client, streams) =
            Client::<Envelope>::new(server_addr, my_addr, num_nodes)
                .await?;
        let rank = client.id;
        let (sender, receiver) = mpsc::unbounded();
        tokio::spawn(forward_frames(rank, streams, sender));
        info!(
            "Rank {} joined a group of {} through {}",
            rank,
            num_nodes,
            client.server_address()
        );
        let outbox = TcpOutbox {
            client: Mutex::new(client),
        };
        Ok(Group::new(rank, num_nodes, outbox, receiver))
    }
}

/// Moves every envelope read from any peer onto the group's channel, until a
/// peer's stream fails or the group is dropped.
async fn forward_frames(
    rank: usize,
    mut streams: SelectAll<FramedStream<Envelope>>,
    sender: UnboundedSender<Envelope>,
) {
    while let Some(frame) = streams.next().await {
        match frame {
            Ok(message) => {
                debug!(
                    "Rank {} got message {} from rank {}",
                    rank, message.msg_id, message.sender_id
                );
                if sender.unbounded_send(message.msg).is_err() {
                    // the group was dropped
                    return;
                }
            }
            Err(e) => {
                error!("Rank {} failed to read from a peer: {}", rank, e);
                return;
            }
        }
    }
}
