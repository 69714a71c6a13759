//! The sequencing engine shared by every provided `Communicator`.
//!
//! A `Group` only needs an [`Outbox`] that can deliver an [`Envelope`] to a
//! given rank, and a channel on which envelopes from every peer arrive. Each
//! collective takes the next sequence number, sends to the peers it needs to
//! and then takes envelopes from specific peers in rank order. Envelopes
//! that arrive early, because a peer already moved on to a later
//! collective, are buffered per sender until they are asked for.
use crate::collective::Communicator;
use crate::error::MlError;
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// Which collective an `Envelope` belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    AllGather,
    Broadcast { root: usize },
}

/// One rank's contribution to one collective, as sent to one peer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The rank that sent this envelope
    pub sender: usize,
    /// The sequence number of the collective on the sending rank
    pub seq: u64,
    /// The collective the sender was executing
    pub op: Op,
    /// The serialized contribution
    pub payload: Vec<u8>,
}

impl Envelope {
    fn check(&self, seq: u64, op: Op) -> Result<(), MlError> {
        if self.seq != seq || self.op != op {
            return Err(MlError::CollectiveProtocol(format!(
                "expected {:?} #{} from rank {}, got {:?} #{}",
                op, seq, self.sender, self.op, self.seq
            )));
        }
        Ok(())
    }
}

/// Delivers envelopes to other ranks of a group.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, target: usize, envelope: Envelope)
        -> Result<(), MlError>;
}

struct Inbox {
    seq: u64,
    receiver: UnboundedReceiver<Envelope>,
    pending: Vec<VecDeque<Envelope>>,
}

impl Inbox {
    /// Takes the oldest envelope sent by `source`, waiting for it if needed
    async fn next_from(&mut self, source: usize) -> Result<Envelope, MlError> {
        loop {
            if let Some(envelope) = self.pending[source].pop_front() {
                return Ok(envelope);
            }
            let envelope = match self.receiver.next().await {
                Some(e) => e,
                None => return Err(MlError::StreamClosed),
            };
            match self.pending.get_mut(envelope.sender) {
                Some(queue) => queue.push_back(envelope),
                None => return Err(MlError::UnknownId),
            }
        }
    }
}

/// A member of a fixed size group that implements the collectives with
/// point-to-point sends through an `Outbox`.
pub struct Group<O> {
    rank: usize,
    world_size: usize,
    outbox: O,
    /// Held for the duration of a collective, so one rank can never be in
    /// two collectives at once
    inbox: Mutex<Inbox>,
}

impl<O: Outbox> Group<O> {
    /// Creates the member `rank` of a group of `world_size`. Every envelope
    /// addressed to this rank must arrive on `receiver`.
    pub fn new(
        rank: usize,
        world_size: usize,
        outbox: O,
        receiver: UnboundedReceiver<Envelope>,
    ) -> Self {
        Group {
            rank,
            world_size,
            outbox,
            inbox: Mutex::new(Inbox {
                seq: 0,
                receiver,
                pending: (0..world_size).map(|_| VecDeque::new()).collect(),
            }),
        }
    }

    async fn send_to_peers(
        &self,
        seq: u64,
        op: Op,
        payload: &[u8],
    ) -> Result<(), MlError> {
        for target in (0..self.world_size).filter(|t| *t != self.rank) {
            let envelope = Envelope {
                sender: self.rank,
                seq,
                op,
                payload: payload.to_vec(),
            };
            self.outbox.send(target, envelope).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<O: Outbox> Communicator for Group<O> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_gather_bytes(
        &self,
        blob: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>, MlError> {
        let mut inbox = self.inbox.lock().await;
        inbox.seq += 1;
        let seq = inbox.seq;
        debug!("Rank {} entering all-gather #{}", self.rank, seq);
        self.send_to_peers(seq, Op::AllGather, &blob).await?;

        let mut own = Some(blob);
        let mut gathered = Vec::with_capacity(self.world_size);
        for source in 0..self.world_size {
            if source == self.rank {
                gathered.push(own.take().unwrap_or_default());
                continue;
            }
            let envelope = inbox.next_from(source).await?;
            envelope.check(seq, Op::AllGather)?;
            gathered.push(envelope.payload);
        }
        Ok(gathered)
    }

    async fn broadcast_bytes(
        &self,
        blob: Option<Vec<u8>>,
        root: usize,
    ) -> Result<Vec<u8>, MlError> {
        if root >= self.world_size {
            return Err(MlError::Configuration(format!(
                "broadcast root {} is out of range for {} ranks",
                root, self.world_size
            )));
        }
        let mut inbox = self.inbox.lock().await;
        inbox.seq += 1;
        let seq = inbox.seq;
        let op = Op::Broadcast { root };
        debug!(
            "Rank {} entering broadcast #{} from {}",
            self.rank, seq, root
        );
        if self.rank == root {
            let blob = blob.ok_or_else(|| {
                MlError::CollectiveProtocol(format!(
                    "rank {} is the broadcast root but supplied no data",
                    root
                ))
            })?;
            self.send_to_peers(seq, op, &blob).await?;
            Ok(blob)
        } else {
            let envelope = inbox.next_from(root).await?;
            envelope.check(seq, op)?;
            Ok(envelope.payload)
        }
    }
}
