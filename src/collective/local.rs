//! An in-process group whose ranks exchange envelopes over channels. Useful
//! for tests and for simulating a distributed run inside one process.
use crate::collective::{Envelope, Group, Outbox};
use crate::error::MlError;
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use std::future::Future;

/// Sends envelopes straight into the channels of the other ranks.
pub struct LocalOutbox {
    peers: Vec<UnboundedSender<Envelope>>,
}

#[async_trait]
impl Outbox for LocalOutbox {
    async fn send(
        &self,
        target: usize,
        envelope: Envelope,
    ) -> Result<(), MlError> {
        match self.peers.get(target) {
            None => Err(MlError::UnknownId),
            Some(peer) => peer
                .unbounded_send(envelope)
                .map_err(|_| MlError::StreamClosed),
        }
    }
}

/// A member of an in-process group
pub type LocalCommunicator = Group<LocalOutbox>;

impl Group<LocalOutbox> {
    /// Creates all `n` members of a connected in-process group, in rank
    /// order.
    pub fn group(n: usize) -> Vec<LocalCommunicator> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..n).map(|_| mpsc::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| {
                let outbox = LocalOutbox {
                    peers: senders.clone(),
                };
                Group::new(rank, n, outbox, receiver)
            })
            .collect()
    }

    /// Runs `f` concurrently on every member of a fresh group of `n`, each
    /// as its own `tokio` task, and returns the results in rank order.
    ///
    /// ## Errors
    /// `MlError::WorkerPanicked` if any rank's task panicked.
    pub async fn run<F, Fut, T>(n: usize, f: F) -> Result<Vec<T>, MlError>
    where
        F: Fn(LocalCommunicator) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalCommunicator::group(n)
            .into_iter()
            .map(|comm| tokio::spawn(f(comm)))
            .collect();
        let mut results = Vec::with_capacity(n);
        for handle in handles {
            results.push(handle.await.map_err(|_| MlError::WorkerPanicked)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::{all_gather, Communicator};

    #[test]
    fn test_group_ranks() {
        let group = LocalCommunicator::group(3);
        for (i, comm) in group.iter().enumerate() {
            assert_eq!(comm.rank(), i);
            assert_eq!(comm.world_size(), 3);
        }
    }

    #[tokio::test]
    async fn test_single_rank_group() {
        let group = LocalCommunicator::group(1);
        let v = all_gather(&group[0], &"solo".to_string()).await.unwrap();
        assert_eq!(v, vec!["solo".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_stream() {
        let mut group = LocalCommunicator::group(2);
        let survivor = group.remove(0);
        drop(group);
        let res = all_gather(&survivor, &1u8).await;
        assert!(res.is_err());
    }
}
