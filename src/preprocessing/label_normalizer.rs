//! Maps arbitrary integer class labels to dense indices that agree on every
//! rank.
use crate::collective::{all_gather_counts, all_gather_variable, Communicator};
use crate::error::MlError;
use log::debug;
use std::sync::Arc;

/// Holds the sorted, duplicate free set of class labels seen by any rank
/// during the most recent call to [`index`](LabelNormalizer::index). The
/// dense index of a label is its position in that set.
///
/// The set is an immutable snapshot. Re-indexing builds a new one and swaps
/// it in, so clones taken earlier keep the labels they were built with.
#[derive(Debug, Clone, Default)]
pub struct LabelNormalizer {
    classes: Arc<Vec<i64>>,
}

impl LabelNormalizer {
    pub fn new() -> Self {
        LabelNormalizer::default()
    }

    /// Rebuilds the global label set from every rank's `local_labels`.
    ///
    /// This is a collective: every rank of `comm` must call it at the same
    /// step, including ranks without any labels. It takes two rounds, an
    /// exchange of each rank's distinct label count followed by a variable
    /// length all-gather of the distinct labels themselves.
    ///
    /// On error the previous label set is kept.
    pub async fn index<C>(
        &mut self,
        comm: &C,
        local_labels: &[i64],
    ) -> Result<(), MlError>
    where
        C: Communicator + ?Sized,
    {
        let mut local = local_labels.to_vec();
        local.sort_unstable();
        local.dedup();

        let counts = all_gather_counts(comm, local.len()).await?;
        let mut global = all_gather_variable(comm, &local, &counts).await?;
        global.sort_unstable();
        global.dedup();

        debug!(
            "Rank {} indexed {} local and {} global classes",
            comm.rank(),
            local.len(),
            global.len()
        );
        self.classes = Arc::new(global);
        Ok(())
    }

    /// The dense index of `label`.
    ///
    /// ## Errors
    /// `MlError::UnknownLabel` if `label` was not seen by any rank in the
    /// most recent `index`.
    pub fn transform(&self, label: i64) -> Result<usize, MlError> {
        self.classes
            .binary_search(&label)
            .map_err(|_| MlError::UnknownLabel(label))
    }

    /// Transforms every label, failing on the first unknown one.
    pub fn transform_all(&self, labels: &[i64]) -> Result<Vec<usize>, MlError> {
        labels.iter().map(|l| self.transform(*l)).collect()
    }

    /// The original label of the dense index `index`.
    pub fn inverse(&self, index: usize) -> Result<i64, MlError> {
        self.classes
            .get(index)
            .copied()
            .ok_or(MlError::UnknownIndex(index))
    }

    /// The global label set in ascending order
    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCommunicator;

    async fn index_on_group(local: Vec<Vec<i64>>) -> Vec<LabelNormalizer> {
        let local = Arc::new(local);
        LocalCommunicator::run(local.len(), move |comm| {
            let local = local.clone();
            async move {
                let mut normalizer = LabelNormalizer::new();
                normalizer
                    .index(&comm, &local[comm.rank()])
                    .await
                    .unwrap();
                normalizer
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_two_workers() {
        let results = index_on_group(vec![vec![3, 1], vec![1, 2]]).await;
        for n in results {
            assert_eq!(n.classes(), &[1, 2, 3]);
            assert_eq!(n.transform(1).unwrap(), 0);
            assert_eq!(n.transform(2).unwrap(), 1);
            assert_eq!(n.transform(3).unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_unknown_label() {
        let results = index_on_group(vec![vec![3, 1], vec![1, 2]]).await;
        assert!(matches!(
            results[0].transform(4),
            Err(MlError::UnknownLabel(4))
        ));
        assert!(matches!(
            results[1].transform_all(&[1, 0]),
            Err(MlError::UnknownLabel(0))
        ));
        assert!(LabelNormalizer::new().transform(1).is_err());
    }

    #[tokio::test]
    async fn test_order_of_reporting_ranks_does_not_matter() {
        let sets = vec![vec![7, -2], vec![4], vec![7, 9, 4]];
        let expected = vec![-2, 4, 7, 9];
        for rotation in 0..sets.len() {
            let mut rotated = sets.clone();
            rotated.rotate_left(rotation);
            for n in index_on_group(rotated).await {
                assert_eq!(n.classes(), expected.as_slice());
            }
        }
    }

    #[tokio::test]
    async fn test_rank_without_labels_participates() {
        let results =
            index_on_group(vec![vec![0, 2], vec![1], vec![2, 5], vec![]]).await;
        for n in results {
            assert_eq!(n.classes(), &[0, 1, 2, 5]);
            assert_eq!(n.transform_all(&[0, 1, 2, 5]).unwrap(), vec![0, 1, 2, 3]);
            assert_eq!(n.inverse(3).unwrap(), 5);
            assert!(matches!(n.inverse(4), Err(MlError::UnknownIndex(4))));
        }
    }

    #[tokio::test]
    async fn test_reindex_replaces_snapshot() {
        let mut group = LocalCommunicator::group(1);
        let comm = group.remove(0);
        let mut normalizer = LabelNormalizer::new();
        normalizer.index(&comm, &[10, 20]).await.unwrap();
        let before = normalizer.clone();
        normalizer.index(&comm, &[30]).await.unwrap();
        assert_eq!(before.classes(), &[10, 20]);
        assert_eq!(normalizer.classes(), &[30]);
        assert!(normalizer.transform(10).is_err());
    }
}
