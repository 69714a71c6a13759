//! Local, communication free numeric kernels shared by the models.
use crate::error::MlError;
use crossbeam_utils::thread;
use ndarray::{s, ArrayView1, ArrayView2};

/// Squared Euclidean distance between two points of equal length
pub fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// The index of the row of `centroids` closest to `point`, and the squared
/// distance to it. Ties go to the lower index.
pub fn nearest(point: ArrayView1<f64>, centroids: ArrayView2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, centroid) in centroids.rows().into_iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// Finds the [`nearest`] centroid for every row of `x`.
///
/// The rows are split into `n_threads` contiguous chunks that are processed
/// on scoped threads, the last chunk taking the remainder. Results are in row
/// order.
///
/// ## Errors
/// `MlError::WorkerPanicked` if a thread panicked.
pub fn assign(
    x: ArrayView2<f64>,
    centroids: ArrayView2<f64>,
    n_threads: usize,
) -> Result<Vec<(usize, f64)>, MlError> {
    let n_rows = x.nrows();
    if n_rows == 0 {
        return Ok(Vec::new());
    }
    let n_threads = n_threads.clamp(1, n_rows);
    let step = n_rows / n_threads;
    thread::scope(|s| -> Result<Vec<(usize, f64)>, MlError> {
        let mut threads = Vec::with_capacity(n_threads);
        let mut from = 0;
        for i in 0..n_threads {
            let to = if i + 1 == n_threads { n_rows } else { from + step };
            let chunk = x.slice(s![from..to, ..]);
            threads.push(s.spawn(move |_| {
                chunk
                    .rows()
                    .into_iter()
                    .map(|row| nearest(row, centroids))
                    .collect::<Vec<_>>()
            }));
            from = to;
        }
        let mut assignments = Vec::with_capacity(n_rows);
        for t in threads {
            assignments.extend(t.join().map_err(|_| MlError::WorkerPanicked)?);
        }
        Ok(assignments)
    })
    .map_err(|_| MlError::WorkerPanicked)?
}
