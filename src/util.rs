//! Convenient utility functions.

use std::cmp::Ordering;

use ndarray::{Array2, ArrayView1, ArrayView2};

#[cfg(feature = "progress_bar")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress_bar")]
use std::time::Duration;

/// Creates a [`ProgressBar`] with a predefined default style.
#[cfg(feature = "progress_bar")]
pub fn progress_bar(len: usize) -> ProgressBar {
    let progress_bar = ProgressBar::new(len as u64).with_style(
        ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta})").unwrap(),
    );
    progress_bar.enable_steady_tick(Duration::new(0, 100000000));
    progress_bar
}

/// Return the indices that would sort the given array with a comparison function.
pub fn argsort_by<T, F>(data: &[T], compare: F) -> Vec<usize>
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut indices: Vec<usize> = (0..data.len()).collect();

    indices.sort_by(|&a, &b| compare(&data[a], &data[b]));

    indices
}

/// Return the index of the maximum value in the given array.
///
/// The first index is returned if several values are maximal.
pub fn argmax_by<T, F>(array: ArrayView1<T>, compare: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut idx_max = 0;

    for i in 0..array.shape()[0] {
        if compare(&array[i], &array[idx_max]).is_gt() {
            idx_max = i;
        }
    }

    idx_max
}

/// Rank the candidates of each block of `[B, K]` scores, best first.
///
/// Returns a `[B, K]` array of candidate indices. The sort is stable so equal scores keep the
/// ascending candidate order.
pub fn rank(scores: ArrayView2<f64>) -> Array2<usize> {
    let mut ranks = Array2::zeros(scores.dim());
    for (mut rank, row) in ranks.outer_iter_mut().zip(scores.outer_iter()) {
        let row = row.to_vec();
        let order = argsort_by(&row, |a, b| b.total_cmp(a));
        rank.assign(&ArrayView1::from(&order));
    }

    ranks
}

#[cfg(test)]
mod tests {
    use super::{argmax_by, rank};
    use ndarray::array;

    #[test]
    fn test_argmax_first_occurrence() {
        let scores = array![1., 3., -2., 3., 0.];
        assert_eq!(argmax_by(scores.view(), f64::total_cmp), 1);
    }

    #[test]
    fn test_rank() {
        let scores = array![[0.1, 0.7, 0.2, 0.7], [-3., -1., -2., -4.]];
        assert_eq!(rank(scores.view()), array![[1, 3, 2, 0], [1, 2, 0, 3]]);
    }
}
