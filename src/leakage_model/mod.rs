//! Profiled leakage models and the scoring contract they share.
//!
//! A leakage model is fitted once on labeled traces and then ranks key byte candidates against
//! traces acquired with an unknown key. All arrays follow the canonical axis order described in
//! [`crate::shape`].
use itertools::izip;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, Axis, s};
use rayon::iter::{ParallelBridge, ParallelIterator};

use crate::{
    Error,
    shape::{all_candidates, labels},
    util::argmax_by,
};

pub mod linear_regression;
pub mod template;

/// Number of samples per parallel batch used by [`LeakageModel::fit`].
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// A profiled leakage model.
///
/// Implementors only have to provide the fitting, the log-domain score and their own score
/// convention ([`LeakageModel::keys_probability`]). Key guessing and normalization are derived
/// from [`LeakageModel::log_likelihood`].
pub trait LeakageModel {
    /// Fit the model on `[B, N]` labels and their `[B, N, P]` traces.
    fn fit(labels: ArrayView2<u8>, traces: ArrayView3<f64>) -> Result<Self, Error>
    where
        Self: Sized;

    /// Fit the model from the `[B, N]` known keys and plaintexts of a profiling set.
    fn fit_with_keys(
        keys: ArrayView2<u8>,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
    ) -> Result<Self, Error>
    where
        Self: Sized,
    {
        Self::fit(labels(keys, plaintexts)?.view(), traces)
    }

    /// Number of blocks the model was fitted on.
    fn blocks(&self) -> usize;

    /// Number of channels the model was fitted on.
    fn channels(&self) -> usize;

    /// Log-likelihood of each key candidate, as a `[B, K, P]` array.
    ///
    /// The `N` axis is reduced: each sample is assumed independent.
    fn log_likelihood(
        &self,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
        keys: ArrayView2<u8>,
    ) -> Result<Array3<f64>, Error>;

    /// Score of each key candidate, as a `[B, K, P]` array. Higher is better.
    ///
    /// Scores can only be compared between candidates of the same block and channel.
    fn keys_probability(
        &self,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
        keys: ArrayView2<u8>,
    ) -> Result<Array3<f64>, Error>;

    /// Probability of each key candidate, normalized over the candidate axis.
    fn keys_distribution(
        &self,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
        keys: ArrayView2<u8>,
    ) -> Result<Array3<f64>, Error> {
        Ok(softmax(self.log_likelihood(plaintexts, traces, keys)?.view()))
    }

    /// Return the most likely key byte of each block, all channels combined.
    ///
    /// Ties are resolved to the lowest key value.
    fn get_key(
        &self,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
    ) -> Result<Array1<u8>, Error> {
        let keys = all_candidates(plaintexts.nrows());
        let log_likelihood = self.log_likelihood(plaintexts, traces, keys.view())?;

        Ok(log_likelihood
            .sum_axis(Axis(2))
            .outer_iter()
            .map(|scores| argmax_by(scores, f64::total_cmp) as u8)
            .collect())
    }

    /// Return the most likely key byte of each block for each channel, as a `[B, P]` array.
    ///
    /// Ties are resolved to the lowest key value.
    fn get_key_per_channel(
        &self,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
    ) -> Result<Array2<u8>, Error> {
        let keys = all_candidates(plaintexts.nrows());
        let log_likelihood = self.log_likelihood(plaintexts, traces, keys.view())?;
        let (blocks, _, channels) = log_likelihood.dim();

        Ok(Array2::from_shape_fn((blocks, channels), |(b, p)| {
            argmax_by(log_likelihood.slice(s![b, .., p]), f64::total_cmp) as u8
        }))
    }
}

/// Turn `[B, K, P]` log-scores into probabilities over the candidate axis.
///
/// The maximum of each block and channel is subtracted before exponentiating so that long traces
/// do not underflow to zero.
pub fn softmax(log_scores: ArrayView3<f64>) -> Array3<f64> {
    let mut probabilities = log_scores.to_owned();
    for mut lane in probabilities.lanes_mut(Axis(1)) {
        let max = lane.fold(f64::NEG_INFINITY, |acc, &x| acc.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane /= sum;
    }

    probabilities
}

/// Normalize `[B, K, P]` non-negative scores by their sum over the candidate axis.
pub fn normalize(scores: ArrayView3<f64>) -> Array3<f64> {
    let mut probabilities = scores.to_owned();
    for mut lane in probabilities.lanes_mut(Axis(1)) {
        let sum = lane.sum();
        lane /= sum;
    }

    probabilities
}

/// Sum `log_density(block, label, channel, sample)` over the samples for every key candidate.
///
/// Shapes must have been validated beforehand. Blocks are processed in parallel.
pub(crate) fn score_candidates<F>(
    plaintexts: ArrayView2<u8>,
    traces: ArrayView3<f64>,
    keys: ArrayView2<u8>,
    log_density: F,
) -> Array3<f64>
where
    F: Fn(usize, u8, usize, f64) -> f64 + Sync,
{
    let channels = traces.shape()[2];
    let mut scores = Array3::zeros((keys.nrows(), keys.ncols(), channels));

    izip!(
        scores.outer_iter_mut(),
        plaintexts.outer_iter(),
        traces.outer_iter(),
        keys.outer_iter()
    )
    .enumerate()
    .par_bridge()
    .for_each(|(block, (mut block_scores, plaintexts, traces, keys))| {
        for (k, &key) in keys.iter().enumerate() {
            score_candidate(
                block,
                key,
                plaintexts,
                traces,
                block_scores.row_mut(k),
                &log_density,
            );
        }
    });

    scores
}

fn score_candidate<F>(
    block: usize,
    key: u8,
    plaintexts: ArrayView1<u8>,
    traces: ArrayView2<f64>,
    mut scores: ArrayViewMut1<f64>,
    log_density: &F,
) where
    F: Fn(usize, u8, usize, f64) -> f64,
{
    for (&plaintext, trace) in plaintexts.iter().zip(traces.outer_iter()) {
        let label = key ^ plaintext;
        for (channel, (score, &x)) in scores.iter_mut().zip(trace.iter()).enumerate() {
            *score += log_density(block, label, channel, x);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize, softmax};
    use ndarray::{Array3, Axis, array};

    #[test]
    fn test_softmax_does_not_underflow() {
        let log_scores = array![[[-5000.], [-5001.], [-7000.]]];
        let probabilities = softmax(log_scores.view());

        assert!(probabilities.iter().all(|p| p.is_finite()));
        assert!((probabilities.sum_axis(Axis(1))[[0, 0]] - 1.).abs() < 1e-12);
        assert!(probabilities[[0, 0, 0]] > probabilities[[0, 1, 0]]);
        assert!(probabilities[[0, 1, 0]] > probabilities[[0, 2, 0]]);
    }

    #[test]
    fn test_normalize() {
        let scores = Array3::from_shape_fn((2, 4, 3), |(b, k, p)| (1 + b + k * p) as f64);
        let probabilities = normalize(scores.view());

        for sum in probabilities.sum_axis(Axis(1)).iter() {
            assert!((sum - 1.).abs() < 1e-12);
        }
        assert_eq!(probabilities[[1, 0, 2]], 2. / (2. + 4. + 6. + 8.));
    }
}
