//! Linear regression leakage model on the bit basis of the labels.
//!
//! The leakage of each block and channel is modeled as a linear combination of the 8 bits of the
//! label plus a constant, fitted by ordinary least squares on profiling traces.
use nalgebra::{Cholesky, SMatrix, SVector};
use ndarray::{Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::{iter::zip, ops::Add};

use crate::{
    Error,
    basis::{BASIS_SIZE, basis},
    leakage_model::{DEFAULT_BATCH_SIZE, LeakageModel, score_candidates},
    shape::{NUM_CLASSES, attack_dims, profiling_dims},
};

type Matrix9 = SMatrix<f64, BASIS_SIZE, BASIS_SIZE>;
type Vector9 = SVector<f64, BASIS_SIZE>;

/// Smallest accepted ratio between the smallest and the largest Cholesky pivot of the Gram
/// matrix.
const PIVOT_TOLERANCE: f64 = 1e-10;

/// Fit a [`LinearRegression`] on the given labels and traces using
/// [`LinearRegressionProcessor`].
///
/// `labels` is `[B, N]` and `traces` is `[B, N, P]`. Samples are processed in parallel by batches
/// of `batch_size`.
///
/// # Panics
/// Panic if `batch_size` is 0.
pub fn linear_regression(
    labels: ArrayView2<u8>,
    traces: ArrayView3<f64>,
    batch_size: usize,
) -> Result<LinearRegression, Error> {
    assert!(batch_size > 0);
    let dims = profiling_dims(labels, traces)?;

    // Batches are merged in sample order, whatever the number of threads
    let batches: Vec<_> = zip(
        labels.axis_chunks_iter(Axis(1), batch_size),
        traces.axis_chunks_iter(Axis(1), batch_size),
    )
    .collect();
    let processors: Vec<LinearRegressionProcessor> = batches
        .into_par_iter()
        .map(|(label_batch, trace_batch)| {
            let mut lr = LinearRegressionProcessor::new(dims.blocks, dims.channels);
            lr.update(label_batch, trace_batch);

            lr
        })
        .collect();

    let model = processors
        .into_iter()
        .reduce(|a, b| a + b)
        .unwrap_or_else(|| LinearRegressionProcessor::new(dims.blocks, dims.channels))
        .finalize()?;

    log::debug!(
        "Fitted linear regression on {} blocks, {} samples, {} channels",
        dims.blocks,
        dims.samples,
        dims.channels
    );

    Ok(model)
}

/// Linear regression leakage model.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    /// Regression coefficients, `[B, 9, P]`
    coefficients: Array3<f64>,
    /// Predicted leakage of every label, `[B, 256, P]`
    predictions: Array3<f64>,
}

impl LinearRegression {
    /// Build a model from its `[B, 9, P]` regression coefficients.
    ///
    /// # Panics
    /// Panic if `coefficients.shape()[1]` is not [`BASIS_SIZE`].
    pub fn new(coefficients: Array3<f64>) -> Self {
        assert_eq!(coefficients.shape()[1], BASIS_SIZE);

        let (blocks, _, channels) = coefficients.dim();
        let predictions = Array3::from_shape_fn((blocks, NUM_CLASSES, channels), |(b, l, p)| {
            zip(basis(l as u8), coefficients.slice(s![b, .., p]))
                .map(|(x, beta)| x as f64 * beta)
                .sum()
        });

        Self {
            coefficients,
            predictions,
        }
    }

    /// Return the `[B, 9, P]` regression coefficients.
    pub fn coefficients(&self) -> ArrayView3<f64> {
        self.coefficients.view()
    }

    /// Return the `[B, 256, P]` leakage predicted for each label.
    pub fn predictions(&self) -> ArrayView3<f64> {
        self.predictions.view()
    }
}

impl LeakageModel for LinearRegression {
    fn fit(labels: ArrayView2<u8>, traces: ArrayView3<f64>) -> Result<Self, Error> {
        linear_regression(labels, traces, DEFAULT_BATCH_SIZE)
    }

    fn blocks(&self) -> usize {
        self.coefficients.shape()[0]
    }

    fn channels(&self) -> usize {
        self.coefficients.shape()[2]
    }

    /// Opposite of the sum of squared residuals of each key candidate.
    fn log_likelihood(
        &self,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
        keys: ArrayView2<u8>,
    ) -> Result<Array3<f64>, Error> {
        attack_dims(plaintexts, traces, keys)?.check_model(self.blocks(), self.channels())?;

        Ok(score_candidates(
            plaintexts,
            traces,
            keys,
            |block, label, channel, x| {
                let residual = x - self.predictions[[block, label as usize, channel]];
                -residual * residual
            },
        ))
    }

    /// `exp(-loss)` where `loss` is the sum of squared residuals of each key candidate.
    fn keys_probability(
        &self,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
        keys: ArrayView2<u8>,
    ) -> Result<Array3<f64>, Error> {
        Ok(self
            .log_likelihood(plaintexts, traces, keys)?
            .mapv_into(f64::exp))
    }
}

/// A processor that accumulates the normal equations of a [`LinearRegression`].
#[derive(Debug, Clone)]
pub struct LinearRegressionProcessor {
    /// Number of channels per trace
    num_channels: usize,
    /// Gram matrix `X Xᵗ` of each block
    gram: Vec<Matrix9>,
    /// `X Yᵗ` of each block, `[B, 9, P]`
    moments: Array3<f64>,
    /// Number of traces processed
    num_traces: usize,
}

impl LinearRegressionProcessor {
    pub fn new(num_blocks: usize, num_channels: usize) -> Self {
        Self {
            num_channels,
            gram: vec![Matrix9::zeros(); num_blocks],
            moments: Array3::zeros((num_blocks, BASIS_SIZE, num_channels)),
            num_traces: 0,
        }
    }

    /// Process the traces of one acquisition: `labels` is `[B]` and `traces` is `[B, P]`.
    ///
    /// # Panics
    /// Panic in debug if the shapes do not match the processor.
    pub fn process(&mut self, labels: ArrayView1<u8>, traces: ArrayView2<f64>) {
        debug_assert_eq!(labels.len(), self.gram.len());
        debug_assert_eq!(traces.dim(), (self.gram.len(), self.num_channels));

        for (block, (&label, trace)) in zip(labels, traces.rows()).enumerate() {
            let x = Vector9::from_iterator(basis(label).map(f64::from));
            self.gram[block] += x * x.transpose();

            for i in 0..BASIS_SIZE {
                if x[i] != 0. {
                    let mut moments = self.moments.slice_mut(s![block, i, ..]);
                    moments += &trace;
                }
            }
        }

        self.num_traces += 1;
    }

    /// Process a batch: `label_batch` is `[B, n]` and `trace_batch` is `[B, n, P]`.
    ///
    /// # Panics
    /// Panic in debug if the shapes do not match the processor.
    pub fn update(&mut self, label_batch: ArrayView2<u8>, trace_batch: ArrayView3<f64>) {
        debug_assert_eq!(label_batch.ncols(), trace_batch.shape()[1]);

        for n in 0..label_batch.ncols() {
            self.process(label_batch.column(n), trace_batch.slice(s![.., n, ..]));
        }
    }

    /// Finalize the calculation after feeding the overall traces.
    ///
    /// Solves the normal equations `X Xᵗ β = X Yᵗ` of each block. Returns
    /// [`Error::IllConditioned`] if a Gram matrix is singular.
    pub fn finalize(&self) -> Result<LinearRegression, Error> {
        let mut coefficients = Array3::zeros(self.moments.raw_dim());

        for (block, gram) in self.gram.iter().enumerate() {
            let cholesky = factorize(gram).ok_or(Error::IllConditioned { block })?;

            for channel in 0..self.num_channels {
                let moments = Vector9::from_iterator(
                    self.moments.slice(s![block, .., channel]).iter().copied(),
                );
                let beta = cholesky.solve(&moments);
                coefficients
                    .slice_mut(s![block, .., channel])
                    .assign(&ArrayView1::from(beta.as_slice()));
            }
        }

        log::trace!("Solved normal equations on {} traces", self.num_traces);

        Ok(LinearRegression::new(coefficients))
    }

    /// Determine if two [`LinearRegressionProcessor`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.num_channels == other.num_channels && self.gram.len() == other.gram.len()
    }
}

/// Cholesky factorization of a Gram matrix, or `None` if it is numerically singular.
fn factorize(gram: &Matrix9) -> Option<Cholesky<f64, nalgebra::Const<BASIS_SIZE>>> {
    let cholesky = Cholesky::new(*gram)?;

    let pivots = cholesky.l_dirty().diagonal().map(|l| l * l);
    let max = pivots.max();
    if pivots
        .iter()
        .any(|&pivot| !pivot.is_finite() || pivot <= PIVOT_TOLERANCE * max)
    {
        return None;
    }

    Some(cholesky)
}

impl Add for LinearRegressionProcessor {
    type Output = Self;

    /// Merge computations of two [`LinearRegressionProcessor`]. Processors need to be compatible
    /// to be merged together, otherwise it can panic or yield incoherent result (see
    /// [`LinearRegressionProcessor::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        Self {
            num_channels: self.num_channels,
            gram: zip(self.gram, rhs.gram).map(|(a, b)| a + b).collect(),
            moments: self.moments + rhs.moments,
            num_traces: self.num_traces + rhs.num_traces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LinearRegression, LinearRegressionProcessor, linear_regression};
    use crate::{
        Error,
        basis::{BASIS_SIZE, basis},
        leakage_model::LeakageModel,
        shape::{Dim, all_candidates, broadcast_candidates},
    };
    use ndarray::{Array1, Array2, Array3, Axis, array, s};
    use ndarray_rand::{
        RandomExt,
        rand::{SeedableRng, rngs::StdRng},
        rand_distr::{Normal, Uniform},
    };
    use rayon::ThreadPoolBuilder;

    const NOISE: f64 = 0.4;

    /// Leakage of a label whose bits have different weights.
    fn weighted_bits(label: u8) -> f64 {
        let weights = [1., 0.8, 1.2, 0.9, 1.1, 1.3, 0.7, 1.0];
        let bits: f64 = (0..8)
            .map(|i| ((label >> i) & 1) as f64 * weights[i])
            .sum();

        bits + 2.
    }

    fn random_bytes(shape: (usize, usize), rng: &mut StdRng) -> Array2<u8> {
        Array2::random_using(shape, Uniform::new_inclusive(0u8, 255u8), rng)
    }

    #[test]
    fn test_linear_regression_exact_fit() {
        // Noiseless leakage is recovered exactly
        let labels = Array2::from_shape_fn((2, 300), |(b, n)| (n * 7 + b) as u8);
        let traces = Array3::from_shape_fn((2, 300, 1), |(b, n, _)| {
            weighted_bits(labels[[b, n]]) * (1. + b as f64)
        });

        let model = LinearRegression::fit(labels.view(), traces.view()).unwrap();
        let expected = [1., 0.8, 1.2, 0.9, 1.1, 1.3, 0.7, 1.0, 2.];
        for b in 0..2 {
            for (i, &beta) in model.coefficients().slice(s![b, .., 0]).iter().enumerate() {
                assert!((beta - expected[i] * (1. + b as f64)).abs() < 1e-9);
            }
        }
        assert!((model.predictions()[[1, 0xff, 0]] - 2. * weighted_bits(0xff)).abs() < 1e-9);
    }

    #[test]
    fn test_linear_regression_helper() {
        let mut rng = StdRng::seed_from_u64(0);
        let labels = random_bytes((3, 1000), &mut rng);
        let traces = Array3::random_using((3, 1000, 2), Normal::new(0., 1.).unwrap(), &mut rng);

        let mut processor = LinearRegressionProcessor::new(3, 2);
        for n in 0..labels.ncols() {
            processor.process(labels.column(n), traces.slice(s![.., n, ..]));
        }
        let sequential = processor.finalize().unwrap();
        let parallel = linear_regression(labels.view(), traces.view(), 64).unwrap();

        for (a, b) in sequential
            .coefficients()
            .iter()
            .zip(parallel.coefficients().iter())
        {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_linear_regression_reproducible() {
        let mut rng = StdRng::seed_from_u64(3);
        let labels = random_bytes((4, 5000), &mut rng);
        let traces = Array3::random_using((4, 5000, 3), Normal::new(0., 1e3).unwrap(), &mut rng);

        let fit = |num_threads| {
            ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .unwrap()
                .install(|| linear_regression(labels.view(), traces.view(), 100).unwrap())
        };
        let reference = fit(1);
        for _ in 0..5 {
            assert_eq!(
                fit(8).coefficients().mapv(f64::to_bits),
                reference.coefficients().mapv(f64::to_bits)
            );
        }
    }

    #[test]
    fn test_linear_regression_ill_conditioned() {
        // A single label only exercises one basis combination
        let labels = Array2::from_elem((1, 2000), 0x5a);
        let traces = Array3::from_shape_fn((1, 2000, 1), |(_, n, _)| n as f64);
        assert!(matches!(
            LinearRegression::fit(labels.view(), traces.view()),
            Err(Error::IllConditioned { block: 0 })
        ));

        let labels = Array2::from_elem((1, 2000), 0xff);
        assert!(matches!(
            LinearRegression::fit(labels.view(), traces.view()),
            Err(Error::IllConditioned { block: 0 })
        ));

        // Fewer than 9 traces
        let labels = array![[1u8, 2, 4, 8, 16, 32, 64, 128], [0, 1, 2, 3, 4, 5, 6, 7]];
        let traces = Array3::zeros((2, 8, 1));
        assert!(matches!(
            LinearRegression::fit(labels.view(), traces.view()),
            Err(Error::IllConditioned { block: 0 })
        ));

        // Second block is rank deficient: bit 7 is never set
        let labels = Array2::from_shape_fn((2, 512), |(b, n)| {
            if b == 0 { n as u8 } else { (n as u8) & 0x7f }
        });
        let traces = Array3::from_shape_fn((2, 512, 1), |(_, n, _)| (n % 13) as f64);
        assert!(matches!(
            LinearRegression::fit(labels.view(), traces.view()),
            Err(Error::IllConditioned { block: 1 })
        ));
    }

    #[test]
    fn test_linear_regression_minimal_design() {
        // 9 labels exercising every basis function independently
        let labels = array![[0u8, 1, 2, 4, 8, 16, 32, 64, 128]];
        let traces = labels.mapv(weighted_bits).insert_axis(Axis(2));
        let model = LinearRegression::fit(labels.view(), traces.view()).unwrap();

        assert!((model.coefficients()[[0, BASIS_SIZE - 1, 0]] - 2.).abs() < 1e-9);
        assert!((model.coefficients()[[0, 5, 0]] - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_linear_regression_scores() {
        let coefficients = Array3::from_shape_fn((1, BASIS_SIZE, 1), |(_, i, _)| i as f64);
        let model = LinearRegression::new(coefficients);

        let plaintexts = array![[0x0fu8, 0x30]];
        let traces = array![[[14.5], [16.]]];
        let keys = array![[0x00u8, 0x0f]];

        let predict = |label: u8| -> f64 {
            basis(label)
                .iter()
                .enumerate()
                .map(|(i, &x)| i as f64 * x as f64)
                .sum()
        };
        let loss = |key: u8| -> f64 {
            (14.5 - predict(key ^ 0x0f)).powi(2) + (16. - predict(key ^ 0x30)).powi(2)
        };

        let scores = model
            .keys_probability(plaintexts.view(), traces.view(), keys.view())
            .unwrap();
        assert_eq!(loss(0x00), 1.25);
        assert!((scores[[0, 0, 0]] - (-1.25f64).exp()).abs() < 1e-12);
        assert!((scores[[0, 1, 0]] / (-loss(0x0f)).exp() - 1.).abs() < 1e-12);

        let log_likelihood = model
            .log_likelihood(plaintexts.view(), traces.view(), keys.view())
            .unwrap();
        assert!((log_likelihood[[0, 1, 0]] + loss(0x0f)).abs() < 1e-12);
    }

    #[test]
    fn test_linear_regression_monotonicity() {
        let coefficients = Array3::from_shape_fn((1, BASIS_SIZE, 1), |(_, i, _)| 0.5 + i as f64);
        let model = LinearRegression::new(coefficients);
        let plaintexts = array![[0x21u8, 0x9c, 0x47]];
        let key = 0x3au8;

        let predicted: Vec<f64> = plaintexts
            .iter()
            .map(|&p| model.predictions()[[0, (key ^ p) as usize, 0]])
            .collect();
        let mut previous = f64::INFINITY;
        for offset in [0., 0.1, 0.5, 1., 2.] {
            let traces = Array3::from_shape_fn((1, 3, 1), |(_, n, _)| predicted[n] + offset);
            let scores = model
                .keys_probability(plaintexts.view(), traces.view(), array![[key]].view())
                .unwrap();

            assert!(scores[[0, 0, 0]] < previous);
            previous = scores[[0, 0, 0]];
        }
    }

    #[test]
    fn test_linear_regression_tie_break() {
        // Only the constant term: every candidate predicts the same leakage
        let coefficients = Array3::from_shape_fn((2, BASIS_SIZE, 2), |(_, i, _)| {
            if i == BASIS_SIZE - 1 { 1. } else { 0. }
        });
        let model = LinearRegression::new(coefficients);

        let plaintexts = array![[0x10u8, 0x20], [0xab, 0xcd]];
        let traces = Array3::from_elem((2, 2, 2), 0.75);
        assert_eq!(
            model.get_key(plaintexts.view(), traces.view()).unwrap(),
            array![0u8, 0]
        );
        assert_eq!(
            model
                .get_key_per_channel(plaintexts.view(), traces.view())
                .unwrap(),
            Array2::<u8>::zeros((2, 2))
        );
    }

    #[test]
    fn test_linear_regression_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        for blocks in [1, 4] {
            for channels in [1, 3] {
                let labels = random_bytes((blocks, 500), &mut rng);
                let traces = Array3::random_using(
                    (blocks, 500, channels),
                    Normal::new(0., 1.).unwrap(),
                    &mut rng,
                );
                let model = LinearRegression::fit(labels.view(), traces.view()).unwrap();

                for samples in [1, 10] {
                    let plaintexts = random_bytes((blocks, samples), &mut rng);
                    let traces = Array3::random_using(
                        (blocks, samples, channels),
                        Normal::new(0., 1.).unwrap(),
                        &mut rng,
                    );
                    for keys in [array![0xc4u8], Array1::from_iter(0..=255u8)] {
                        let keys = broadcast_candidates(keys.view(), blocks);
                        let scores = model
                            .keys_probability(plaintexts.view(), traces.view(), keys.view())
                            .unwrap();
                        assert_eq!(scores.shape(), &[blocks, keys.ncols(), channels]);
                    }

                    let wrong_plaintexts = random_bytes((blocks, samples + 1), &mut rng);
                    assert!(matches!(
                        model.keys_probability(
                            wrong_plaintexts.view(),
                            traces.view(),
                            all_candidates(blocks).view()
                        ),
                        Err(Error::ShapeMismatch {
                            axis: Dim::Sample,
                            ..
                        })
                    ));
                }
            }
        }
    }

    #[test]
    fn test_linear_regression_recovers_key() {
        let mut rng = StdRng::seed_from_u64(2);
        let blocks = 4;
        let secret = Array1::random_using(blocks, Uniform::new_inclusive(0u8, 255u8), &mut rng);

        let profiling_keys = random_bytes((blocks, 2000), &mut rng);
        let profiling_plaintexts = random_bytes((blocks, 2000), &mut rng);
        let labels = &profiling_keys ^ &profiling_plaintexts;
        let profiling_traces = labels.mapv(|l| l.count_ones() as f64).insert_axis(Axis(2))
            + Array3::random_using((blocks, 2000, 1), Normal::new(0., NOISE).unwrap(), &mut rng);
        let model = LinearRegression::fit_with_keys(
            profiling_keys.view(),
            profiling_plaintexts.view(),
            profiling_traces.view(),
        )
        .unwrap();

        let mut successes = 0;
        for _ in 0..50 {
            let plaintexts = random_bytes((blocks, 50), &mut rng);
            let traces = Array3::from_shape_fn((blocks, 50, 1), |(b, n, _)| {
                (secret[b] ^ plaintexts[[b, n]]).count_ones() as f64
            }) + Array3::random_using((blocks, 50, 1), Normal::new(0., NOISE).unwrap(), &mut rng);

            let guess = model.get_key(plaintexts.view(), traces.view()).unwrap();
            assert_eq!(
                guess,
                model.get_key(plaintexts.view(), traces.view()).unwrap()
            );
            if guess == secret {
                successes += 1;
            }
        }
        assert!(successes >= 48, "{successes} successes out of 50");
    }
}
