//! Gaussian template attack.
use ndarray::{Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::{iter::zip, ops::Add};

use crate::{
    Error,
    leakage_model::{DEFAULT_BATCH_SIZE, LeakageModel, score_candidates},
    processors::MeanVar,
    shape::{NUM_CLASSES, attack_dims, profiling_dims},
};

/// ln(√(2π))
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Fit a [`Template`] on the given labels and traces using [`TemplateProcessor`].
///
/// `labels` is `[B, N]` and `traces` is `[B, N, P]`. Samples are processed in parallel by batches
/// of `batch_size`.
///
/// # Examples
/// ```
/// use leakprof::leakage_model::{LeakageModel, template::template};
/// use ndarray::{Array2, Array3};
///
/// // Two traces per class, leaking the Hamming weight of the label on a single channel.
/// let labels = Array2::from_shape_fn((1, 512), |(_, n)| (n % 256) as u8);
/// let traces = Array3::from_shape_fn((1, 512, 1), |(_, n, _)| {
///     (n % 256).count_ones() as f64 + if n < 256 { 0.1 } else { -0.1 }
/// });
///
/// let model = template(labels.view(), traces.view(), 64).unwrap();
/// assert_eq!(model.blocks(), 1);
/// assert!((model.std()[[0, 7, 0]] - 0.1).abs() < 1e-12);
/// ```
///
/// # Panics
/// Panic if `batch_size` is 0.
pub fn template(
    labels: ArrayView2<u8>,
    traces: ArrayView3<f64>,
    batch_size: usize,
) -> Result<Template, Error> {
    assert!(batch_size > 0);
    let dims = profiling_dims(labels, traces)?;

    // Batches are merged in sample order, whatever the number of threads
    let batches: Vec<_> = zip(
        labels.axis_chunks_iter(Axis(1), batch_size),
        traces.axis_chunks_iter(Axis(1), batch_size),
    )
    .collect();
    let processors: Vec<TemplateProcessor> = batches
        .into_par_iter()
        .map(|(label_batch, trace_batch)| {
            let mut template = TemplateProcessor::new(dims.blocks, dims.channels);
            template.update(label_batch, trace_batch);

            template
        })
        .collect();

    let template = processors
        .into_iter()
        .reduce(|a, b| a + b)
        .unwrap_or_else(|| TemplateProcessor::new(dims.blocks, dims.channels))
        .finalize()?;

    log::debug!(
        "Fitted template on {} blocks, {} samples, {} channels",
        dims.blocks,
        dims.samples,
        dims.channels
    );

    Ok(template)
}

/// Per-class Gaussian leakage model.
///
/// Every block, class and channel is described by an independent normal distribution whose mean
/// and standard deviation are estimated on profiling traces.
#[derive(Debug, Clone)]
pub struct Template {
    /// Mean of each class, `[B, 256, P]`
    mean: Array3<f64>,
    /// Population standard deviation of each class, `[B, 256, P]`
    std: Array3<f64>,
    /// ln(std), cached for scoring
    log_std: Array3<f64>,
}

impl Template {
    /// Build a template from its `[B, 256, P]` means and standard deviations.
    ///
    /// Returns [`Error::NonFiniteStatistics`] if a mean or a standard deviation is not finite and
    /// [`Error::ZeroVariance`] if a standard deviation is not strictly positive.
    ///
    /// # Panics
    /// Panic if `mean` and `std` do not have the same shape or do not have 256 classes.
    pub fn new(mean: Array3<f64>, std: Array3<f64>) -> Result<Self, Error> {
        assert_eq!(mean.shape(), std.shape());
        assert_eq!(mean.shape()[1], NUM_CLASSES);

        for (((block, class, channel), &m), &s) in mean.indexed_iter().zip(std.iter()) {
            if !m.is_finite() || !s.is_finite() {
                return Err(Error::NonFiniteStatistics {
                    block,
                    class,
                    channel,
                });
            }
            if s <= 0. {
                return Err(Error::ZeroVariance {
                    block,
                    class,
                    channel,
                });
            }
        }

        let log_std = std.mapv(f64::ln);

        Ok(Self { mean, std, log_std })
    }

    /// Return the `[B, 256, P]` class means.
    pub fn mean(&self) -> ArrayView3<f64> {
        self.mean.view()
    }

    /// Return the `[B, 256, P]` class standard deviations.
    pub fn std(&self) -> ArrayView3<f64> {
        self.std.view()
    }

    /// Log-density of `x` under the distribution of `label` for the given block and channel.
    fn log_density(&self, block: usize, label: u8, channel: usize, x: f64) -> f64 {
        let index = [block, label as usize, channel];
        let z = (x - self.mean[index]) / self.std[index];

        -LN_SQRT_2PI - self.log_std[index] - 0.5 * z * z
    }
}

impl LeakageModel for Template {
    fn fit(labels: ArrayView2<u8>, traces: ArrayView3<f64>) -> Result<Self, Error> {
        template(labels, traces, DEFAULT_BATCH_SIZE)
    }

    fn blocks(&self) -> usize {
        self.mean.shape()[0]
    }

    fn channels(&self) -> usize {
        self.mean.shape()[2]
    }

    /// Gaussian log-likelihood of each key candidate, summed over the samples.
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
            |block, label, channel, x| self.log_density(block, label, channel, x),
        ))
    }

    /// The score of a template is its log-likelihood.
    ///
    /// Use [`LeakageModel::keys_distribution`] to get normalized probabilities.
    fn keys_probability(
        &self,
        plaintexts: ArrayView2<u8>,
        traces: ArrayView3<f64>,
        keys: ArrayView2<u8>,
    ) -> Result<Array3<f64>, Error> {
        self.log_likelihood(plaintexts, traces, keys)
    }
}

/// A processor that accumulates the statistics of a [`Template`].
#[derive(Debug, Clone)]
pub struct TemplateProcessor {
    /// Number of channels per trace
    num_channels: usize,
    /// Per-class statistics of each block
    blocks: Vec<MeanVar>,
}

impl TemplateProcessor {
    pub fn new(num_blocks: usize, num_channels: usize) -> Self {
        Self {
            num_channels,
            blocks: vec![MeanVar::new(num_channels, NUM_CLASSES); num_blocks],
        }
    }

    /// Process the traces of one acquisition: `labels` is `[B]` and `traces` is `[B, P]`.
    ///
    /// # Panics
    /// Panic in debug if the shapes do not match the processor.
    pub fn process(&mut self, labels: ArrayView1<u8>, traces: ArrayView2<f64>) {
        debug_assert_eq!(labels.len(), self.blocks.len());
        debug_assert_eq!(traces.dim(), (self.blocks.len(), self.num_channels));

        for ((mean_var, &label), trace) in self.blocks.iter_mut().zip(labels).zip(traces.rows()) {
            mean_var.process(trace, label as usize);
        }
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
    /// Every class of every block must have been observed, and must not have a constant
    /// leakage.
    pub fn finalize(&self) -> Result<Template, Error> {
        let shape = (self.blocks.len(), NUM_CLASSES, self.num_channels);
        let mut mean = Array3::zeros(shape);
        let mut std = Array3::zeros(shape);

        for (block, mean_var) in self.blocks.iter().enumerate() {
            if let Some(class) = mean_var.count().iter().position(|&count| count == 0) {
                return Err(Error::MissingClass { block, class });
            }

            mean.index_axis_mut(Axis(0), block).assign(&mean_var.mean());
            std.index_axis_mut(Axis(0), block)
                .assign(&mean_var.var().mapv(f64::sqrt));
        }

        Template::new(mean, std)
    }

    /// Determine if two [`TemplateProcessor`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.num_channels == other.num_channels && self.blocks.len() == other.blocks.len()
    }
}

impl Add for TemplateProcessor {
    type Output = Self;

    /// Merge computations of two [`TemplateProcessor`]. Processors need to be compatible to be
    /// merged together, otherwise it can panic or yield incoherent result (see
    /// [`TemplateProcessor::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        Self {
            num_channels: self.num_channels,
            blocks: zip(self.blocks, rhs.blocks).map(|(a, b)| a + b).collect(),
        }
    }
}
