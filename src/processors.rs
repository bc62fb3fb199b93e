//! Traces processing algorithms
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use std::ops::Add;

/// Processes traces to calculate the mean and variance of each class.
///
/// Accumulation follows Welford's online algorithm, and two processors are merged with Chan's
/// pairwise update, so that classes with a constant leakage have an exactly zero variance.
#[derive(Debug, Clone)]
pub struct MeanVar {
    /// Mean of traces per class
    mean: Array2<f64>,
    /// Sum of squared deviations from the mean per class
    m2: Array2<f64>,
    /// Number of traces processed per class
    count: Array1<usize>,
}

impl MeanVar {
    /// Creates a new mean and variance processor.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of samples per trace
    /// * `num_classes` - Number of classes
    pub fn new(size: usize, num_classes: usize) -> Self {
        Self {
            mean: Array2::zeros((num_classes, size)),
            m2: Array2::zeros((num_classes, size)),
            count: Array1::zeros(num_classes),
        }
    }

    /// Processes an input trace to update internal accumulators.
    ///
    /// # Panics
    /// - Panics in debug if the length of the trace is different form the size of [`MeanVar`].
    /// - Panics if `class >= self.num_classes()`.
    pub fn process(&mut self, trace: ArrayView1<f64>, class: usize) {
        debug_assert!(trace.len() == self.size());

        self.count[class] += 1;
        let count = self.count[class] as f64;

        let mut mean = self.mean.row_mut(class);
        let mut m2 = self.m2.row_mut(class);
        for i in 0..trace.len() {
            let delta = trace[i] - mean[i];
            mean[i] += delta / count;
            m2[i] += delta * (trace[i] - mean[i]);
        }
    }

    /// Returns the mean of each class, as a `[classes, size]` array.
    ///
    /// The mean of a class without any trace is zero.
    pub fn mean(&self) -> ArrayView2<f64> {
        self.mean.view()
    }

    /// Returns the population variance of each class, as a `[classes, size]` array.
    ///
    /// The variance of a class without any trace is NaN.
    pub fn var(&self) -> Array2<f64> {
        let mut var = self.m2.clone();
        for (mut row, &count) in var.outer_iter_mut().zip(self.count.iter()) {
            row /= count as f64;
        }

        var
    }

    /// Returns the number of traces processed per class.
    pub fn count(&self) -> ArrayView1<usize> {
        self.count.view()
    }

    /// Returns the trace size handled.
    pub fn size(&self) -> usize {
        self.mean.ncols()
    }

    /// Returns the number of classes handled.
    pub fn num_classes(&self) -> usize {
        self.count.len()
    }

    /// Determine if two [`MeanVar`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.size() == other.size() && self.num_classes() == other.num_classes()
    }
}

impl Add for MeanVar {
    type Output = Self;

    /// Merge computations of two [`MeanVar`]. Processors need to be compatible to be merged
    /// together, otherwise it can panic or yield incoherent result (see
    /// [`MeanVar::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(mut self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        for class in 0..self.num_classes() {
            let count_a = self.count[class] as f64;
            let count_b = rhs.count[class] as f64;
            let count = count_a + count_b;
            if count_b == 0. {
                continue;
            }
            if count_a == 0. {
                self.mean.row_mut(class).assign(&rhs.mean.row(class));
                self.m2.row_mut(class).assign(&rhs.m2.row(class));
                self.count[class] = rhs.count[class];
                continue;
            }

            Zip::from(self.mean.row_mut(class))
                .and(self.m2.row_mut(class))
                .and(rhs.mean.row(class))
                .and(rhs.m2.row(class))
                .for_each(|mean, m2, &mean_b, &m2_b| {
                    let delta = mean_b - *mean;
                    *mean += delta * count_b / count;
                    *m2 += m2_b + delta * delta * count_a * count_b / count;
                });

            self.count[class] += rhs.count[class];
        }

        self
    }
}
