//! Profiling and attack sets stored as numpy files.
//!
//! A dataset directory holds:
//! - `plaintexts.npy`: `[N, B]` plaintext bytes,
//! - `traces.npy`: `[N, S]` raw traces, one per encryption,
//! - `keys.npy` (optional for attack sets): `[N, B]` key bytes.
//!
//! Datasets are stored acquisition-major as acquired, and converted to the block-major shapes of
//! [`crate::shape`] when handed to a leakage model.
use itertools::Itertools;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use ndarray_npy::{ReadableElement, read_npy};
use num_traits::AsPrimitive;
use std::{fs, path::Path};

use crate::{
    Error,
    shape::{Dim, labels},
};

#[derive(Debug, Clone)]
pub struct Dataset {
    /// Key bytes, `[N, B]`
    keys: Option<Array2<u8>>,
    /// Plaintext bytes, `[N, B]`
    plaintexts: Array2<u8>,
    /// Raw traces, `[N, S]`
    traces: Array2<f64>,
}

impl Dataset {
    /// Create a dataset from acquisition-major arrays.
    pub fn new(
        keys: Option<Array2<u8>>,
        plaintexts: Array2<u8>,
        traces: Array2<f64>,
    ) -> Result<Self, Error> {
        check_len(Dim::Sample, plaintexts.nrows(), traces.nrows())?;
        if let Some(keys) = &keys {
            check_len(Dim::Sample, plaintexts.nrows(), keys.nrows())?;
            check_len(Dim::Block, plaintexts.ncols(), keys.ncols())?;
        }

        Ok(Self {
            keys,
            plaintexts,
            traces,
        })
    }

    /// Load a dataset directory whose traces are stored as `T`.
    pub fn load<T, P>(dir: P) -> Result<Self, Error>
    where
        T: ReadableElement + AsPrimitive<f64>,
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();

        let keys_path = dir.join("keys.npy");
        let keys = if keys_path.exists() {
            Some(read_npy(keys_path)?)
        } else {
            None
        };
        let plaintexts = read_npy(dir.join("plaintexts.npy"))?;
        let traces: Array2<T> = read_npy(dir.join("traces.npy"))?;

        log::debug!(
            "Loaded {} traces of {} samples from {}",
            traces.nrows(),
            traces.ncols(),
            dir.display()
        );

        Self::new(keys, plaintexts, traces.mapv(|x| x.as_()))
    }

    /// Number of acquisitions.
    pub fn len(&self) -> usize {
        self.traces.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of key bytes per acquisition.
    pub fn num_blocks(&self) -> usize {
        self.plaintexts.ncols()
    }

    /// Number of samples per raw trace.
    pub fn num_samples(&self) -> usize {
        self.traces.ncols()
    }

    /// Return the `[N, B]` keys, if known.
    pub fn keys(&self) -> Option<ArrayView2<u8>> {
        self.keys.as_ref().map(|keys| keys.view())
    }

    /// Return the `[B, N]` plaintexts.
    pub fn plaintexts(&self) -> Array2<u8> {
        self.plaintexts.t().to_owned()
    }

    /// Return the `[B, N]` labels `key ^ plaintext`, if the keys are known.
    pub fn labels(&self) -> Option<Array2<u8>> {
        let keys = self.keys.as_ref()?;

        labels(keys.t(), self.plaintexts.t()).ok()
    }

    /// Return the `[B, N, P]` traces restricted to the given points of interest.
    ///
    /// Every block sees the same points of interest.
    pub fn traces(&self, pois: &[usize]) -> Result<Array3<f64>, Error> {
        let samples = self.num_samples();
        if let Some(&index) = pois.iter().find(|&&index| index >= samples) {
            return Err(Error::PoiOutOfRange { index, samples });
        }

        let selected = self.traces.select(Axis(1), pois);

        Ok(Array3::from_shape_fn(
            (self.num_blocks(), self.len(), pois.len()),
            |(_, n, p)| selected[[n, p]],
        ))
    }
}

fn check_len(axis: Dim, expected: usize, found: usize) -> Result<(), Error> {
    if expected != found {
        return Err(Error::ShapeMismatch {
            axis,
            expected,
            found,
        });
    }

    Ok(())
}

/// Merge point of interest selections into a sorted list without duplicates.
pub fn union_pois<I, J>(selections: I) -> Vec<usize>
where
    I: IntoIterator<Item = J>,
    J: IntoIterator<Item = usize>,
{
    selections
        .into_iter()
        .flatten()
        .sorted_unstable()
        .dedup()
        .collect()
}

/// Load and merge every `*.npy` point of interest selection of a directory.
///
/// Selections are 1-D arrays of `i64` indices, as saved by numpy. A negative index is never in
/// range of a trace and is mapped to `usize::MAX`.
pub fn load_pois<P: AsRef<Path>>(dir: P) -> Result<Vec<usize>, Error> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "npy") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut selections = Vec::with_capacity(paths.len());
    for path in &paths {
        let selection: ndarray::Array1<i64> = read_npy(path)?;
        log::trace!("{} points of interest in {}", selection.len(), path.display());

        selections.push(
            selection
                .into_iter()
                .map(|index| usize::try_from(index).unwrap_or(usize::MAX))
                .collect::<Vec<_>>(),
        );
    }

    Ok(union_pois(selections))
}
