use std::io;
use thiserror::Error;

use crate::shape::Dim;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{axis} axis mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        axis: Dim,
        expected: usize,
        found: usize,
    },
    #[error("{axis} axis is empty")]
    EmptyAxis { axis: Dim },
    #[error("Ill-conditioned profiling data: singular Gram matrix for block {block}")]
    IllConditioned { block: usize },
    #[error("No profiling trace for class {class} of block {block}")]
    MissingClass { block: usize, class: usize },
    #[error("Zero standard deviation for class {class} of block {block} on channel {channel}")]
    ZeroVariance {
        block: usize,
        class: usize,
        channel: usize,
    },
    #[error("Non-finite statistics for class {class} of block {block} on channel {channel}")]
    NonFiniteStatistics {
        block: usize,
        class: usize,
        channel: usize,
    },
    #[error("Point of interest {index} is out of range for traces of {samples} samples")]
    PoiOutOfRange { index: usize, samples: usize },
    #[error("No resource named {0:?} in the manifest")]
    MissingResource(String),
    #[error("Failed to parse resource manifest")]
    ManifestError(#[from] serde_json::Error),
    #[error("Failed to read npy file")]
    ReadNpyError(#[from] ndarray_npy::ReadNpyError),
    #[error(transparent)]
    IoError(#[from] io::Error),
}
