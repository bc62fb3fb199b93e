//! Canonical tensor shapes and their structural validation.
//!
//! Every array handled by the leakage models follows the same axis order:
//!
//! | axis        | size | profiling        | scoring                        |
//! |-------------|------|------------------|--------------------------------|
//! | `Block`     | B    | batched over     | batched over                   |
//! | `Sample`    | N    | reduced over     | reduced over                   |
//! | `Candidate` | K    | -                | indexed by the key hypothesis  |
//! | `Channel`   | P    | batched over     | batched over                   |
//!
//! Plaintexts and labels are `[B, N]`, traces `[B, N, P]`, key candidates `[B, K]` and scores
//! `[B, K, P]`. No implicit broadcasting happens: a degenerate axis is kept with size 1 and
//! callers insert or squeeze it at the boundary.
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3};
use std::fmt;

use crate::Error;

/// Number of values a key byte (and thus a label) can take.
pub const NUM_CLASSES: usize = 256;

/// Axes of the canonical tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Block,
    Sample,
    Candidate,
    Channel,
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dim::Block => "block",
            Dim::Sample => "sample",
            Dim::Candidate => "candidate",
            Dim::Channel => "channel",
        };

        f.write_str(name)
    }
}

/// Sizes of the canonical axes of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub blocks: usize,
    pub samples: usize,
    pub candidates: usize,
    pub channels: usize,
}

impl Dims {
    /// Check that the blocks and channels match the ones of a fitted model.
    pub fn check_model(&self, blocks: usize, channels: usize) -> Result<(), Error> {
        expect_len(Dim::Block, blocks, self.blocks)?;
        expect_len(Dim::Channel, channels, self.channels)
    }
}

fn expect_len(axis: Dim, expected: usize, found: usize) -> Result<(), Error> {
    if expected != found {
        return Err(Error::ShapeMismatch {
            axis,
            expected,
            found,
        });
    }

    Ok(())
}

fn expect_non_empty(axis: Dim, len: usize) -> Result<(), Error> {
    if len == 0 {
        return Err(Error::EmptyAxis { axis });
    }

    Ok(())
}

/// Validate profiling inputs: `labels` is `[B, N]` and `traces` is `[B, N, P]`.
///
/// The returned [`Dims`] has the full class space as candidates.
pub fn profiling_dims(labels: ArrayView2<u8>, traces: ArrayView3<f64>) -> Result<Dims, Error> {
    let (blocks, samples) = labels.dim();
    let (trace_blocks, trace_samples, channels) = traces.dim();

    expect_len(Dim::Block, blocks, trace_blocks)?;
    expect_len(Dim::Sample, samples, trace_samples)?;
    expect_non_empty(Dim::Block, blocks)?;
    expect_non_empty(Dim::Sample, samples)?;
    expect_non_empty(Dim::Channel, channels)?;

    Ok(Dims {
        blocks,
        samples,
        candidates: NUM_CLASSES,
        channels,
    })
}

/// Validate scoring inputs: `plaintexts` is `[B, N]`, `traces` is `[B, N, P]` and `keys` is
/// `[B, K]`.
pub fn attack_dims(
    plaintexts: ArrayView2<u8>,
    traces: ArrayView3<f64>,
    keys: ArrayView2<u8>,
) -> Result<Dims, Error> {
    let (blocks, samples) = plaintexts.dim();
    let (trace_blocks, trace_samples, channels) = traces.dim();
    let (key_blocks, candidates) = keys.dim();

    expect_len(Dim::Block, blocks, trace_blocks)?;
    expect_len(Dim::Block, blocks, key_blocks)?;
    expect_len(Dim::Sample, samples, trace_samples)?;
    expect_non_empty(Dim::Block, blocks)?;
    expect_non_empty(Dim::Sample, samples)?;
    expect_non_empty(Dim::Candidate, candidates)?;
    expect_non_empty(Dim::Channel, channels)?;

    Ok(Dims {
        blocks,
        samples,
        candidates,
        channels,
    })
}

/// Return the full `[B, 256]` candidate space.
pub fn all_candidates(blocks: usize) -> Array2<u8> {
    Array2::from_shape_fn((blocks, NUM_CLASSES), |(_, k)| k as u8)
}

/// Repeat the same candidate list for every block, giving a `[B, K]` array.
pub fn broadcast_candidates(keys: ArrayView1<u8>, blocks: usize) -> Array2<u8> {
    Array2::from_shape_fn((blocks, keys.len()), |(_, k)| keys[k])
}

/// Compute the `[B, N]` labels `key ^ plaintext` of a profiling set.
pub fn labels(keys: ArrayView2<u8>, plaintexts: ArrayView2<u8>) -> Result<Array2<u8>, Error> {
    expect_len(Dim::Block, keys.nrows(), plaintexts.nrows())?;
    expect_len(Dim::Sample, keys.ncols(), plaintexts.ncols())?;

    Ok(&keys ^ &plaintexts)
}
