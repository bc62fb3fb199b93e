//! Bit basis expansion of labels, the feature space of the linear regression model.
use ndarray::{Array, ArrayView, Axis, Dimension, RemoveAxis};

/// Number of basis functions: the 8 bits of a label and a constant term.
pub const BASIS_SIZE: usize = 9;

/// Expand a label into its 8 bits (least significant first) followed by a constant 1.
pub fn basis(label: u8) -> [u8; BASIS_SIZE] {
    let mut x = [1; BASIS_SIZE];
    for (i, bit) in x.iter_mut().take(8).enumerate() {
        *bit = (label >> i) & 1;
    }

    x
}

/// Expand an array of labels of any shape, adding a leading axis of size [`BASIS_SIZE`].
///
/// `expand(labels)[[i, ...]]` is `basis(labels[[...]])[i]`.
///
/// # Examples
/// ```
/// use leakprof::basis::expand;
/// use ndarray::array;
///
/// let x = expand(array![0b0000_0101u8, 0xff].view());
/// assert_eq!(x.column(0).to_vec(), vec![1, 0, 1, 0, 0, 0, 0, 0, 1]);
/// assert_eq!(x.column(1).to_vec(), vec![1; 9]);
/// ```
pub fn expand<D>(labels: ArrayView<u8, D>) -> Array<u8, D::Larger>
where
    D: Dimension,
    D::Larger: RemoveAxis,
{
    let mut shape = labels.view().insert_axis(Axis(0)).raw_dim();
    shape[0] = BASIS_SIZE;

    let mut x = Array::ones(shape);
    for (i, mut plane) in x.axis_iter_mut(Axis(0)).take(8).enumerate() {
        plane.zip_mut_with(&labels, |bit, &label| *bit = (label >> i) & 1);
    }

    x
}
