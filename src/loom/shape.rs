use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Dimensions of a dense, row-major tensor.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl Shape {
    #[inline]
    pub fn new(dims: impl Into<Arc<[usize]>>) -> Self {
        Self(dims.into())
    }

    /// Number of dimensions.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Number of elements. A zero-rank shape describes no storage and has size 0.
    #[inline]
    pub fn size(&self) -> usize {
        match self.ndim() {
            0 => 0,
            _ => self.0.iter().product(),
        }
    }

    /// Number of elements, or `None` if the product overflows.
    #[inline]
    pub fn checked_size(&self) -> Option<usize> {
        match self.ndim() {
            0 => Some(0),
            _ => self.0.iter().try_fold(1usize, |acc, &x| acc.checked_mul(x)),
        }
    }

    /// Returns the dimensions as a fixed-size array if the rank matches.
    #[inline]
    pub fn to_array<const N: usize>(&self) -> Option<[usize; N]> {
        self.0.as_ref().try_into().ok()
    }
}

pub trait IntoShape {
    fn into_shape(self) -> Shape;
}

impl IntoShape for Shape {
    #[inline]
    fn into_shape(self) -> Shape {
        self
    }
}

impl IntoShape for &Shape {
    #[inline]
    fn into_shape(self) -> Shape {
        self.clone()
    }
}

impl IntoShape for usize {
    #[inline]
    fn into_shape(self) -> Shape {
        Shape::new([self])
    }
}

impl<const N: usize> IntoShape for [usize; N] {
    #[inline]
    fn into_shape(self) -> Shape {
        Shape::new(self)
    }
}

impl IntoShape for Vec<usize> {
    #[inline]
    fn into_shape(self) -> Shape {
        Shape::new(self)
    }
}

impl IntoShape for &[usize] {
    #[inline]
    fn into_shape(self) -> Shape {
        Shape::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{IntoShape, Shape};

    #[test]
    fn test_size() {
        assert_eq!(Shape::default().size(), 0);
        assert_eq!([4, 4].into_shape().size(), 16);
        assert_eq!([3, 0, 2].into_shape().size(), 0);
        assert_eq!([usize::MAX, 2].into_shape().checked_size(), None);
        assert_eq!([2, 3].into_shape().to_array(), Some([2, 3]));
        assert_eq!([2, 3].into_shape().to_array::<3>(), None);
        assert_eq!(format!("{}", [2, 3].into_shape()), "[2, 3]");
    }
}
