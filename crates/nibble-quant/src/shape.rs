//! Shape of a row-major tensor view

use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};

/// Dimensions of a row-major tensor; the element count is their product
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Shape with the given dimensions
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Copies dimensions from a slice (e.g. `ndarray`'s `shape()`)
    pub fn from_slice(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec() }
    }

    /// Flat buffer of `size` elements
    pub fn vector(size: usize) -> Self {
        Self { dims: vec![size] }
    }

    /// Weight matrix of `rows x cols`
    pub fn matrix(rows: usize, cols: usize) -> Self {
        Self { dims: vec![rows, cols] }
    }

    /// Rank
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Dimensions, outermost first
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Element count; use [`Shape::checked_numel`] for untrusted shapes
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the total number of elements, failing instead of wrapping on overflow
    pub fn checked_numel(&self) -> Result<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).ok_or_else(|| {
            QuantError::shape_mismatch(
                "SHAPE_TOO_LARGE",
                "element count overflows usize",
                "a representable element count",
                self.to_string(),
                "shape validation",
            )
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(usize::to_string).collect();
        write!(f, "({})", dims.join(", "))
    }
}

impl Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::from_slice(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_creation() {
        let shape = Shape::vector(10);
        assert_eq!(shape.ndim(), 1);
        assert_eq!(shape.numel(), 10);

        let shape = Shape::matrix(3, 4);
        assert_eq!(shape.ndim(), 2);
        assert_eq!(shape.numel(), 12);
        assert_eq!(shape[1], 4);
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::from_slice(&[2, 3, 4]).to_string(), "(2, 3, 4)");
    }

    #[test]
    fn test_checked_numel_overflow() {
        let shape = Shape::from_slice(&[usize::MAX, 2]);
        assert!(shape.checked_numel().is_err());
        assert_eq!(Shape::matrix(8, 8).checked_numel().unwrap(), 64);
    }
}
