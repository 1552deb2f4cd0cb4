//! Borrowed tensor views and owned reconstructions

use std::fmt;

use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};
use crate::shape::Shape;

/// Precision in which dequantized values are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    /// 32-bit float, values are returned exactly as decoded
    #[default]
    F32,
    /// IEEE half precision; values are rounded to the nearest f16
    F16,
    /// Brain float; values are rounded to the nearest bf16
    BF16,
}

impl ComputeDType {
    /// Returns the size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ComputeDType::F32 => 4,
            ComputeDType::F16 | ComputeDType::BF16 => 2,
        }
    }

    /// Rounds an f32 through this dtype
    #[inline]
    pub fn round(&self, value: f32) -> f32 {
        match self {
            ComputeDType::F32 => value,
            ComputeDType::F16 => half::f16::from_f32(value).to_f32(),
            ComputeDType::BF16 => half::bf16::from_f32(value).to_f32(),
        }
    }
}

impl fmt::Display for ComputeDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComputeDType::F32 => "f32",
            ComputeDType::F16 => "f16",
            ComputeDType::BF16 => "bf16",
        };
        f.write_str(name)
    }
}

/// Immutable view over caller-owned row-major data
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    data: &'a [f32],
    shape: Shape,
}

impl<'a> TensorView<'a> {
    /// Creates a view, checking that the data length matches the shape
    pub fn new(data: &'a [f32], shape: Shape) -> Result<Self> {
        let numel = shape.checked_numel()?;
        if data.len() != numel {
            return Err(QuantError::shape_mismatch(
                "VIEW_LENGTH_MISMATCH",
                "data length does not match the shape's element count",
                format!("{} elements for shape {}", numel, shape),
                format!("{} elements", data.len()),
                "tensor view creation",
            ));
        }
        Ok(Self { data, shape })
    }

    /// Returns the flattened data in row-major order
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// Returns the shape
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the total number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// Owned tensor, used for dequantized reconstructions
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    /// Creates a tensor, checking that the data length matches the shape
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Result<Self> {
        let numel = shape.checked_numel()?;
        if data.len() != numel {
            return Err(QuantError::shape_mismatch(
                "TENSOR_LENGTH_MISMATCH",
                "data length does not match the shape's element count",
                format!("{} elements for shape {}", numel, shape),
                format!("{} elements", data.len()),
                "tensor creation",
            ));
        }
        Ok(Self { data, shape })
    }

    /// Copies a contiguous ndarray into an owned tensor
    pub fn from_array<S, D>(array: &ArrayBase<S, D>) -> Result<Self>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let shape = Shape::from_slice(array.shape());
        let data = match array.as_slice() {
            Some(slice) => slice.to_vec(),
            None => array.iter().copied().collect(),
        };
        Ok(Self { data, shape })
    }

    /// Borrows this tensor as a view
    pub fn view(&self) -> TensorView<'_> {
        TensorView { data: &self.data, shape: self.shape.clone() }
    }

    /// Returns the flattened data
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the shape
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the total number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Consumes the tensor and returns its data
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Converts into a dynamic-rank ndarray with the same shape
    pub fn into_ndarray(self) -> Result<ArrayD<f32>> {
        let dims = self.shape.dims().to_vec();
        ArrayD::from_shape_vec(IxDyn(&dims), self.data).map_err(|e| {
            QuantError::shape_mismatch(
                "TENSOR_NDARRAY_SHAPE",
                e.to_string(),
                format!("{:?}", dims),
                "incompatible buffer",
                "ndarray conversion",
            )
        })
    }

    /// Returns the values as half-precision floats
    pub fn to_f16(&self) -> Vec<half::f16> {
        self.data.iter().map(|&v| half::f16::from_f32(v)).collect()
    }

    /// Returns the values as brain floats
    pub fn to_bf16(&self) -> Vec<half::bf16> {
        self.data.iter().map(|&v| half::bf16::from_f32(v)).collect()
    }
}

impl<'a, S, D> TryFrom<&'a ArrayBase<S, D>> for TensorView<'a>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    type Error = QuantError;

    /// Borrows a standard-layout ndarray without copying. Use
    /// [`Tensor::from_array`] for arrays that are not in standard layout.
    fn try_from(array: &'a ArrayBase<S, D>) -> Result<Self> {
        let data = array.as_slice().ok_or_else(|| {
            QuantError::shape_mismatch(
                "VIEW_NOT_CONTIGUOUS",
                "array is not in standard (row-major, contiguous) layout",
                "standard layout",
                "strided layout",
                "tensor view creation",
            )
        })?;
        TensorView::new(data, Shape::from_slice(array.shape()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_view_length_check() {
        let data = vec![0.0f32; 6];
        assert!(TensorView::new(&data, Shape::matrix(2, 3)).is_ok());

        let short = vec![0.0f32; 5];
        let err = TensorView::new(&short, Shape::matrix(2, 3)).unwrap_err();
        assert_eq!(err.code(), "VIEW_LENGTH_MISMATCH");
    }

    #[test]
    fn test_compute_dtype_rounding() {
        assert_eq!(ComputeDType::F32.round(0.1), 0.1);
        assert_eq!(ComputeDType::F16.round(1.0), 1.0);
        assert!((ComputeDType::F16.round(0.1) - 0.1).abs() < 1e-4);
        assert!((ComputeDType::BF16.round(0.1) - 0.1).abs() < 1e-3);
        assert_ne!(ComputeDType::BF16.round(0.1), 0.1);
    }

    #[test]
    fn test_ndarray_roundtrip() {
        let array = Array2::from_shape_vec((2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let tensor = Tensor::from_array(&array).unwrap();
        assert_eq!(tensor.shape(), &Shape::matrix(2, 2));

        let back = tensor.into_ndarray().unwrap();
        assert_eq!(back.shape(), &[2, 2]);
        assert_eq!(back[[1, 0]], 3.0);
    }

    #[test]
    fn test_transposed_array_is_copied_in_logical_order() {
        let array = Array2::from_shape_vec((2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let transposed = array.t();
        assert!(TensorView::try_from(&transposed).is_err());

        let tensor = Tensor::from_array(&transposed).unwrap();
        assert_eq!(tensor.data(), &[1.0, 3.0, 2.0, 4.0]);
    }
}
