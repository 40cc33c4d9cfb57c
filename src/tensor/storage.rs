//! # Gradient Storage
//!
//! Defines how a gradient is laid out in memory. Backpropagation may hand the
//! optimizer either a dense array or a sparse coordinate list (embedding
//! lookups typically produce the latter). The adaptive update rules only
//! accept the dense layout and reject the sparse one explicitly.

use ndarray::{ArrayD, IxDyn};

use super::{TensorData, TensorError};

/// A gradient in one of the supported storage layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum Gradient {
    Dense(ArrayD<TensorData>),
    Sparse(SparseGradient),
}

impl Gradient {
    /// Logical shape of the gradient (the shape of the parameter it belongs to).
    pub fn shape(&self) -> &[usize] {
        match self {
            Gradient::Dense(a) => a.shape(),
            Gradient::Sparse(s) => &s.shape,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }

    /// Borrows the dense array, or `None` for sparse gradients.
    pub fn as_dense(&self) -> Option<&ArrayD<TensorData>> {
        match self {
            Gradient::Dense(a) => Some(a),
            Gradient::Sparse(_) => None,
        }
    }

    /// Materializes the gradient as a dense array.
    pub fn to_dense(&self) -> Result<ArrayD<TensorData>, TensorError> {
        match self {
            Gradient::Dense(a) => Ok(a.clone()),
            Gradient::Sparse(s) => s.to_dense(),
        }
    }

    /// Multiplies every stored value by `factor`.
    pub fn scale(&mut self, factor: TensorData) {
        match self {
            Gradient::Dense(a) => a.mapv_inplace(|v| v * factor),
            Gradient::Sparse(s) => s.values.iter_mut().for_each(|v| *v *= factor),
        }
    }
}

/// Coordinate-list sparse gradient: `values[i]` sits at `indices[i]`.
/// Duplicate coordinates are summed when densified.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseGradient {
    shape: Vec<usize>,
    indices: Vec<Vec<usize>>,
    values: Vec<TensorData>,
}

impl SparseGradient {
    /// Builds a sparse gradient, checking every coordinate against `shape`.
    pub fn new(shape: &[usize], indices: Vec<Vec<usize>>, values: Vec<TensorData>) -> Result<Self, TensorError> {
        if indices.len() != values.len() {
            return Err(TensorError::SparseLengthMismatch {
                indices: indices.len(),
                values: values.len(),
            });
        }
        for index in &indices {
            let in_bounds = index.len() == shape.len() && index.iter().zip(shape).all(|(i, d)| i < d);
            if !in_bounds {
                return Err(TensorError::IndexOutOfBounds {
                    index: index.clone(),
                    shape: shape.to_vec(),
                });
            }
        }
        Ok(SparseGradient {
            shape: shape.to_vec(),
            indices,
            values,
        })
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn to_dense(&self) -> Result<ArrayD<TensorData>, TensorError> {
        let mut dense = ArrayD::zeros(IxDyn(&self.shape));
        for (index, value) in self.indices.iter().zip(&self.values) {
            let slot = dense.get_mut(index.as_slice()).ok_or_else(|| TensorError::IndexOutOfBounds {
                index: index.clone(),
                shape: self.shape.clone(),
            })?;
            *slot += *value;
        }
        Ok(dense)
    }
}
