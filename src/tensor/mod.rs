//! # Tensor Module
//!
//! This module defines the `Tensor` handle the optimizers work on: a shared,
//! lock-protected `ndarray::ArrayD` plus a gradient slot that an external
//! backpropagation mechanism fills in before each optimizer step.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{ArrayD, IxDyn};
use rand::distributions::{Distribution, Uniform};

// --- Submodules ---
pub mod ops;
pub mod storage;

// --- Re-exports ---
pub use storage::{Gradient, SparseGradient};

// --- Error Handling ---
#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    #[error("Sparse gradient has {indices} indices but {values} values")]
    SparseLengthMismatch { indices: usize, values: usize },
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
    #[error("Generic error: {0}")]
    Generic(String),
}

// Element type of every tensor, gradient and state buffer.
pub type TensorData = f32;

/// # Tensor
///
/// A parameter tensor shared between the training program and the optimizer.
///
/// Cloning a `Tensor` is cheap and yields a handle to the *same* storage and
/// the *same* gradient slot, so a gradient written through the model's handle
/// is visible to the optimizer's handle and vice versa. The optimizer only
/// ever mutates the data in place; it never swaps the underlying array.
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Arc<RwLock<ArrayD<TensorData>>>,
    shape: Vec<usize>,
    grad: Arc<Mutex<Option<Gradient>>>,
    requires_grad: bool,
}

impl Tensor {
    /// Creates a new Tensor from an ndarray::ArrayD.
    pub fn new(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            data: Arc::new(RwLock::new(data)),
            shape,
            grad: Arc::new(Mutex::new(None)),
            requires_grad,
        }
    }

    /// Creates a tensor from a flat vector and a shape.
    pub fn from_vec(shape: &[usize], values: Vec<TensorData>, requires_grad: bool) -> Result<Self, TensorError> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Self::new(data, requires_grad))
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Provides read-only access to the underlying data.
    /// Note: This locks the RwLock for reading.
    pub fn data(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.data.read().expect("Tensor data RwLock poisoned")
    }

    /// Provides mutable access to the underlying data.
    /// Note: This locks the RwLock for writing.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.data.write().expect("Tensor data RwLock poisoned")
    }

    /// Clones the underlying data into a new ArrayD.
    pub fn data_clone(&self) -> ArrayD<TensorData> {
        self.data().clone()
    }

    /// Returns true when both handles point at the same storage.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Address of the shared data buffer. Equal keys mean [`same_storage`](Self::same_storage)
    /// for as long as both handles are alive.
    pub(crate) fn storage_key(&self) -> usize {
        Arc::as_ptr(&self.data) as *const () as usize
    }

    fn grad_slot(&self) -> MutexGuard<'_, Option<Gradient>> {
        self.grad.lock().expect("Gradient Mutex poisoned")
    }

    /// Stores a gradient for this tensor, replacing any previous one.
    /// The gradient's logical shape must match the tensor's shape.
    pub fn set_grad(&self, grad: Gradient) -> Result<(), TensorError> {
        if grad.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: grad.shape().to_vec(),
            });
        }
        *self.grad_slot() = Some(grad);
        Ok(())
    }

    /// Convenience wrapper around `set_grad` for dense gradients.
    pub fn set_dense_grad(&self, grad: ArrayD<TensorData>) -> Result<(), TensorError> {
        self.set_grad(Gradient::Dense(grad))
    }

    /// Accumulates a dense gradient into the slot, creating it when empty.
    pub fn accumulate_grad(&self, incoming: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if incoming.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: incoming.shape().to_vec(),
            });
        }
        let mut slot = self.grad_slot();
        match slot.as_mut() {
            Some(existing) => {
                let mut dense = existing.to_dense()?;
                dense += incoming;
                *existing = Gradient::Dense(dense);
            }
            None => *slot = Some(Gradient::Dense(incoming.clone())),
        }
        Ok(())
    }

    /// Retrieves a copy of the current gradient, if any.
    pub fn grad(&self) -> Option<Gradient> {
        self.grad_slot().clone()
    }

    /// Runs `f` against the gradient slot without cloning it.
    pub(crate) fn with_grad_mut<R>(&self, f: impl FnOnce(&mut Option<Gradient>) -> R) -> R {
        f(&mut self.grad_slot())
    }

    /// Zeroes the gradient of the tensor if it exists.
    /// Sparse gradients are dropped, since a zero sparse gradient carries no entries.
    pub fn zero_grad(&self) {
        let mut slot = self.grad_slot();
        match slot.as_mut() {
            Some(Gradient::Dense(g)) => g.fill(0.0),
            Some(Gradient::Sparse(_)) => *slot = None,
            None => {}
        }
    }

    /// Removes the gradient entirely, marking the tensor as frozen for the next step.
    pub fn clear_grad(&self) {
        *self.grad_slot() = None;
    }
}

// --- Helper functions ---

/// Helper to create a tensor filled with zeros.
pub fn zeros(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor filled with ones.
pub fn ones(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::ones(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor filled with a single value.
pub fn full(shape: &[usize], value: TensorData, requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::from_elem(IxDyn(shape), value), requires_grad)
}

/// Helper to create a tensor with values drawn uniformly from `[low, high)`.
pub fn rand_uniform(shape: &[usize], low: TensorData, high: TensorData, requires_grad: bool) -> Tensor {
    let dist = Uniform::new(low, high);
    let mut rng = rand::thread_rng();
    let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || dist.sample(&mut rng));
    Tensor::new(data, requires_grad)
}
