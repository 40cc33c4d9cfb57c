//! # RTorch Optim
//!
//! Adaptive optimizers for tensor-valued parameters: AdaFactor, LARS and
//! Nero. The crate provides the tensor handle the optimizers update, a
//! shared engine for parameter groups and lazily-created per-parameter
//! state, and utilities for checkpointing and gradient preprocessing.
//!
//! Gradients are produced elsewhere (by an autograd engine or by hand) and
//! written into each tensor's gradient slot before [`optim::Optimizer::step`].

pub mod optim;
pub mod tensor;
pub mod utils;

pub use optim::{AdaFactor, AdaFactorConfig, Lars, LarsConfig, Nero, NeroConfig, OptimError, Optimizer};
pub use tensor::{Gradient, SparseGradient, Tensor, TensorData, TensorError};
