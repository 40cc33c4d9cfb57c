//! # Optimization Algorithms (`optim`)
//!
//! Adaptive per-parameter optimizers built on one shared engine:
//!
//! * [`AdaFactor`]: factored second-moment estimates with relative step sizes.
//! * [`Lars`]: layer-wise trust-ratio scaling with momentum.
//! * [`Nero`]: neuron-wise normalized updates with optional manifold projection.
//!
//! Each optimizer is a [`GroupedOptimizer`] parameterized by its
//! [`UpdateRule`]; the engine owns parameter groups and the per-parameter
//! state store, the rule owns the arithmetic.

use crate::tensor::{TensorData, TensorError};

// --- Submodules ---
pub mod adafactor;
pub mod engine;
pub mod group;
pub mod lars;
pub mod nero;
pub mod state;

// Re-export optimizers
pub use adafactor::{AdaFactor, AdaFactorConfig, AdaFactorRule, AdaFactorState, SecondMoment};
pub use engine::{GroupedOptimizer, UpdateRule};
pub use group::{HyperParams, ParamGroup};
pub use lars::{Lars, LarsConfig, LarsRule, LarsState};
pub use nero::{Nero, NeroConfig, NeroRule, NeroState};
pub use state::{ParamHandle, ParamState, StateStore};

// --- Errors ---

#[derive(thiserror::Error, Debug)]
pub enum OptimError {
    #[error("Invalid {name}: {value} (must be {requirement})")]
    InvalidHyperparameter {
        name: &'static str,
        value: f64,
        requirement: &'static str,
    },
    #[error("{optimizer} does not support sparse gradients")]
    SparseGradient { optimizer: &'static str },
    #[error("Unknown parameter handle {0}")]
    UnknownParameter(ParamHandle),
    #[error("Parameter group {0} does not exist")]
    UnknownGroup(usize),
    #[error("Parameter is already managed by this optimizer (handle {0})")]
    AlreadyManaged(ParamHandle),
    #[error("Parameter at position {position} appears more than once in the same group")]
    DuplicateInGroup { position: usize },
    #[error("State buffer '{buffer}' has shape {got:?}, expected {expected:?}")]
    StateShapeMismatch {
        buffer: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
}

/// Loss closure handed to [`Optimizer::step`]. It is invoked before any
/// parameter is touched, typically to recompute gradients.
pub type Closure<'a> = &'a mut dyn FnMut() -> Result<TensorData, TensorError>;

// --- Optimizer Trait ---

/// Base trait for all optimizers.
pub trait Optimizer {
    /// Performs a single optimization step over every group and parameter.
    ///
    /// If a closure is given it runs first and its loss is returned unchanged.
    /// On error the step stops immediately; parameters updated earlier in the
    /// same call stay updated.
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<TensorData>, OptimError>;

    /// Zeros the gradients of all parameters managed by the optimizer.
    fn zero_grad(&mut self);

    /// Reinitializes every per-parameter state and group step counter as if
    /// no step had been taken. Group configuration is left untouched.
    fn reset(&mut self) -> Result<(), OptimError>;

    /// Learning rate of the first parameter group.
    fn learning_rate(&self) -> TensorData;

    /// Sets the learning rate of every parameter group (for external schedulers).
    fn set_learning_rate(&mut self, lr: TensorData) -> Result<(), OptimError>;
}

// --- Hyperparameter validation ---

pub(crate) fn validate_non_negative(name: &'static str, value: TensorData) -> Result<(), OptimError> {
    if !(0.0 <= value) {
        return Err(OptimError::InvalidHyperparameter {
            name,
            value: value as f64,
            requirement: ">= 0",
        });
    }
    Ok(())
}

pub(crate) fn validate_beta(name: &'static str, value: TensorData) -> Result<(), OptimError> {
    if !(0.0 <= value && value < 1.0) {
        return Err(OptimError::InvalidHyperparameter {
            name,
            value: value as f64,
            requirement: "in [0, 1)",
        });
    }
    Ok(())
}
