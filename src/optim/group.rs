//! # Parameter Groups
//!
//! A group is a list of parameters sharing one set of hyperparameters. Groups
//! may override any option of the optimizer's defaults; the engine reads the
//! configuration during a step and only ever writes the group's `step`
//! counter.

use std::fmt::Debug;

use super::state::ParamHandle;
use super::OptimError;
use crate::tensor::TensorData;

/// Hyperparameter record of one optimizer family.
pub trait HyperParams: Clone + Debug {
    /// Checks every option against its valid domain.
    fn validate(&self) -> Result<(), OptimError>;

    fn lr(&self) -> TensorData;

    fn set_lr(&mut self, lr: TensorData);
}

#[derive(Debug, Clone)]
pub struct ParamGroup<C> {
    pub(crate) params: Vec<ParamHandle>,
    pub(crate) config: C,
    pub(crate) step: usize,
}

impl<C: HyperParams> ParamGroup<C> {
    pub(crate) fn new(params: Vec<ParamHandle>, config: C) -> Result<Self, OptimError> {
        config.validate()?;
        Ok(ParamGroup { params, config, step: 0 })
    }

    pub fn params(&self) -> &[ParamHandle] {
        &self.params
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    /// Number of `step` calls this group has seen since construction or the last reset.
    pub fn step(&self) -> usize {
        self.step
    }
}
