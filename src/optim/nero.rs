//! # Nero Optimizer
//!
//! Neuron-wise relative updates with an optional per-neuron balance constraint.
//! Reference: Learning by Turning: Neural Architecture Aware Optimisation - https://arxiv.org/abs/2102.07227
//!
//! A "neuron" is a slice along the leading axis. With `constraints` enabled,
//! every neuron of a rank ≥ 2 parameter is kept at zero mean and unit norm.

use log::trace;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::engine::{GroupedOptimizer, UpdateRule};
use super::group::HyperParams;
use super::state::ensure_shape;
use super::{validate_beta, validate_non_negative, OptimError};
use crate::tensor::{ops, Tensor, TensorData};
use crate::utils::serialization::array;

/// Scale used when the parameter's mean neuron norm is exactly zero.
const ZERO_SCALE_FALLBACK: TensorData = 0.01;

/// Nero hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeroConfig {
    pub lr: TensorData,
    /// Decay of the running average of squared neuron gradient norms.
    pub beta: TensorData,
    /// Project rank ≥ 2 parameters to zero-mean, unit-norm neurons.
    pub constraints: bool,
}

impl Default for NeroConfig {
    fn default() -> Self {
        NeroConfig {
            lr: 0.01,
            beta: 0.999,
            constraints: true,
        }
    }
}

impl NeroConfig {
    pub fn lr(mut self, lr: TensorData) -> Self {
        self.lr = lr;
        self
    }

    pub fn beta(mut self, beta: TensorData) -> Self {
        self.beta = beta;
        self
    }

    pub fn constraints(mut self, constraints: bool) -> Self {
        self.constraints = constraints;
        self
    }
}

impl HyperParams for NeroConfig {
    fn validate(&self) -> Result<(), OptimError> {
        validate_non_negative("lr", self.lr)?;
        validate_beta("beta", self.beta)?;
        Ok(())
    }

    fn lr(&self) -> TensorData {
        self.lr
    }

    fn set_lr(&mut self, lr: TensorData) {
        self.lr = lr;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeroState {
    /// Per-parameter step counter, independent of the group counter.
    pub step: usize,
    /// Running average of squared neuron gradient norms, shaped like `neuron_norm(p)`.
    #[serde(with = "array")]
    pub exp_avg_sq: ArrayD<TensorData>,
    /// Mean neuron norm of the parameter when the state was created.
    pub scale: TensorData,
}

/// Subtracts each neuron's mean and divides by its norm, in place.
/// Neurons whose norm is zero after centering are left at zero.
pub fn project_neurons(x: &mut ArrayD<TensorData>) -> Result<(), OptimError> {
    let mean = ops::neuron_mean(x)?;
    *x -= &mean;
    let norm = ops::neuron_norm(x);
    ops::div_or_zero(x, &norm);
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeroRule;

impl UpdateRule for NeroRule {
    type Config = NeroConfig;
    type State = NeroState;

    fn name(&self) -> &'static str {
        "Nero"
    }

    fn init_state(&self, param: &Tensor, config: &NeroConfig) -> Result<NeroState, OptimError> {
        let mut data = param.data_mut();
        if config.constraints && data.ndim() > 1 {
            project_neurons(&mut data)?;
        }

        let norms = ops::neuron_norm(&data);
        let mut scale = norms.mean().unwrap_or(0.0);
        if scale == 0.0 {
            scale = ZERO_SCALE_FALLBACK;
        }
        trace!("Nero: initial scale {} for shape {:?}", scale, data.shape());

        Ok(NeroState {
            step: 0,
            exp_avg_sq: ArrayD::zeros(norms.raw_dim()),
            scale,
        })
    }

    fn update(
        &self,
        param: &mut ArrayD<TensorData>,
        grad: &ArrayD<TensorData>,
        state: &mut NeroState,
        config: &NeroConfig,
        _group_step: usize,
    ) -> Result<(), OptimError> {
        state.step += 1;
        let bias_correction = 1.0 - config.beta.powi(state.step as i32);

        let grad_norm_sq = ops::neuron_norm(grad).mapv(|n| n * n);
        ops::ema_in_place(&mut state.exp_avg_sq, &grad_norm_sq, config.beta);

        let denom = state.exp_avg_sq.mapv(|v| (v / bias_correction).sqrt());
        let mut grad_normed = grad.clone();
        ops::div_or_zero(&mut grad_normed, &denom);

        param.scaled_add(-config.lr * state.scale, &grad_normed);

        if config.constraints && param.ndim() > 1 {
            project_neurons(param)?;
        }
        Ok(())
    }

    fn check_state(&self, param: &Tensor, state: &NeroState, _config: &NeroConfig) -> Result<(), OptimError> {
        let expected = neuron_norm_shape(param.shape());
        ensure_shape("exp_avg_sq", &expected, state.exp_avg_sq.shape())
    }
}

fn neuron_norm_shape(shape: &[usize]) -> Vec<usize> {
    match shape.len() {
        0 | 1 => shape.to_vec(),
        n => {
            let mut view = vec![1; n];
            view[0] = shape[0];
            view
        }
    }
}

/// Nero optimizer.
pub type Nero = GroupedOptimizer<NeroRule>;

impl GroupedOptimizer<NeroRule> {
    /// Creates a new Nero optimizer instance.
    ///
    /// # Arguments
    /// * `params`: An iterator over the parameters to optimize.
    /// * `config`: Hyperparameters, validated eagerly.
    pub fn new<I>(params: I, config: NeroConfig) -> Result<Self, OptimError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_rule(NeroRule, params, config)
    }
}
