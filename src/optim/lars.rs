//! # LARS Optimizer
//!
//! Layer-wise Adaptive Rate Scaling.
//! Reference: Large Batch Training of Convolutional Networks - https://arxiv.org/abs/1708.03888
//!
//! Parameters of rank ≤ 1 (biases, normalization gains) get neither weight
//! decay nor trust-ratio scaling and follow plain heavy-ball momentum.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use super::engine::{GroupedOptimizer, UpdateRule};
use super::group::HyperParams;
use super::state::ensure_shape;
use super::{validate_non_negative, OptimError};
use crate::tensor::{ops, Tensor, TensorData};
use crate::utils::serialization::array;

/// LARS hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LarsConfig {
    pub lr: TensorData,
    pub weight_decay: TensorData,
    pub momentum: TensorData,
    pub trust_coefficient: TensorData,
    /// Damping of the gradient term in the momentum buffer, in `[0, 1]`.
    pub dampening: TensorData,
    pub nesterov: bool,
}

impl Default for LarsConfig {
    fn default() -> Self {
        LarsConfig {
            lr: 1e-3,
            weight_decay: 0.0,
            momentum: 0.9,
            trust_coefficient: 0.001,
            dampening: 0.0,
            nesterov: false,
        }
    }
}

impl LarsConfig {
    pub fn lr(mut self, lr: TensorData) -> Self {
        self.lr = lr;
        self
    }

    pub fn weight_decay(mut self, weight_decay: TensorData) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn momentum(mut self, momentum: TensorData) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn trust_coefficient(mut self, trust_coefficient: TensorData) -> Self {
        self.trust_coefficient = trust_coefficient;
        self
    }

    pub fn dampening(mut self, dampening: TensorData) -> Self {
        self.dampening = dampening;
        self
    }

    pub fn nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }
}

impl HyperParams for LarsConfig {
    fn validate(&self) -> Result<(), OptimError> {
        validate_non_negative("lr", self.lr)?;
        validate_non_negative("weight_decay", self.weight_decay)?;
        validate_non_negative("momentum", self.momentum)?;
        validate_non_negative("trust_coefficient", self.trust_coefficient)?;
        if !(0.0 <= self.dampening && self.dampening <= 1.0) {
            return Err(OptimError::InvalidHyperparameter {
                name: "dampening",
                value: self.dampening as f64,
                requirement: "in [0, 1]",
            });
        }
        if self.nesterov && (self.momentum <= 0.0 || self.dampening != 0.0) {
            return Err(OptimError::InvalidHyperparameter {
                name: "nesterov",
                value: self.momentum as f64,
                requirement: "used with momentum > 0 and zero dampening",
            });
        }
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
pub struct LarsState {
    /// Momentum buffer, shaped like the parameter.
    #[serde(with = "array")]
    pub mu: ArrayD<TensorData>,
}

/// `trust_coefficient * param_norm / update_norm`, or `1` when either norm is zero.
pub fn trust_ratio(param_norm: TensorData, update_norm: TensorData, trust_coefficient: TensorData) -> TensorData {
    if param_norm > 0.0 && update_norm > 0.0 {
        trust_coefficient * param_norm / update_norm
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LarsRule;

impl UpdateRule for LarsRule {
    type Config = LarsConfig;
    type State = LarsState;

    fn name(&self) -> &'static str {
        "LARS"
    }

    fn init_state(&self, param: &Tensor, _config: &LarsConfig) -> Result<LarsState, OptimError> {
        Ok(LarsState {
            mu: ArrayD::zeros(IxDyn(param.shape())),
        })
    }

    fn update(
        &self,
        param: &mut ArrayD<TensorData>,
        grad: &ArrayD<TensorData>,
        state: &mut LarsState,
        config: &LarsConfig,
        _group_step: usize,
    ) -> Result<(), OptimError> {
        let mut d_p = grad.clone();
        if param.ndim() > 1 {
            d_p.scaled_add(config.weight_decay, &*param);
            let q = trust_ratio(ops::norm(param), ops::norm(&d_p), config.trust_coefficient);
            d_p.mapv_inplace(|g| g * q);
        }

        let momentum = config.momentum;
        let dampening = config.dampening;
        state
            .mu
            .zip_mut_with(&d_p, |m, &g| *m = momentum * *m + (1.0 - dampening) * g);

        if config.nesterov {
            d_p.scaled_add(momentum, &state.mu);
            param.scaled_add(-config.lr, &d_p);
        } else {
            param.scaled_add(-config.lr, &state.mu);
        }
        Ok(())
    }

    fn check_state(&self, param: &Tensor, state: &LarsState, _config: &LarsConfig) -> Result<(), OptimError> {
        ensure_shape("mu", param.shape(), state.mu.shape())
    }
}

/// LARS optimizer.
pub type Lars = GroupedOptimizer<LarsRule>;

impl GroupedOptimizer<LarsRule> {
    /// Creates a new LARS optimizer instance.
    ///
    /// # Arguments
    /// * `params`: An iterator over the parameters to optimize.
    /// * `config`: Hyperparameters, validated eagerly.
    pub fn new<I>(params: I, config: LarsConfig) -> Result<Self, OptimError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_rule(LarsRule, params, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::Optimizer;
    use ndarray::{arr1, arr2};

    #[test]
    fn trust_ratio_falls_back_to_one() {
        assert_eq!(trust_ratio(0.0, 3.0, 0.001), 1.0);
        assert_eq!(trust_ratio(3.0, 0.0, 0.001), 1.0);
        assert!((trust_ratio(10.0, 5.0, 0.001) - 0.002).abs() < 1e-9);
    }

    #[test]
    fn vectors_follow_plain_momentum() {
        let p = Tensor::new(arr1(&[1.0, 2.0]).into_dyn(), true);
        let cfg = LarsConfig::default().lr(0.1).momentum(0.5).weight_decay(0.3);
        let mut opt = Lars::new(vec![p.clone()], cfg).unwrap();

        p.set_dense_grad(arr1(&[1.0, -1.0]).into_dyn()).unwrap();
        opt.step(None).unwrap();
        // mu = g, p -= 0.1 * g
        assert!((p.data()[[0]] - 0.9).abs() < 1e-6);
        assert!((p.data()[[1]] - 2.1).abs() < 1e-6);

        opt.step(None).unwrap();
        // mu = 0.5 * g + g
        assert!((p.data()[[0]] - 0.75).abs() < 1e-6);
        assert!((opt.state_of(&p).unwrap().mu[[1]] + 1.5).abs() < 1e-6);
    }

    #[test]
    fn matrices_are_scaled_by_the_trust_ratio() {
        // ||p|| = 10, ||g|| = 5
        let p = Tensor::new(arr2(&[[6.0, 8.0], [0.0, 0.0]]).into_dyn(), true);
        let cfg = LarsConfig::default().lr(1.0).momentum(0.9);
        let mut opt = Lars::new(vec![p.clone()], cfg).unwrap();

        p.set_dense_grad(arr2(&[[3.0, 4.0], [0.0, 0.0]]).into_dyn()).unwrap();
        opt.step(None).unwrap();

        let mu = &opt.state_of(&p).unwrap().mu;
        assert!((mu[[0, 0]] - 0.006).abs() < 1e-7);
        assert!((mu[[0, 1]] - 0.008).abs() < 1e-7);
        assert!((p.data()[[0, 0]] - 5.994).abs() < 1e-5);
    }

    #[test]
    fn zero_matrix_uses_unit_trust_ratio() {
        let p = Tensor::new(ArrayD::zeros(IxDyn(&[2, 2])), true);
        let mut opt = Lars::new(vec![p.clone()], LarsConfig::default().lr(1.0)).unwrap();
        p.set_dense_grad(ArrayD::from_elem(IxDyn(&[2, 2]), 0.5)).unwrap();
        opt.step(None).unwrap();
        assert!(p.data().iter().all(|v| (*v + 0.5).abs() < 1e-6));
    }

    #[test]
    fn nesterov_looks_ahead() {
        let p = Tensor::new(arr1(&[0.0]).into_dyn(), true);
        let cfg = LarsConfig::default().lr(1.0).momentum(0.5).nesterov(true);
        let mut opt = Lars::new(vec![p.clone()], cfg).unwrap();
        p.set_dense_grad(arr1(&[1.0]).into_dyn()).unwrap();
        opt.step(None).unwrap();
        // mu = 1, step direction = 1 + 0.5 * 1
        assert!((p.data()[[0]] + 1.5).abs() < 1e-6);
    }

    #[test]
    fn construction_validates_config() {
        let p = Tensor::new(arr1(&[0.0]).into_dyn(), true);
        assert!(Lars::new(vec![p.clone()], LarsConfig::default().momentum(-0.1)).is_err());
        assert!(Lars::new(vec![p.clone()], LarsConfig::default().trust_coefficient(-1.0)).is_err());
        assert!(Lars::new(vec![p.clone()], LarsConfig::default().dampening(1.5)).is_err());
        assert!(Lars::new(vec![p.clone()], LarsConfig::default().momentum(0.0).nesterov(true)).is_err());
        assert!(Lars::new(vec![p.clone()], LarsConfig::default().dampening(0.1).nesterov(true)).is_err());
        assert!(Lars::new(vec![p], LarsConfig::default().nesterov(true)).is_ok());
    }
}
