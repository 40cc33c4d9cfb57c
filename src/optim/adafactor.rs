//! # AdaFactor Optimizer
//!
//! Adaptive learning rates with sublinear memory cost.
//! Reference: Adafactor: Adaptive Learning Rates with Sublinear Memory Cost - https://arxiv.org/abs/1804.04235
//!
//! For parameters of rank ≥ 2 the running average of squared gradients is
//! never stored in full. Only its mean over the last axis (`row`) and over the
//! second-to-last axis (`col`) are kept, and a rank-1 approximation of the
//! full average is rebuilt from them each step.

use log::trace;
use ndarray::{ArrayD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use super::engine::{GroupedOptimizer, UpdateRule};
use super::group::HyperParams;
use super::state::ensure_shape;
use super::{validate_beta, validate_non_negative, OptimError};
use crate::tensor::{ops, Tensor, TensorData};
use crate::utils::serialization::{array, option_array};

/// AdaFactor hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaFactorConfig {
    /// External learning rate, ignored when `relative_step` is set (default: 1e-3).
    pub lr: TensorData,
    /// First-moment coefficient; `None` disables the first moment (default: 0.9).
    pub beta1: Option<TensorData>,
    /// Exponent of the time-varying second-moment decay `1 - t^decay_rate` (default: -0.8).
    pub decay_rate: TensorData,
    pub weight_decay: TensorData,
    /// Decay the weights directly instead of folding the decay into the gradient (default: true).
    pub weight_decouple: bool,
    /// Decoupled decay ignores the learning rate (default: false).
    pub fixed_decay: bool,
    /// Threshold on the RMS of the normalized update (default: 1.0).
    pub clip_threshold: TensorData,
    /// Use the running maximum of the second-moment estimate (default: false).
    pub ams_bound: bool,
    /// Scale the step size by the parameter's RMS (default: true).
    pub scale_parameter: bool,
    /// Derive the step size from the step counter instead of `lr` (default: true).
    pub relative_step: bool,
    /// Linear warm-up of the relative step size (default: false).
    pub warmup_init: bool,
    /// Added to squared gradients (default: 1e-30).
    pub eps1: TensorData,
    /// Floor on the parameter RMS used by `scale_parameter` (default: 1e-3).
    pub eps2: TensorData,
}

impl Default for AdaFactorConfig {
    fn default() -> Self {
        AdaFactorConfig {
            lr: 1e-3,
            beta1: Some(0.9),
            decay_rate: -0.8,
            weight_decay: 0.0,
            weight_decouple: true,
            fixed_decay: false,
            clip_threshold: 1.0,
            ams_bound: false,
            scale_parameter: true,
            relative_step: true,
            warmup_init: false,
            eps1: 1e-30,
            eps2: 1e-3,
        }
    }
}

impl AdaFactorConfig {
    pub fn lr(mut self, lr: TensorData) -> Self {
        self.lr = lr;
        self
    }

    pub fn beta1(mut self, beta1: Option<TensorData>) -> Self {
        self.beta1 = beta1;
        self
    }

    pub fn decay_rate(mut self, decay_rate: TensorData) -> Self {
        self.decay_rate = decay_rate;
        self
    }

    pub fn weight_decay(mut self, weight_decay: TensorData, weight_decouple: bool, fixed_decay: bool) -> Self {
        self.weight_decay = weight_decay;
        self.weight_decouple = weight_decouple;
        self.fixed_decay = fixed_decay;
        self
    }

    pub fn clip_threshold(mut self, clip_threshold: TensorData) -> Self {
        self.clip_threshold = clip_threshold;
        self
    }

    pub fn ams_bound(mut self, ams_bound: bool) -> Self {
        self.ams_bound = ams_bound;
        self
    }

    pub fn scale_parameter(mut self, scale_parameter: bool) -> Self {
        self.scale_parameter = scale_parameter;
        self
    }

    pub fn relative_step(mut self, relative_step: bool, warmup_init: bool) -> Self {
        self.relative_step = relative_step;
        self.warmup_init = warmup_init;
        self
    }

    pub fn eps(mut self, eps1: TensorData, eps2: TensorData) -> Self {
        self.eps1 = eps1;
        self.eps2 = eps2;
        self
    }

    /// Second-moment decay for group step `step`: `1 - step^decay_rate`.
    pub fn beta2_at(&self, step: usize) -> TensorData {
        1.0 - (step as TensorData).powf(self.decay_rate)
    }

    /// Step size for group step `step` and a parameter with RMS `param_rms`.
    ///
    /// With `relative_step` the size is `min(floor, 1/sqrt(step))`, the floor
    /// being `1e-6 * step` under warm-up and `1e-2` otherwise. With
    /// `scale_parameter` it is further multiplied by `max(eps2, param_rms)`.
    pub fn step_size(&self, step: usize, param_rms: TensorData) -> TensorData {
        let step = step.max(1) as TensorData;
        let mut size = self.lr;
        if self.relative_step {
            let floor = if self.warmup_init { 1e-6 * step } else { 1e-2 };
            size = floor.min(1.0 / step.sqrt());
        }
        if self.scale_parameter {
            size *= self.eps2.max(param_rms);
        }
        size
    }
}

impl HyperParams for AdaFactorConfig {
    fn validate(&self) -> Result<(), OptimError> {
        validate_non_negative("lr", self.lr)?;
        if let Some(beta1) = self.beta1 {
            validate_beta("beta1", beta1)?;
        }
        if !(self.decay_rate <= 0.0) {
            return Err(OptimError::InvalidHyperparameter {
                name: "decay_rate",
                value: self.decay_rate as f64,
                requirement: "<= 0",
            });
        }
        validate_non_negative("weight_decay", self.weight_decay)?;
        if !(self.clip_threshold > 0.0) {
            return Err(OptimError::InvalidHyperparameter {
                name: "clip_threshold",
                value: self.clip_threshold as f64,
                requirement: "> 0",
            });
        }
        validate_non_negative("eps1", self.eps1)?;
        validate_non_negative("eps2", self.eps2)?;
        Ok(())
    }

    fn lr(&self) -> TensorData {
        self.lr
    }

    fn set_lr(&mut self, lr: TensorData) {
        self.lr = lr;
    }
}

/// Running average of squared gradients, full or factored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SecondMoment {
    /// Rank ≥ 2: `row` has the gradient's shape minus the last axis, `col`
    /// has it minus the second-to-last axis.
    Factored {
        #[serde(with = "array")]
        row: ArrayD<TensorData>,
        #[serde(with = "array")]
        col: ArrayD<TensorData>,
    },
    /// Rank ≤ 1: the average itself, shaped like the gradient.
    Dense {
        #[serde(with = "array")]
        exp_avg_sq: ArrayD<TensorData>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaFactorState {
    #[serde(with = "array")]
    pub exp_avg: ArrayD<TensorData>,
    pub second_moment: SecondMoment,
    /// Running maximum of the second-moment estimate (AMS bound only).
    #[serde(with = "option_array")]
    pub exp_avg_sq_hat: Option<ArrayD<TensorData>>,
    /// RMS of the parameter, refreshed at the start of every step.
    pub rms: TensorData,
}

/// Gradients of rank ≥ 2 use the factored second moment.
pub fn is_factored(shape: &[usize]) -> bool {
    shape.len() >= 2
}

fn row_shape(shape: &[usize]) -> Vec<usize> {
    shape[..shape.len() - 1].to_vec()
}

fn col_shape(shape: &[usize]) -> Vec<usize> {
    let n = shape.len();
    let mut col = shape[..n - 2].to_vec();
    col.push(shape[n - 1]);
    col
}

/// Rebuilds the full-shape second-moment estimate from its factors.
///
/// `row` is normalized by its own mean over its last axis and combined with
/// `col` as an outer product over the last two axes, so the result has shape
/// `row.shape() + [col.shape().last()]` and is rank-1 in those two axes.
/// Entries are never negative.
pub fn approximate_sq_grad(
    row: &ArrayD<TensorData>,
    col: &ArrayD<TensorData>,
) -> Result<ArrayD<TensorData>, OptimError> {
    if row.ndim() == 0 || col.ndim() == 0 || row.ndim() != col.ndim() {
        return Err(OptimError::StateShapeMismatch {
            buffer: "exp_avg_sq_col",
            expected: row.shape().to_vec(),
            got: col.shape().to_vec(),
        });
    }
    let last = row.ndim() - 1;

    let row_mean = ops::mean_axis(row, last)?.insert_axis(Axis(last));
    let mut row_factor = row.clone();
    ops::div_or_zero(&mut row_factor, &row_mean);
    let row_factor = row_factor.insert_axis(Axis(last + 1));
    let col_factor = col.view().insert_axis(Axis(last));

    let mut full_shape = row.shape().to_vec();
    full_shape.push(col.shape()[last]);
    let mut out = ArrayD::zeros(IxDyn(&full_shape));
    Zip::from(&mut out)
        .and_broadcast(&row_factor)
        .and_broadcast(&col_factor)
        .for_each(|o, &r, &c| *o = r * c);
    Ok(out)
}

/// Inverse square root of [`approximate_sq_grad`], with zero estimates mapped to 0.
pub fn approximate_inv_sqrt(
    row: &ArrayD<TensorData>,
    col: &ArrayD<TensorData>,
) -> Result<ArrayD<TensorData>, OptimError> {
    Ok(approximate_sq_grad(row, col)?.mapv(ops::rsqrt_or_zero))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdaFactorRule;

impl UpdateRule for AdaFactorRule {
    type Config = AdaFactorConfig;
    type State = AdaFactorState;

    fn name(&self) -> &'static str {
        "AdaFactor"
    }

    fn init_state(&self, param: &Tensor, config: &AdaFactorConfig) -> Result<AdaFactorState, OptimError> {
        let shape = param.shape();
        let second_moment = if is_factored(shape) {
            SecondMoment::Factored {
                row: ArrayD::zeros(IxDyn(&row_shape(shape))),
                col: ArrayD::zeros(IxDyn(&col_shape(shape))),
            }
        } else {
            SecondMoment::Dense {
                exp_avg_sq: ArrayD::zeros(IxDyn(shape)),
            }
        };
        Ok(AdaFactorState {
            exp_avg: ArrayD::zeros(IxDyn(shape)),
            second_moment,
            exp_avg_sq_hat: config.ams_bound.then(|| ArrayD::zeros(IxDyn(shape))),
            rms: 0.0,
        })
    }

    fn update(
        &self,
        param: &mut ArrayD<TensorData>,
        grad: &ArrayD<TensorData>,
        state: &mut AdaFactorState,
        config: &AdaFactorConfig,
        group_step: usize,
    ) -> Result<(), OptimError> {
        // nothing to factor or scale in an empty tensor
        if param.is_empty() {
            return Ok(());
        }
        let beta2_t = config.beta2_at(group_step);
        state.rms = ops::rms(param);
        let lr = config.step_size(group_step, state.rms);
        trace!("AdaFactor: step {} beta2_t {} lr {}", group_step, beta2_t, lr);

        let mut grad = grad.clone();
        if config.weight_decay > 0.0 && !config.weight_decouple {
            grad.scaled_add(config.weight_decay, &*param);
        }

        let grad_sq = grad.mapv(|g| g * g + config.eps1);

        let second_moment = match &mut state.second_moment {
            SecondMoment::Factored { row, col } => {
                let last = grad_sq.ndim() - 1;
                ops::ema_in_place(row, &ops::mean_axis(&grad_sq, last)?, beta2_t);
                ops::ema_in_place(col, &ops::mean_axis(&grad_sq, last - 1)?, beta2_t);
                approximate_sq_grad(row, col)?
            }
            SecondMoment::Dense { exp_avg_sq } => {
                ops::ema_in_place(exp_avg_sq, &grad_sq, beta2_t);
                exp_avg_sq.clone()
            }
        };

        let mut update = match state.exp_avg_sq_hat.as_mut() {
            Some(hat) => {
                ops::maximum_in_place(hat, &second_moment);
                hat.mapv(ops::rsqrt_or_zero)
            }
            None => second_moment.mapv(ops::rsqrt_or_zero),
        };
        update *= &grad;

        let clip = (ops::rms(&update) / config.clip_threshold).max(1.0);
        update.mapv_inplace(|u| u / clip * lr);

        match config.beta1 {
            Some(beta1) => ops::ema_in_place(&mut state.exp_avg, &update, beta1),
            None => state.exp_avg.assign(&update),
        }

        if config.weight_decay > 0.0 && config.weight_decouple {
            let decay = if config.fixed_decay { config.weight_decay } else { config.weight_decay * lr };
            param.mapv_inplace(|p| p * (1.0 - decay));
        }

        *param -= &state.exp_avg;
        Ok(())
    }

    fn check_state(&self, param: &Tensor, state: &AdaFactorState, config: &AdaFactorConfig) -> Result<(), OptimError> {
        let shape = param.shape();
        ensure_shape("exp_avg", shape, state.exp_avg.shape())?;
        match &state.second_moment {
            SecondMoment::Factored { row, col } if is_factored(shape) => {
                ensure_shape("exp_avg_sq_row", &row_shape(shape), row.shape())?;
                ensure_shape("exp_avg_sq_col", &col_shape(shape), col.shape())?;
            }
            SecondMoment::Dense { exp_avg_sq } if !is_factored(shape) => {
                ensure_shape("exp_avg_sq", shape, exp_avg_sq.shape())?;
            }
            SecondMoment::Factored { row, .. } => {
                return Err(OptimError::StateShapeMismatch {
                    buffer: "exp_avg_sq",
                    expected: shape.to_vec(),
                    got: row.shape().to_vec(),
                });
            }
            SecondMoment::Dense { exp_avg_sq } => {
                return Err(OptimError::StateShapeMismatch {
                    buffer: "exp_avg_sq_row",
                    expected: row_shape(shape),
                    got: exp_avg_sq.shape().to_vec(),
                });
            }
        }
        match (&state.exp_avg_sq_hat, config.ams_bound) {
            (Some(hat), true) => ensure_shape("exp_avg_sq_hat", shape, hat.shape()),
            (None, false) => Ok(()),
            (Some(hat), false) => Err(OptimError::StateShapeMismatch {
                buffer: "exp_avg_sq_hat",
                expected: Vec::new(),
                got: hat.shape().to_vec(),
            }),
            (None, true) => Err(OptimError::StateShapeMismatch {
                buffer: "exp_avg_sq_hat",
                expected: shape.to_vec(),
                got: Vec::new(),
            }),
        }
    }
}

/// AdaFactor optimizer.
pub type AdaFactor = GroupedOptimizer<AdaFactorRule>;

impl GroupedOptimizer<AdaFactorRule> {
    /// Creates a new AdaFactor optimizer instance.
    ///
    /// # Arguments
    /// * `params`: An iterator over the parameters to optimize.
    /// * `config`: Hyperparameters, validated eagerly.
    pub fn new<I>(params: I, config: AdaFactorConfig) -> Result<Self, OptimError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_rule(AdaFactorRule, params, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::Optimizer;
    use crate::tensor::{full, zeros};
    use ndarray::{arr1, arr2};

    #[test]
    fn factorization_depends_on_rank() {
        let opt_cfg = AdaFactorConfig::default();
        let matrix = zeros(&[3, 4], true);
        let cube = zeros(&[2, 3, 4], true);
        let vector = zeros(&[5], true);

        let s = AdaFactorRule.init_state(&matrix, &opt_cfg).unwrap();
        match &s.second_moment {
            SecondMoment::Factored { row, col } => {
                assert_eq!(row.shape(), &[3]);
                assert_eq!(col.shape(), &[4]);
            }
            other => panic!("expected factored state, got {:?}", other),
        }

        let s = AdaFactorRule.init_state(&cube, &opt_cfg).unwrap();
        match &s.second_moment {
            SecondMoment::Factored { row, col } => {
                assert_eq!(row.shape(), &[2, 3]);
                assert_eq!(col.shape(), &[2, 4]);
            }
            other => panic!("expected factored state, got {:?}", other),
        }

        let s = AdaFactorRule.init_state(&vector, &opt_cfg).unwrap();
        assert!(matches!(s.second_moment, SecondMoment::Dense { .. }));
        assert!(s.exp_avg_sq_hat.is_none());
    }

    #[test]
    fn reconstruction_is_full_shape_rank_one_and_non_negative() {
        let row = arr1(&[1.0, 4.0, 0.25]).into_dyn();
        let col = arr1(&[4.0, 1.0]).into_dyn();
        let inv = approximate_inv_sqrt(&row, &col).unwrap();

        assert_eq!(inv.shape(), &[3, 2]);
        assert!(inv.iter().all(|v| *v >= 0.0 && v.is_finite()));

        // every 2x2 minor of a rank-1 matrix vanishes
        for i in 0..3 {
            for j in 0..3 {
                let det = inv[[i, 0]] * inv[[j, 1]] - inv[[i, 1]] * inv[[j, 0]];
                assert!(det.abs() < 1e-5, "minor ({}, {}) = {}", i, j, det);
            }
        }

        // row mean is 1.75: inv[0][1] = rsqrt(1 / 1.75) * rsqrt(1)
        assert!((inv[[0, 1]] - 1.75f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn reconstruction_of_zero_factors_stays_finite() {
        let row = ArrayD::zeros(IxDyn(&[2]));
        let col = ArrayD::zeros(IxDyn(&[3]));
        let inv = approximate_inv_sqrt(&row, &col).unwrap();
        assert_eq!(inv.shape(), &[2, 3]);
        assert!(inv.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn relative_step_size_schedule() {
        let cfg = AdaFactorConfig::default().scale_parameter(false);
        assert_eq!(cfg.step_size(1, 0.0), 1e-2);
        assert!((cfg.step_size(1_000_000, 0.0) - 1e-3).abs() < 1e-9);

        let warm = cfg.clone().relative_step(true, true);
        assert!((warm.step_size(10, 0.0) - 1e-5).abs() < 1e-10);

        let fixed = AdaFactorConfig::default().relative_step(false, false).lr(0.5);
        assert_eq!(fixed.step_size(7, 0.0), 0.5 * 1e-3);
        assert_eq!(fixed.step_size(7, 2.0), 1.0);
    }

    #[test]
    fn beta2_schedule_starts_at_zero() {
        let cfg = AdaFactorConfig::default();
        assert_eq!(cfg.beta2_at(1), 0.0);
        assert!(cfg.beta2_at(2) > 0.0 && cfg.beta2_at(2) < cfg.beta2_at(10));
    }

    #[test]
    fn construction_validates_config() {
        let p = zeros(&[2, 2], true);
        assert!(AdaFactor::new(vec![p.clone()], AdaFactorConfig::default().lr(-1.0)).is_err());
        assert!(AdaFactor::new(vec![p.clone()], AdaFactorConfig::default().beta1(Some(1.0))).is_err());
        assert!(AdaFactor::new(vec![p.clone()], AdaFactorConfig::default().clip_threshold(0.0)).is_err());
        assert!(AdaFactor::new(vec![p.clone()], AdaFactorConfig::default().eps(-1.0, 1e-3)).is_err());
        assert!(AdaFactor::new(vec![p.clone()], AdaFactorConfig::default().decay_rate(0.5)).is_err());
        assert!(AdaFactor::new(vec![p], AdaFactorConfig::default()).is_ok());
    }

    #[test]
    fn ams_bound_keeps_running_maximum() {
        let p = full(&[3], 1.0, true);
        let mut opt = AdaFactor::new(vec![p.clone()], AdaFactorConfig::default().ams_bound(true)).unwrap();

        p.set_dense_grad(arr1(&[2.0, 2.0, 2.0]).into_dyn()).unwrap();
        opt.step(None).unwrap();
        let first = opt.state_of(&p).unwrap().exp_avg_sq_hat.clone().unwrap();

        p.set_dense_grad(arr1(&[0.1, 0.1, 0.1]).into_dyn()).unwrap();
        opt.step(None).unwrap();
        let second = opt.state_of(&p).unwrap().exp_avg_sq_hat.clone().unwrap();

        assert!((first[[0]] - 4.0).abs() < 1e-5);
        assert!(second.iter().zip(first.iter()).all(|(s, f)| s >= f));
    }

    #[test]
    fn decoupled_decay_without_first_moment() {
        let p = Tensor::new(arr2(&[[1.0, 1.0], [1.0, 1.0]]).into_dyn(), true);
        let cfg = AdaFactorConfig::default()
            .beta1(None)
            .relative_step(false, false)
            .scale_parameter(false)
            .lr(0.1)
            .weight_decay(0.5, true, true);
        let mut opt = AdaFactor::new(vec![p.clone()], cfg).unwrap();

        p.set_dense_grad(ArrayD::zeros(IxDyn(&[2, 2]))).unwrap();
        opt.step(None).unwrap();

        // zero gradient: only the fixed decoupled decay moves the weights
        assert!(p.data().iter().all(|v| (*v - 0.5).abs() < 1e-6));
        assert!(opt.state_of(&p).unwrap().exp_avg.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn state_check_rejects_wrong_shapes() {
        let p = zeros(&[2, 3], true);
        let cfg = AdaFactorConfig::default();
        let mut state = AdaFactorRule.init_state(&p, &cfg).unwrap();
        assert!(AdaFactorRule.check_state(&p, &state, &cfg).is_ok());

        state.second_moment = SecondMoment::Dense {
            exp_avg_sq: ArrayD::zeros(IxDyn(&[2, 3])),
        };
        assert!(AdaFactorRule.check_state(&p, &state, &cfg).is_err());

        let state = AdaFactorRule.init_state(&p, &cfg).unwrap();
        assert!(AdaFactorRule.check_state(&p, &state, &cfg.clone().ams_bound(true)).is_err());
    }

    #[test]
    fn empty_param_is_skipped() {
        let empty = zeros(&[0, 3], true);
        let p = full(&[2], 1.0, true);
        let mut opt = AdaFactor::new(
            vec![empty.clone(), p.clone()],
            AdaFactorConfig::default().scale_parameter(false),
        )
        .unwrap();

        empty.set_dense_grad(ArrayD::zeros(IxDyn(&[0, 3]))).unwrap();
        p.set_dense_grad(ArrayD::ones(IxDyn(&[2]))).unwrap();
        opt.step(None).unwrap();

        assert_eq!(empty.shape(), &[0, 3]);
        assert!(p.data().iter().all(|v| *v < 1.0));
    }

    #[test]
    fn update_rms_is_clipped_to_threshold() {
        let p = Tensor::new(ArrayD::zeros(IxDyn(&[1, 2])), true);
        let cfg = AdaFactorConfig::default()
            .lr(1.0)
            .beta1(None)
            .clip_threshold(0.5)
            .relative_step(false, false)
            .scale_parameter(false);
        let mut opt = AdaFactor::new(vec![p.clone()], cfg).unwrap();

        p.set_dense_grad(arr2(&[[1.0, 0.0]]).into_dyn()).unwrap();
        opt.step(None).unwrap();

        // unclipped update is [[1, 0]] with rms 1/sqrt(2), so it is divided by sqrt(2)
        let data = p.data();
        assert!((data[[0, 0]] + 0.70710677).abs() < 1e-5, "{}", data[[0, 0]]);
        assert_eq!(data[[0, 1]], 0.0);
    }

    #[test]
    fn coupled_decay_folds_into_gradient() {
        let p = full(&[2], 1.0, true);
        let cfg = AdaFactorConfig::default()
            .lr(1.0)
            .beta1(None)
            .weight_decay(0.5, false, false)
            .relative_step(false, false)
            .scale_parameter(false);
        let mut opt = AdaFactor::new(vec![p.clone()], cfg).unwrap();

        p.set_dense_grad(ArrayD::zeros(IxDyn(&[2]))).unwrap();
        opt.step(None).unwrap();

        // the decay term is the whole gradient, normalized to a unit update
        assert!(p.data().iter().all(|v| v.abs() < 1e-6), "{:?}", p.data());
    }
}
