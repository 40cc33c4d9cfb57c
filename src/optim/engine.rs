//! # Update Rule Engine
//!
//! [`GroupedOptimizer`] drives any [`UpdateRule`] over a set of parameter
//! groups: it runs the loss closure, advances group step counters, skips
//! frozen parameters, rejects sparse gradients, lazily initializes state and
//! hands each dense gradient to the rule together with a write guard on the
//! parameter's data.

use std::fmt::Debug;

use log::{debug, trace};
use ndarray::ArrayD;

use super::group::{HyperParams, ParamGroup};
use super::state::{ParamHandle, ParamState, StateStore};
use super::{validate_non_negative, Closure, OptimError, Optimizer};
use crate::tensor::{Gradient, Tensor, TensorData};

/// The algorithm-specific half of an optimizer.
pub trait UpdateRule {
    type Config: HyperParams;
    type State: Debug + Clone;

    /// Display name, used in logs, errors and checkpoints.
    fn name(&self) -> &'static str;

    /// Builds the state a parameter enters `Active` with. May mutate the
    /// parameter (e.g. to project it onto a constraint manifold).
    fn init_state(&self, param: &Tensor, config: &Self::Config) -> Result<Self::State, OptimError>;

    /// Applies one update to `param` in place using a dense `grad`.
    ///
    /// `group_step` is the owning group's step counter, already incremented
    /// for the current call (so it is at least 1).
    fn update(
        &self,
        param: &mut ArrayD<TensorData>,
        grad: &ArrayD<TensorData>,
        state: &mut Self::State,
        config: &Self::Config,
        group_step: usize,
    ) -> Result<(), OptimError>;

    /// Checks that every buffer in `state` has the shape `param` implies.
    fn check_state(&self, param: &Tensor, state: &Self::State, config: &Self::Config) -> Result<(), OptimError>;
}

/// Parameter groups + state store + update rule.
#[derive(Debug)]
pub struct GroupedOptimizer<R: UpdateRule> {
    rule: R,
    defaults: R::Config,
    groups: Vec<ParamGroup<R::Config>>,
    store: StateStore<R::State>,
}

impl<R: UpdateRule> GroupedOptimizer<R> {
    /// Creates an optimizer with a single parameter group using `defaults`.
    ///
    /// # Arguments
    /// * `rule`: The update rule to drive.
    /// * `params`: The parameters to optimize.
    /// * `defaults`: Hyperparameters of the first group and of groups added
    ///   later without an explicit configuration.
    pub fn with_rule<I>(rule: R, params: I, defaults: R::Config) -> Result<Self, OptimError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        defaults.validate()?;
        let mut optimizer = GroupedOptimizer {
            rule,
            defaults: defaults.clone(),
            groups: Vec::new(),
            store: StateStore::new(),
        };
        optimizer.add_param_group(params, Some(defaults))?;
        Ok(optimizer)
    }

    /// Adds a parameter group. `config` falls back to the optimizer defaults.
    /// Returns the index of the new group.
    pub fn add_param_group<I>(&mut self, params: I, config: Option<R::Config>) -> Result<usize, OptimError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        let config = config.unwrap_or_else(|| self.defaults.clone());
        config.validate()?;

        let params: Vec<Tensor> = params.into_iter().collect();
        for (position, param) in params.iter().enumerate() {
            if let Some(handle) = self.store.find(param) {
                return Err(OptimError::AlreadyManaged(handle));
            }
            if params[..position].iter().any(|p| p.same_storage(param)) {
                return Err(OptimError::DuplicateInGroup { position });
            }
        }

        let handles = params.into_iter().map(|p| self.store.register(p)).collect();
        self.groups.push(ParamGroup::new(handles, config)?);
        debug!("{}: added parameter group {}", self.rule.name(), self.groups.len() - 1);
        Ok(self.groups.len() - 1)
    }

    /// Stops optimizing `param` and drops its state immediately.
    /// Returns false when the parameter was not managed by this optimizer.
    pub fn remove_param(&mut self, param: &Tensor) -> bool {
        let Some(handle) = self.store.find(param) else {
            return false;
        };
        for group in &mut self.groups {
            group.params.retain(|h| *h != handle);
        }
        self.store.remove(handle);
        debug!("{}: removed parameter {}", self.rule.name(), handle);
        true
    }

    /// Reinitializes the state of a single parameter, leaving the group step
    /// counters and every other parameter untouched.
    /// Returns false when the parameter was not managed by this optimizer.
    pub fn reset_param(&mut self, param: &Tensor) -> Result<bool, OptimError> {
        let Some(handle) = self.store.find(param) else {
            return Ok(false);
        };
        let rule = &self.rule;
        let group = self
            .groups
            .iter()
            .find(|g| g.params.contains(&handle))
            .ok_or(OptimError::UnknownParameter(handle))?;
        let config = &group.config;
        self.store.reset(handle, |p| rule.init_state(p, config))?;
        debug!("{}: reset parameter {}", rule.name(), handle);
        Ok(true)
    }

    pub fn name(&self) -> &'static str {
        self.rule.name()
    }

    pub fn rule(&self) -> &R {
        &self.rule
    }

    pub fn defaults(&self) -> &R::Config {
        &self.defaults
    }

    pub fn param_groups(&self) -> &[ParamGroup<R::Config>] {
        &self.groups
    }

    /// Learning rate of group `group`.
    pub fn group_learning_rate(&self, group: usize) -> Result<TensorData, OptimError> {
        self.groups
            .get(group)
            .map(|g| g.config.lr())
            .ok_or(OptimError::UnknownGroup(group))
    }

    /// The handle assigned to `param`, if it is managed by this optimizer.
    pub fn handle_of(&self, param: &Tensor) -> Option<ParamHandle> {
        self.store.find(param)
    }

    /// Active state of `param`; `None` before its first step or if unmanaged.
    pub fn state_of(&self, param: &Tensor) -> Option<&R::State> {
        let handle = self.store.find(param)?;
        self.store.state(handle).ok().and_then(ParamState::active)
    }

    pub(crate) fn groups_mut(&mut self) -> &mut [ParamGroup<R::Config>] {
        &mut self.groups
    }

    pub(crate) fn store(&self) -> &StateStore<R::State> {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut StateStore<R::State> {
        &mut self.store
    }
}

impl<R: UpdateRule> Optimizer for GroupedOptimizer<R> {
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<TensorData>, OptimError> {
        let loss = match closure {
            Some(f) => Some(f()?),
            None => None,
        };

        let rule = &self.rule;
        for (index, group) in self.groups.iter_mut().enumerate() {
            group.step += 1;
            trace!("{}: group {} step {}", rule.name(), index, group.step);

            for &handle in &group.params {
                let param = self.store.param(handle)?.clone();
                if !param.requires_grad() {
                    continue;
                }
                let grad = match param.grad() {
                    Some(Gradient::Dense(grad)) => grad,
                    Some(Gradient::Sparse(_)) => {
                        return Err(OptimError::SparseGradient { optimizer: rule.name() });
                    }
                    None => continue,
                };

                let config = &group.config;
                let state = self.store.get_or_init(handle, |p| rule.init_state(p, config))?;
                let mut data = param.data_mut();
                rule.update(&mut data, &grad, state, config, group.step)?;
            }
        }
        Ok(loss)
    }

    fn zero_grad(&mut self) {
        for group in &self.groups {
            for &handle in &group.params {
                if let Ok(param) = self.store.param(handle) {
                    param.zero_grad();
                }
            }
        }
    }

    fn reset(&mut self) -> Result<(), OptimError> {
        let rule = &self.rule;
        for group in &mut self.groups {
            group.step = 0;
            let config = &group.config;
            for &handle in &group.params {
                self.store.reset(handle, |p| rule.init_state(p, config))?;
            }
        }
        debug!("{}: state reset", rule.name());
        Ok(())
    }

    fn learning_rate(&self) -> TensorData {
        self.groups
            .first()
            .map(|g| g.config.lr())
            .unwrap_or_else(|| self.defaults.lr())
    }

    fn set_learning_rate(&mut self, lr: TensorData) -> Result<(), OptimError> {
        validate_non_negative("lr", lr)?;
        self.defaults.set_lr(lr);
        for group in &mut self.groups {
            group.config.set_lr(lr);
        }
        Ok(())
    }
}
