//! # Per-Parameter State Store
//!
//! An arena of parameter slots. Each parameter gets a stable [`ParamHandle`]
//! when it is registered; the slot holds the optimizer's clone of the tensor
//! and its algorithm state. State is created lazily on the first step and
//! lives until the parameter is removed. Handles are never reused, so a
//! removed slot stays behind as an empty entry. Lookup by tensor goes through
//! a hash index on the storage address; the slot's clone keeps that address
//! alive while the parameter is registered.

use std::collections::HashMap;
use std::fmt;

use log::trace;

use super::OptimError;
use crate::tensor::Tensor;

/// Stable identity of a registered parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamHandle(usize);

impl ParamHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ParamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Two-phase lifecycle of a parameter's state.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamState<S> {
    Uninitialized,
    Active(S),
}

impl<S> ParamState<S> {
    pub fn is_active(&self) -> bool {
        matches!(self, ParamState::Active(_))
    }

    pub fn active(&self) -> Option<&S> {
        match self {
            ParamState::Active(state) => Some(state),
            ParamState::Uninitialized => None,
        }
    }

    /// Returns the active state, running `init` first when uninitialized.
    pub fn get_or_try_init<E>(&mut self, init: impl FnOnce() -> Result<S, E>) -> Result<&mut S, E> {
        if let ParamState::Uninitialized = self {
            *self = ParamState::Active(init()?);
        }
        match self {
            ParamState::Active(state) => Ok(state),
            ParamState::Uninitialized => unreachable!("state initialized above"),
        }
    }
}

#[derive(Debug)]
struct Slot<S> {
    param: Tensor,
    state: ParamState<S>,
}

/// Arena of parameter slots indexed by [`ParamHandle`].
#[derive(Debug)]
pub struct StateStore<S> {
    slots: Vec<Option<Slot<S>>>,
    index: HashMap<usize, ParamHandle>,
}

impl<S> Default for StateStore<S> {
    fn default() -> Self {
        StateStore {
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<S> StateStore<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter and returns its handle. State starts uninitialized.
    pub fn register(&mut self, param: Tensor) -> ParamHandle {
        let handle = ParamHandle(self.slots.len());
        self.index.insert(param.storage_key(), handle);
        self.slots.push(Some(Slot {
            param,
            state: ParamState::Uninitialized,
        }));
        handle
    }

    /// Finds the handle of a parameter by storage identity.
    pub fn find(&self, param: &Tensor) -> Option<ParamHandle> {
        self.index.get(&param.storage_key()).copied()
    }

    /// Number of live (registered and not removed) parameters.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, handle: ParamHandle) -> Result<&Slot<S>, OptimError> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(OptimError::UnknownParameter(handle))
    }

    fn slot_mut(&mut self, handle: ParamHandle) -> Result<&mut Slot<S>, OptimError> {
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(OptimError::UnknownParameter(handle))
    }

    pub fn param(&self, handle: ParamHandle) -> Result<&Tensor, OptimError> {
        Ok(&self.slot(handle)?.param)
    }

    pub fn state(&self, handle: ParamHandle) -> Result<&ParamState<S>, OptimError> {
        Ok(&self.slot(handle)?.state)
    }

    /// Returns the parameter's state, synthesizing it with `init` on first access.
    /// Later calls return the same state object.
    pub fn get_or_init<E>(
        &mut self,
        handle: ParamHandle,
        init: impl FnOnce(&Tensor) -> Result<S, E>,
    ) -> Result<&mut S, E>
    where
        E: From<OptimError>,
    {
        let slot = self.slot_mut(handle)?;
        if !slot.state.is_active() {
            trace!("initializing state for parameter {} with shape {:?}", handle, slot.param.shape());
        }
        slot.state.get_or_try_init(|| init(&slot.param))
    }

    /// Forcibly reinitializes the parameter's state with `init`.
    pub fn reset<E>(&mut self, handle: ParamHandle, init: impl FnOnce(&Tensor) -> Result<S, E>) -> Result<(), E>
    where
        E: From<OptimError>,
    {
        let slot = self.slot_mut(handle)?;
        slot.state = ParamState::Active(init(&slot.param)?);
        Ok(())
    }

    /// Replaces the parameter's state wholesale (used when restoring checkpoints).
    pub fn set_state(&mut self, handle: ParamHandle, state: ParamState<S>) -> Result<(), OptimError> {
        self.slot_mut(handle)?.state = state;
        Ok(())
    }

    /// Removes the parameter together with its state, returning the optimizer's handle to it.
    pub fn remove(&mut self, handle: ParamHandle) -> Option<Tensor> {
        let slot = self.slots.get_mut(handle.0).and_then(Option::take)?;
        self.index.remove(&slot.param.storage_key());
        Some(slot.param)
    }
}

/// Fails with `StateShapeMismatch` unless `got == expected`.
pub(crate) fn ensure_shape(buffer: &'static str, expected: &[usize], got: &[usize]) -> Result<(), OptimError> {
    if expected != got {
        return Err(OptimError::StateShapeMismatch {
            buffer,
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}
