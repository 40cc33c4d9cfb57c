//! # Optimizer Checkpointing
//!
//! Functions for saving and loading optimizer state (group configuration,
//! group step counters and every parameter's state buffers).
//! Uses `serde` for serialization and `bincode` as the binary format.
//!
//! Parameters themselves are not stored. A checkpoint is restored into an
//! optimizer that manages the same parameters in the same group layout.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::optim::{GroupedOptimizer, HyperParams, OptimError, ParamState, UpdateRule};
use crate::tensor::TensorData;

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Checkpoint was written by {got}, cannot load it into {expected}")]
    OptimizerMismatch { expected: String, got: String },
    #[error("Checkpoint has {got} parameter groups, optimizer has {expected}")]
    GroupCountMismatch { expected: usize, got: usize },
    #[error("Parameter group {group}: checkpoint has {got} parameters, optimizer has {expected}")]
    ParamCountMismatch { group: usize, expected: usize, got: usize },
    #[error("Stored tensor with shape {shape:?} holds {len} values")]
    InvalidTensor { shape: Vec<usize>, len: usize },
    #[error("Invalid checkpoint contents: {0}")]
    Optim(#[from] OptimError),
}

// --- Serializable Tensor Wrapper ---
// ArrayD is stored as its shape plus a flat, row-major value list.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SerializableTensor {
    pub shape: Vec<usize>,
    pub data: Vec<TensorData>,
}

impl SerializableTensor {
    pub fn from_array(array: &ArrayD<TensorData>) -> Self {
        SerializableTensor {
            shape: array.shape().to_vec(),
            // `iter()` walks in logical order regardless of memory layout
            data: array.iter().cloned().collect(),
        }
    }

    pub fn into_array(self) -> Result<ArrayD<TensorData>, SerializationError> {
        let len = self.data.len();
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data).map_err(|_| SerializationError::InvalidTensor {
            shape: self.shape.clone(),
            len,
        })
    }
}

/// `#[serde(with = "array")]` for `ArrayD<TensorData>` fields.
pub(crate) mod array {
    use ndarray::ArrayD;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::SerializableTensor;
    use crate::tensor::TensorData;

    pub fn serialize<S: Serializer>(array: &ArrayD<TensorData>, serializer: S) -> Result<S::Ok, S::Error> {
        SerializableTensor::from_array(array).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ArrayD<TensorData>, D::Error> {
        SerializableTensor::deserialize(deserializer)?
            .into_array()
            .map_err(D::Error::custom)
    }
}

/// `#[serde(with = "option_array")]` for `Option<ArrayD<TensorData>>` fields.
pub(crate) mod option_array {
    use ndarray::ArrayD;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::SerializableTensor;
    use crate::tensor::TensorData;

    pub fn serialize<S: Serializer>(array: &Option<ArrayD<TensorData>>, serializer: S) -> Result<S::Ok, S::Error> {
        array.as_ref().map(SerializableTensor::from_array).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<ArrayD<TensorData>>, D::Error> {
        Option::<SerializableTensor>::deserialize(deserializer)?
            .map(SerializableTensor::into_array)
            .transpose()
            .map_err(D::Error::custom)
    }
}

// --- Checkpoint Layout ---
// A checkpoint is the optimizer name followed by one entry per group. The
// name is decoded on its own first, since the group layout depends on it.

#[derive(Serialize, Deserialize, Debug)]
struct GroupCheckpoint<C, S> {
    config: C,
    step: usize,
    // `None` marks a parameter whose state was never initialized.
    states: Vec<Option<S>>,
}

fn snapshot<R>(optimizer: &GroupedOptimizer<R>) -> Result<Vec<GroupCheckpoint<R::Config, R::State>>, SerializationError>
where
    R: UpdateRule,
{
    let mut groups = Vec::with_capacity(optimizer.param_groups().len());
    for group in optimizer.param_groups() {
        let states = group
            .params()
            .iter()
            .map(|&handle| Ok(optimizer.store().state(handle)?.active().cloned()))
            .collect::<Result<Vec<_>, OptimError>>()?;
        groups.push(GroupCheckpoint {
            config: group.config().clone(),
            step: group.step(),
            states,
        });
    }
    Ok(groups)
}

fn write_checkpoint<R, W>(optimizer: &GroupedOptimizer<R>, mut writer: W) -> Result<(), SerializationError>
where
    R: UpdateRule,
    R::Config: Serialize,
    R::State: Serialize,
    W: Write,
{
    let groups = snapshot(optimizer)?;
    bincode::serialize_into(&mut writer, optimizer.name())?;
    bincode::serialize_into(&mut writer, &groups)?;
    Ok(())
}

fn read_checkpoint<R, Rd>(optimizer: &mut GroupedOptimizer<R>, mut reader: Rd, strict: bool) -> Result<(), SerializationError>
where
    R: UpdateRule,
    R::Config: DeserializeOwned,
    R::State: DeserializeOwned,
    Rd: Read,
{
    let name: String = bincode::deserialize_from(&mut reader)?;
    if name != optimizer.name() {
        return Err(SerializationError::OptimizerMismatch {
            expected: optimizer.name().to_string(),
            got: name,
        });
    }
    let groups: Vec<GroupCheckpoint<R::Config, R::State>> = bincode::deserialize_from(&mut reader)?;
    restore(optimizer, groups, strict)
}

/// Validates the stored groups against the optimizer, then installs them.
///
/// Nothing is modified unless the whole checkpoint is accepted. With `strict`
/// set a state buffer of the wrong shape is an error; otherwise that
/// parameter's state is dropped back to uninitialized with a warning.
fn restore<R>(
    optimizer: &mut GroupedOptimizer<R>,
    stored_groups: Vec<GroupCheckpoint<R::Config, R::State>>,
    strict: bool,
) -> Result<(), SerializationError>
where
    R: UpdateRule,
{
    if stored_groups.len() != optimizer.param_groups().len() {
        return Err(SerializationError::GroupCountMismatch {
            expected: optimizer.param_groups().len(),
            got: stored_groups.len(),
        });
    }

    // --- Validation pass ---
    let mut accepted: Vec<Vec<bool>> = Vec::with_capacity(stored_groups.len());
    for (index, (stored, group)) in stored_groups.iter().zip(optimizer.param_groups()).enumerate() {
        if stored.states.len() != group.params().len() {
            return Err(SerializationError::ParamCountMismatch {
                group: index,
                expected: group.params().len(),
                got: stored.states.len(),
            });
        }
        stored.config.validate()?;

        let mut keep = Vec::with_capacity(stored.states.len());
        for (&handle, state) in group.params().iter().zip(&stored.states) {
            let Some(state) = state else {
                keep.push(true);
                continue;
            };
            let param = optimizer.store().param(handle)?;
            match optimizer.rule().check_state(param, state, &stored.config) {
                Ok(()) => keep.push(true),
                Err(err) if !strict => {
                    warn!("Dropping stored state for parameter {}: {}", handle, err);
                    keep.push(false);
                }
                Err(err) => return Err(err.into()),
            }
        }
        accepted.push(keep);
    }

    // --- Install pass ---
    let handles: Vec<Vec<_>> = optimizer.param_groups().iter().map(|g| g.params().to_vec()).collect();
    for (index, stored) in stored_groups.into_iter().enumerate() {
        {
            let group = &mut optimizer.groups_mut()[index];
            group.config = stored.config;
            group.step = stored.step;
        }
        for ((&handle, state), keep) in handles[index].iter().zip(stored.states).zip(&accepted[index]) {
            let state = match state {
                Some(state) if *keep => ParamState::Active(state),
                _ => ParamState::Uninitialized,
            };
            optimizer.store_mut().set_state(handle, state)?;
        }
    }
    debug!("{}: restored state for {} parameter groups", optimizer.name(), handles.len());
    Ok(())
}

// --- Byte-level API ---

/// Serializes the optimizer's groups and per-parameter state.
pub fn state_to_bytes<R>(optimizer: &GroupedOptimizer<R>) -> Result<Vec<u8>, SerializationError>
where
    R: UpdateRule,
    R::Config: Serialize,
    R::State: Serialize,
{
    let mut bytes = Vec::new();
    write_checkpoint(optimizer, &mut bytes)?;
    Ok(bytes)
}

/// Restores state produced by [`state_to_bytes`].
pub fn state_from_bytes<R>(optimizer: &mut GroupedOptimizer<R>, bytes: &[u8], strict: bool) -> Result<(), SerializationError>
where
    R: UpdateRule,
    R::Config: DeserializeOwned,
    R::State: DeserializeOwned,
{
    read_checkpoint(optimizer, bytes, strict)
}

// --- File API ---

/// Saves the optimizer state to a file.
///
/// # Arguments
/// * `optimizer`: The optimizer whose state should be saved.
/// * `path`: The file path where the checkpoint will be written.
pub fn save_state<R, P>(optimizer: &GroupedOptimizer<R>, path: P) -> Result<(), SerializationError>
where
    R: UpdateRule,
    R::Config: Serialize,
    R::State: Serialize,
    P: AsRef<Path>,
{
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_checkpoint(optimizer, &mut writer)?;
    writer.flush()?;
    debug!("{}: saved state to {}", optimizer.name(), path.as_ref().display());
    Ok(())
}

/// Loads optimizer state from a file written by [`save_state`].
///
/// # Arguments
/// * `optimizer`: The optimizer to restore. It must manage the same parameters,
///   grouped the same way, as the one that was saved.
/// * `path`: The file path from which to load the checkpoint.
/// * `strict`: If `true`, a state buffer whose shape does not match its parameter
///   is an error. If `false`, that parameter restarts from uninitialized state.
pub fn load_state<R, P>(optimizer: &mut GroupedOptimizer<R>, path: P, strict: bool) -> Result<(), SerializationError>
where
    R: UpdateRule,
    R::Config: DeserializeOwned,
    R::State: DeserializeOwned,
    P: AsRef<Path>,
{
    let file = File::open(path.as_ref())?;
    read_checkpoint(optimizer, BufReader::new(file), strict)
}
