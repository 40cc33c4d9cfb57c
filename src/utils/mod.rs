//! # Utility Functions (`utils`)
//!
//! Checkpointing of optimizer state and gradient helpers for training loops.

pub mod gradient;
pub mod serialization;

pub use gradient::{clip_grad_norm, has_overflow, normalize_gradient, split_weight_decay, unit_norm};
pub use serialization::{load_state, save_state, state_from_bytes, state_to_bytes, SerializationError};
