//! # Gradient Utilities
//!
//! Helpers a training loop applies to gradients before calling
//! [`Optimizer::step`](crate::optim::Optimizer::step): overflow detection,
//! standardization, norms and global-norm clipping.

use log::debug;
use ndarray::{ArrayD, Axis, IxDyn};

use crate::tensor::{ops, Gradient, Tensor, TensorData, TensorError};

/// True when any element is NaN or infinite.
pub fn has_overflow(x: &ArrayD<TensorData>) -> bool {
    x.iter().any(|v| !v.is_finite())
}

/// Unbiased standard deviation of a slice of values.
fn unbiased_std<'a>(values: impl Iterator<Item = &'a TensorData> + Clone) -> TensorData {
    let n = values.clone().count();
    if n < 2 {
        return 0.0;
    }
    let mean = values.clone().sum::<TensorData>() / n as TensorData;
    let var = values.map(|v| (v - mean) * (v - mean)).sum::<TensorData>() / (n - 1) as TensorData;
    var.sqrt()
}

/// Divides `x` by its unbiased standard deviation (plus `eps`).
///
/// With `use_channels` and a rank ≥ 2 input every slice along the leading
/// axis is standardized on its own. Otherwise the whole tensor is, but only
/// when it has more than two elements; smaller tensors are returned unchanged.
pub fn normalize_gradient(x: &ArrayD<TensorData>, use_channels: bool, eps: TensorData) -> ArrayD<TensorData> {
    let mut out = x.clone();
    if use_channels && x.ndim() > 1 {
        for mut channel in out.outer_iter_mut() {
            let std = unbiased_std(channel.iter());
            channel.mapv_inplace(|v| v / (std + eps));
        }
    } else if x.len() > 2 {
        let std = unbiased_std(x.iter());
        out.mapv_inplace(|v| v / (std + eps));
    }
    out
}

/// L2 norm with dimensions kept for broadcasting.
///
/// * rank ≤ 1: norm of the whole tensor, returned as a single-element array.
/// * rank 2 or 3: norm along axis 1.
/// * rank ≥ 4: norm over every axis but the leading one.
pub fn unit_norm(x: &ArrayD<TensorData>) -> ArrayD<TensorData> {
    match x.ndim() {
        0 | 1 => ArrayD::from_elem(IxDyn(&[1]), ops::norm(x)),
        2 | 3 => x.map_axis(Axis(1), |lane| lane.iter().map(|v| v * v).sum::<TensorData>().sqrt())
            .insert_axis(Axis(1)),
        _ => ops::neuron_norm(x),
    }
}

/// Global L2 norm of the gradients of `params`, clipped to `max_norm`.
///
/// Returns the total norm before clipping. When `max_norm > 0` and the total
/// exceeds it, every gradient is scaled by `max_norm / total`. Parameters
/// without a gradient are ignored.
pub fn clip_grad_norm(params: &[Tensor], max_norm: TensorData) -> Result<TensorData, TensorError> {
    let mut total_sq: TensorData = 0.0;
    for param in params {
        if let Some(grad) = param.grad() {
            let norm = match &grad {
                Gradient::Dense(g) => ops::norm(g),
                Gradient::Sparse(_) => ops::norm(&grad.to_dense()?),
            };
            total_sq += norm * norm;
        }
    }
    let total = total_sq.sqrt();

    if max_norm > 0.0 {
        let coef = max_norm / (total + 1e-6);
        if coef < 1.0 {
            debug!("clipping gradient norm {} to {}", total, max_norm);
            for param in params {
                param.with_grad_mut(|slot| {
                    if let Some(grad) = slot.as_mut() {
                        grad.scale(coef);
                    }
                });
            }
        }
    }
    Ok(total)
}

/// Splits named parameters into those that should receive weight decay and
/// those that should not.
///
/// A parameter is exempt when its name contains any entry of `ban_list`
/// (e.g. `"bias"`, `"LayerNorm.weight"`). The two lists are meant to become
/// two parameter groups, the second with `weight_decay` set to zero.
pub fn split_weight_decay<I, S>(named_params: I, ban_list: &[&str]) -> (Vec<Tensor>, Vec<Tensor>)
where
    I: IntoIterator<Item = (S, Tensor)>,
    S: AsRef<str>,
{
    let mut decay = Vec::new();
    let mut no_decay = Vec::new();
    for (name, param) in named_params {
        if ban_list.iter().any(|banned| name.as_ref().contains(banned)) {
            no_decay.push(param);
        } else {
            decay.push(param);
        }
    }
    (decay, no_decay)
}
