//! # Tensor Operations
//!
//! The reductions and elementwise helpers the update rules are built from.
//! Everything here works on raw `ArrayD` buffers: optimizer arithmetic is
//! never tracked by autograd, so there is no graph bookkeeping.

use ndarray::{ArrayD, Axis, IxDyn, Zip};

use super::{TensorData, TensorError};

// --- Scalar helpers ---

/// `1 / sqrt(x)` for strictly positive `x`, `0` otherwise.
///
/// A zero second-moment estimate only arises when the matching gradient
/// entries are zero as well, so a zero factor reproduces the intended
/// "no movement" result without producing `inf * 0 = NaN`.
pub fn rsqrt_or_zero(x: TensorData) -> TensorData {
    if x > 0.0 {
        1.0 / x.sqrt()
    } else {
        0.0
    }
}

// --- Reductions ---

/// L2 norm over every element.
pub fn norm(a: &ArrayD<TensorData>) -> TensorData {
    a.iter().map(|v| v * v).sum::<TensorData>().sqrt()
}

/// Root-mean-square over every element (`norm / sqrt(numel)`), `0` for empty arrays.
pub fn rms(a: &ArrayD<TensorData>) -> TensorData {
    if a.is_empty() {
        return 0.0;
    }
    norm(a) / (a.len() as TensorData).sqrt()
}

/// Mean along `axis`, dropping that axis.
pub fn mean_axis(a: &ArrayD<TensorData>, axis: usize) -> Result<ArrayD<TensorData>, TensorError> {
    if axis >= a.ndim() {
        return Err(TensorError::Generic(format!(
            "Cannot reduce axis {} of a rank-{} tensor",
            axis,
            a.ndim()
        )));
    }
    a.mean_axis(Axis(axis)).ok_or_else(|| {
        TensorError::Generic(format!("Cannot take the mean over empty axis {} of shape {:?}", axis, a.shape()))
    })
}

/// Shape `[n, 1, 1, ...]` used to broadcast one value per leading-axis slice.
fn neuron_view_shape(shape: &[usize]) -> Vec<usize> {
    let mut view = vec![1; shape.len()];
    view[0] = shape[0];
    view
}

/// Per-neuron L2 norm.
///
/// A "neuron" is one slice along the leading axis. The result keeps the rank
/// of the input with every trailing axis collapsed to 1, so it broadcasts
/// back against the input. Rank ≤ 1 tensors have one scalar per neuron and
/// the result is simply `|x|`.
pub fn neuron_norm(x: &ArrayD<TensorData>) -> ArrayD<TensorData> {
    if x.ndim() <= 1 {
        return x.mapv(TensorData::abs);
    }
    let norms: Vec<TensorData> = x
        .outer_iter()
        .map(|neuron| neuron.iter().map(|v| v * v).sum::<TensorData>().sqrt())
        .collect();
    ArrayD::from_shape_fn(IxDyn(&neuron_view_shape(x.shape())), |idx| norms[idx[0]])
}

/// Per-neuron mean, shaped like `neuron_norm`. Undefined for rank ≤ 1 tensors.
pub fn neuron_mean(x: &ArrayD<TensorData>) -> Result<ArrayD<TensorData>, TensorError> {
    if x.ndim() <= 1 {
        return Err(TensorError::Generic("neuron_mean is not defined on rank <= 1 tensors".to_string()));
    }
    let means: Vec<TensorData> = x
        .outer_iter()
        .map(|neuron| {
            let n = neuron.len().max(1) as TensorData;
            neuron.iter().sum::<TensorData>() / n
        })
        .collect();
    Ok(ArrayD::from_shape_fn(IxDyn(&neuron_view_shape(x.shape())), |idx| means[idx[0]]))
}

// --- Elementwise, in place ---

/// `x /= denom` with `denom` broadcast against `x`; entries whose denominator
/// is not strictly positive become 0.
pub fn div_or_zero(x: &mut ArrayD<TensorData>, denom: &ArrayD<TensorData>) {
    Zip::from(x).and_broadcast(denom).for_each(|v, &d| {
        *v = if d > 0.0 { *v / d } else { 0.0 };
    });
}

/// `acc = max(acc, x)` elementwise.
pub fn maximum_in_place(acc: &mut ArrayD<TensorData>, x: &ArrayD<TensorData>) {
    Zip::from(acc).and(x).for_each(|a, &b| {
        if b > *a {
            *a = b;
        }
    });
}

/// `acc = decay * acc + (1 - decay) * x`, the exponential moving average step.
pub fn ema_in_place(acc: &mut ArrayD<TensorData>, x: &ArrayD<TensorData>, decay: TensorData) {
    Zip::from(acc).and(x).for_each(|a, &b| {
        *a = decay * *a + (1.0 - decay) * b;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array3};

    #[test]
    fn norm_and_rms() {
        let a = arr2(&[[3.0, 4.0], [0.0, 0.0]]).into_dyn();
        assert_eq!(norm(&a), 5.0);
        assert_eq!(rms(&a), 2.5);
        assert_eq!(rms(&ArrayD::zeros(IxDyn(&[0]))), 0.0);
    }

    #[test]
    fn neuron_norm_keeps_rank() {
        let a = Array3::from_shape_fn((2, 2, 2), |(n, _, _)| if n == 0 { 1.0 } else { 2.0 }).into_dyn();
        let norms = neuron_norm(&a);
        assert_eq!(norms.shape(), &[2, 1, 1]);
        assert_eq!(norms[[0, 0, 0]], 2.0);
        assert_eq!(norms[[1, 0, 0]], 4.0);

        let v = arr1(&[-3.0, 2.0]).into_dyn();
        assert_eq!(neuron_norm(&v), arr1(&[3.0, 2.0]).into_dyn());
    }

    #[test]
    fn neuron_mean_rejects_vectors() {
        let v = arr1(&[1.0, 2.0]).into_dyn();
        assert!(neuron_mean(&v).is_err());

        let m = arr2(&[[1.0, 3.0], [-2.0, 2.0]]).into_dyn();
        let means = neuron_mean(&m).unwrap();
        assert_eq!(means, arr2(&[[2.0], [0.0]]).into_dyn());
    }

    #[test]
    fn div_or_zero_masks_zero_denominators() {
        let mut x = arr2(&[[2.0, 4.0], [5.0, 6.0]]).into_dyn();
        let denom = arr2(&[[2.0], [0.0]]).into_dyn();
        div_or_zero(&mut x, &denom);
        assert_eq!(x, arr2(&[[1.0, 2.0], [0.0, 0.0]]).into_dyn());
        assert!(x.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn mean_axis_checks_bounds() {
        let a = arr2(&[[1.0, 3.0], [5.0, 7.0]]).into_dyn();
        assert_eq!(mean_axis(&a, 1).unwrap(), arr1(&[2.0, 6.0]).into_dyn());
        assert_eq!(mean_axis(&a, 0).unwrap(), arr1(&[3.0, 5.0]).into_dyn());
        assert!(mean_axis(&a, 2).is_err());
    }

    #[test]
    fn rsqrt_or_zero_never_returns_inf() {
        assert_eq!(rsqrt_or_zero(4.0), 0.5);
        assert_eq!(rsqrt_or_zero(0.0), 0.0);
        assert_eq!(rsqrt_or_zero(-1.0), 0.0);
    }
}
