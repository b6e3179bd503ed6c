//! Gradient penalty on samples interpolated between real and generated images.
//!
//! The critic is evaluated at `x̂ = x + α (x_gen − x)` and its summed score is
//! differentiated with respect to `x̂` with `create_graph`, so the penalty can
//! itself be differentiated by whichever network owns the path into it.

use tch::{Kind, Tensor};

use crate::error::TrainResult;

/// `real + alpha * (generated - real)`, with `alpha` broadcast per sample
pub fn interpolate(real: &Tensor, generated: &Tensor, alpha: &Tensor) -> Tensor {
    real + (generated - real) * alpha
}

/// Per-sample Euclidean norm over all non-batch elements.
///
/// `linalg_vector_norm` has a zero subgradient at the origin, so an all-zero
/// input gradient does not produce NaN parameter gradients.
pub fn per_sample_norm(gradient: &Tensor) -> Tensor {
    gradient
        .flatten(1, -1)
        .linalg_vector_norm(2.0, [1i64].as_slice(), false, Kind::Float)
}

/// `weight * mean((‖∇x̂ critic(x̂)‖ − 1)²)`.
///
/// `alpha` has shape `[B, 1, 1, 1]`. A critic whose score does not depend on
/// its input counts as having a zero input gradient.
pub fn gradient_penalty<F>(
    critic: F,
    real: &Tensor,
    generated: &Tensor,
    alpha: &Tensor,
    weight: f64,
) -> TrainResult<Tensor>
where
    F: Fn(&Tensor) -> Tensor,
{
    let interpolated = interpolate(real, generated, alpha);
    let interpolated = if interpolated.requires_grad() {
        interpolated
    } else {
        interpolated.set_requires_grad(true)
    };

    let scores = critic(&interpolated);
    let input_grad = if scores.requires_grad() {
        let total = scores.sum(Kind::Float);
        let mut grads = Tensor::f_run_backward(&[&total], &[&interpolated], true, true)?;
        match grads.pop() {
            Some(g) if g.defined() => g,
            _ => interpolated.zeros_like(),
        }
    } else {
        interpolated.zeros_like()
    };

    let slopes = per_sample_norm(&input_grad);
    Ok((slopes - 1.0).pow_tensor_scalar(2).mean(Kind::Float) * weight)
}
