//! Loss functions for the three networks

use tch::{Kind, Reduction, Tensor};

/// Mean sigmoid cross-entropy of `logits` against a constant label
pub fn sigmoid_cross_entropy(logits: &Tensor, label: f64) -> Tensor {
    let targets = logits.full_like(label);
    logits.binary_cross_entropy_with_logits::<Tensor>(&targets, None, None, Reduction::Mean)
}

/// Mean squared error
pub fn mse_loss(prediction: &Tensor, target: &Tensor) -> Tensor {
    (prediction - target).pow_tensor_scalar(2).mean(Kind::Float)
}

/// Generator adversarial term: fake scores should look real
pub fn generator_adversarial_loss(fake_scores: &Tensor) -> Tensor {
    sigmoid_cross_entropy(fake_scores, 1.0)
}

/// Reported generator loss: adversarial term plus gradient penalty
pub fn generator_loss(fake_scores: &Tensor, penalty: &Tensor) -> Tensor {
    generator_adversarial_loss(fake_scores) + penalty
}

/// Critic loss: real scores labelled 1, fake scores labelled 0
pub fn critic_loss(real_scores: &Tensor, fake_scores: &Tensor) -> Tensor {
    sigmoid_cross_entropy(real_scores, 1.0) + sigmoid_cross_entropy(fake_scores, 0.0)
}

/// Cycle loss: `lambda * mse(z, I(G(z))) + mse(x, G(I(x)))`
pub fn inverter_loss(
    noise: &Tensor,
    reconstructed_noise: &Tensor,
    images: &Tensor,
    reconstructed_images: &Tensor,
    divergence_lambda: f64,
) -> Tensor {
    mse_loss(noise, reconstructed_noise) * divergence_lambda + mse_loss(images, reconstructed_images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tch::Device;

    fn scalar(t: &Tensor) -> f64 {
        t.double_value(&[])
    }

    #[test]
    fn sigmoid_cross_entropy_at_zero_logit_is_ln2() {
        let logits = Tensor::zeros([4, 1], (Kind::Float, Device::Cpu));
        assert_relative_eq!(scalar(&sigmoid_cross_entropy(&logits, 1.0)), 2f64.ln(), epsilon = 1e-6);
        assert_relative_eq!(scalar(&sigmoid_cross_entropy(&logits, 0.0)), 2f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn sigmoid_cross_entropy_is_stable_for_large_logits() {
        let logits = Tensor::from_slice(&[1000.0f32, -1000.0]).view([2, 1]);
        let loss = scalar(&sigmoid_cross_entropy(&logits, 1.0));
        assert!(loss.is_finite());
        assert_relative_eq!(loss, 500.0, epsilon = 1e-3);
    }

    #[test]
    fn critic_loss_sums_both_terms() {
        let real = Tensor::zeros([2, 1], (Kind::Float, Device::Cpu));
        let fake = Tensor::zeros([2, 1], (Kind::Float, Device::Cpu));
        assert_relative_eq!(scalar(&critic_loss(&real, &fake)), 2.0 * 2f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn generator_loss_includes_penalty() {
        let fake = Tensor::zeros([2, 1], (Kind::Float, Device::Cpu));
        let penalty = Tensor::from(3.0f32);
        assert_relative_eq!(scalar(&generator_loss(&fake, &penalty)), 3.0 + 2f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn inverter_loss_is_zero_for_perfect_reconstruction() {
        let z = Tensor::randn([3, 8], (Kind::Float, Device::Cpu));
        let x = Tensor::rand([3, 4, 4, 3], (Kind::Float, Device::Cpu)) * 2.0 - 1.0;
        assert_eq!(scalar(&inverter_loss(&z, &z, &x, &x, 0.1)), 0.0);
    }

    #[test]
    fn inverter_loss_weights_latent_term() {
        let z = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));
        let z_rec = Tensor::ones([1, 2], (Kind::Float, Device::Cpu));
        let x = Tensor::zeros([1, 2, 2, 3], (Kind::Float, Device::Cpu));
        let x_rec = x.full_like(0.5);
        let loss = scalar(&inverter_loss(&z, &z_rec, &x, &x_rec, 0.1));
        assert_relative_eq!(loss, 0.1 * 1.0 + 0.25, epsilon = 1e-6);
    }
}
