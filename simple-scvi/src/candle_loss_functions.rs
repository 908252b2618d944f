use candle_core::{Result, Tensor};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Element-wise KL divergence between two Gaussians
///
/// KL(q || p) = 0.5 * [ log(vp/vq) + (vq + (mq - mp)^2) / vp - 1 ]
///
/// Shapes are broadcast against each other.
///
/// * `q_mean`, `q_var` - mean and variance of q
/// * `p_mean`, `p_var` - mean and variance of p
///
pub fn gaussian_kl_elementwise(
    q_mean: &Tensor,
    q_var: &Tensor,
    p_mean: &Tensor,
    p_var: &Tensor,
) -> Result<Tensor> {
    let log_ratio = p_var.log()?.broadcast_sub(&q_var.log()?)?;
    let sq_diff = q_mean.broadcast_sub(p_mean)?.sqr()?;
    let quad = q_var.broadcast_add(&sq_diff)?.broadcast_div(p_var)?;
    (log_ratio.broadcast_add(&quad)? - 1.)? * 0.5
}

/// Element-wise Gaussian log-density
///
/// log N(x; m, v) = -0.5 * [ log(2 pi) + log(v) + (x - m)^2 / v ]
///
pub fn gaussian_log_density(x: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let quad = x.broadcast_sub(mean)?.sqr()?.broadcast_div(var)?;
    (quad.broadcast_add(&var.log()?)? + LN_2PI)? * (-0.5)
}

/// Numerically stable log(1 + exp(x))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()?.add(&tail)
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
///
/// Valid for `x >= 1e-6`. Smaller inputs are clamped to `1e-6`, so
/// `lgamma` saturates near 13.8 instead of growing like `-log(x)`.
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6f32, f32::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let log_xp3 = xp3.log()?;

    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * &log_xp3)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// Element-wise log-likelihood of zero-inflated negative binomial
///
/// With π = zero-inflation logit, μ = mean, θ = inverse dispersion:
///
/// ```text
/// x = 0 : log[ σ(π) + σ(-π) (θ/(θ+μ))^θ ]
/// x > 0 : log σ(-π) + θ log(θ/(θ+μ)) + x log(μ/(θ+μ))
///         + lgamma(x+θ) - lgamma(θ) - lgamma(x+1)
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean (same shape as `x_nd`)
/// * `theta` - inverse dispersion, broadcast to `mu_nd`
/// * `pi_nd` - zero-inflation logits (same shape as `mu_nd`)
///
pub fn zinb_log_likelihood(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta: &Tensor,
    pi_nd: &Tensor,
) -> Result<Tensor> {
    let eps = 1e-8;
    let shape = mu_nd.dims();
    let x_nd = x_nd.broadcast_as(shape)?;
    let theta_nd = theta.broadcast_as(shape)?;

    let softplus_neg_pi = softplus(&pi_nd.neg()?)?;
    let log_theta_eps = (&theta_nd + eps)?.log()?;
    let log_theta_mu_eps = ((&theta_nd + mu_nd)? + eps)?.log()?;
    let pi_theta_log = (pi_nd.neg()? + (&theta_nd * (&log_theta_eps - &log_theta_mu_eps)?)?)?;

    let case_zero = (softplus(&pi_theta_log)? - &softplus_neg_pi)?;

    let x_log_mu = (&x_nd * ((mu_nd + eps)?.log()? - &log_theta_mu_eps)?)?;
    let lgamma_terms = ((lgamma_approx(&(&x_nd + &theta_nd)?)? - lgamma_approx(&theta_nd)?)?
        - lgamma_approx(&(&x_nd + 1.0)?)?)?;
    let case_non_zero =
        (((pi_theta_log - softplus_neg_pi)? + x_log_mu)? + lgamma_terms)?;

    x_nd.lt(eps)?.where_cond(&case_zero, &case_non_zero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn kl_matches_standard_normal_form() -> Result<()> {
        let dev = Device::Cpu;
        let means = [0.5f32, -1.0, 0.0];
        let lnvars = [0.2f32, -0.3, 0.0];
        let m = Tensor::new(&[means], &dev)?;
        let lnv = Tensor::new(&[lnvars], &dev)?;

        let kl = gaussian_kl_elementwise(
            &m,
            &lnv.exp()?,
            &Tensor::zeros_like(&m)?,
            &Tensor::ones_like(&m)?,
        )?
        .sum(1)?
        .to_vec1::<f32>()?;

        // 0.5 * sum(exp(lnv) - 1 + m^2 - lnv)
        let expected: f32 = means
            .iter()
            .zip(lnvars.iter())
            .map(|(mu, lv)| 0.5 * (lv.exp() - 1. + mu * mu - lv))
            .sum();
        assert!((kl[0] - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn kl_of_identical_gaussians_is_zero() -> Result<()> {
        let dev = Device::Cpu;
        let m = Tensor::new(&[1.5f32, -2.0], &dev)?;
        let v = Tensor::new(&[0.3f32, 2.0], &dev)?;
        let kl = gaussian_kl_elementwise(&m, &v, &m, &v)?;
        for k in kl.to_vec1::<f32>()? {
            assert!(k.abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn log_density_at_mean() -> Result<()> {
        let dev = Device::Cpu;
        let m = Tensor::new(&[0.0f32, 3.0], &dev)?;
        let v = Tensor::new(&[1.0f32, 4.0], &dev)?;
        let lp = gaussian_log_density(&m, &m, &v)?.to_vec1::<f32>()?;
        let expected0 = -0.5 * LN_2PI as f32;
        let expected1 = -0.5 * (LN_2PI as f32 + 4f32.ln());
        assert!((lp[0] - expected0).abs() < 1e-5);
        assert!((lp[1] - expected1).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn softplus_is_stable() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-100f32, 0.0, 100.0], &dev)?;
        let y = softplus(&x)?.to_vec1::<f32>()?;
        assert!(y[0] >= 0.0 && y[0] < 1e-6);
        assert!((y[1] - 2f32.ln()).abs() < 1e-6);
        assert!((y[2] - 100.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn zinb_zero_mass_increases_with_dropout() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0f32, 0.0]], &dev)?;
        let mu = Tensor::new(&[[5f32, 5.0]], &dev)?;
        let theta = Tensor::new(&[2f32, 2.0], &dev)?;
        let pi = Tensor::new(&[[-3f32, 3.0]], &dev)?;
        let llik = zinb_log_likelihood(&x, &mu, &theta, &pi)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(llik[0] < llik[1]);
        assert!(llik.iter().all(|v| *v <= 0.0));
        Ok(())
    }
}
