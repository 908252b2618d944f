use approx::assert_abs_diff_eq;
use candle_core::{Device, Tensor};
use simple_scvi::candle_distributions::{Normal, ZeroInflatedNegBinom};
use simple_scvi::candle_loss_functions::lgamma_approx;
use special::Gamma as SpecialGamma;

fn sigmoid(x: f64) -> f64 {
    1. / (1. + (-x).exp())
}

/// reference ZINB log-pmf on the host
fn zinb_log_pmf(x: f64, mu: f64, theta: f64, pi: f64) -> f64 {
    let nb = SpecialGamma::ln_gamma(x + theta).0 - SpecialGamma::ln_gamma(theta).0
        - SpecialGamma::ln_gamma(x + 1.).0
        + theta * (theta / (theta + mu)).ln()
        + x * (mu / (theta + mu)).ln();
    let p_zero = sigmoid(pi);
    if x == 0. {
        (p_zero + (1. - p_zero) * nb.exp()).ln()
    } else {
        (1. - p_zero).ln() + nb
    }
}

#[test]
fn lgamma_approx_tracks_special() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let xs = [0.3f32, 0.8, 1.0, 2.0, 4.5, 10.0, 37.0, 120.0];
    let approx = lgamma_approx(&Tensor::new(&xs, &dev)?)?.to_vec1::<f32>()?;

    for (x, a) in xs.iter().zip(approx.iter()) {
        let exact = SpecialGamma::ln_gamma(*x as f64).0 as f32;
        assert_abs_diff_eq!(*a, exact, epsilon = 1e-2 * exact.abs().max(1.0));
    }
    Ok(())
}

#[test]
fn zinb_log_prob_matches_reference() -> anyhow::Result<()> {
    let dev = Device::Cpu;

    let x = [0f32, 0., 1., 3., 7., 20.];
    let mu = [0.5f32, 4.0, 2.0, 3.0, 10.0, 15.0];
    let theta = [2.0f32, 0.7, 1.5, 5.0, 0.9, 3.0];
    let pi = [-1.0f32, 1.5, -3.0, 0.0, -0.5, -8.0];

    let dist = ZeroInflatedNegBinom::new(
        &Tensor::new(&[mu], &dev)?,
        &Tensor::new(&theta, &dev)?,
        &Tensor::new(&[pi], &dev)?,
    )?;
    let llik = dist
        .log_prob(&Tensor::new(&[x], &dev)?)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    for j in 0..x.len() {
        let expected = zinb_log_pmf(x[j] as f64, mu[j] as f64, theta[j] as f64, pi[j] as f64);
        assert_abs_diff_eq!(llik[j] as f64, expected, epsilon = 2e-2);
    }
    Ok(())
}

#[test]
fn zinb_sample_mean_is_close() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let n = 4000;
    let mu = Tensor::full(6f32, (n, 1), &dev)?;
    let theta = Tensor::new(&[3f32], &dev)?;
    let pi = Tensor::full(-1f32, (n, 1), &dev)?;
    let dist = ZeroInflatedNegBinom::new(&mu, &theta, &pi)?;

    let draws = dist.sample()?;
    let empirical = draws.mean_all()?.to_scalar::<f32>()?;
    let expected = dist.mean()?.mean_all()?.to_scalar::<f32>()?;

    // sd of a single draw is about 4.5, so the mean of 4000 is within ~0.07
    assert_abs_diff_eq!(empirical, expected, epsilon = 0.4);
    Ok(())
}

#[test]
fn normal_log_prob_and_kl() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let q = Normal::new(
        &Tensor::new(&[[1.0f32, -0.5]], &dev)?,
        &Tensor::new(&[[0.25f32, 4.0]], &dev)?,
    )?;
    let p = Normal::standard_like(q.mean())?;

    // KL(N(m, v) || N(0, 1)) = 0.5 * (v + m^2 - 1 - ln v)
    let kl = q.kl_divergence(&p)?.flatten_all()?.to_vec1::<f32>()?;
    let expected = [
        0.5 * (0.25 + 1.0 - 1.0 - 0.25f32.ln()),
        0.5 * (4.0 + 0.25 - 1.0 - 4f32.ln()),
    ];
    for (a, b) in kl.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }

    let lp = q.log_prob(q.mean())?.flatten_all()?.to_vec1::<f32>()?;
    let ln_2pi = (2. * std::f32::consts::PI).ln();
    assert_abs_diff_eq!(lp[0], -0.5 * (ln_2pi + 0.25f32.ln()), epsilon = 1e-5);
    assert_abs_diff_eq!(lp[1], -0.5 * (ln_2pi + 4f32.ln()), epsilon = 1e-5);
    Ok(())
}

#[test]
fn lgamma_approx_saturates_below_floor() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let lg = lgamma_approx(&Tensor::new(&[1e-6f32, 1e-9, 2e-9], &dev)?)?.to_vec1::<f32>()?;
    let at_floor = SpecialGamma::ln_gamma(1e-6).0 as f32;
    for v in lg {
        assert_abs_diff_eq!(v, at_floor, epsilon = 1e-2 * at_floor);
    }
    Ok(())
}
