use crate::candle_loss_functions::*;

use candle_core::{DType, Result, Tensor};
use candle_nn::ops;
use rand_distr::{Bernoulli, Distribution, Gamma, Poisson};

/// Diagonal Gaussian parameterized by mean and variance
#[derive(Clone, Debug)]
pub struct Normal {
    mean: Tensor,
    var: Tensor,
}

impl Normal {
    /// * `mean` - mean tensor
    /// * `var` - variance tensor (broadcast-compatible with `mean`)
    pub fn new(mean: &Tensor, var: &Tensor) -> Result<Self> {
        let var = var.broadcast_as(mean.dims())?;
        Ok(Self {
            mean: mean.clone(),
            var,
        })
    }

    /// N(0, 1) with the same shape as `like`
    pub fn standard_like(like: &Tensor) -> Result<Self> {
        Ok(Self {
            mean: Tensor::zeros_like(like)?,
            var: Tensor::ones_like(like)?,
        })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn scale(&self) -> Result<Tensor> {
        self.var.sqrt()
    }

    /// element-wise log N(x; mean, var)
    pub fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        gaussian_log_density(x, &self.mean, &self.var)
    }

    /// reparameterized draw: mean + sqrt(var) * eps, eps ~ N(0, 1)
    pub fn rsample(&self) -> Result<Tensor> {
        let eps = Tensor::randn_like(&self.mean, 0., 1.)?;
        self.mean.add(&self.scale()?.mul(&eps)?)
    }

    /// `n` reparameterized draws stacked along a new leading axis
    pub fn rsample_n(&self, n: usize) -> Result<Tensor> {
        let mut dims = vec![n];
        dims.extend_from_slice(self.mean.dims());
        let mean = self.mean.unsqueeze(0)?.broadcast_as(dims.as_slice())?;
        let scale = self.scale()?.unsqueeze(0)?.broadcast_as(dims.as_slice())?;
        let eps = Tensor::randn(0f32, 1f32, dims.as_slice(), self.mean.device())?
            .to_dtype(self.mean.dtype())?;
        mean.add(&scale.mul(&eps)?)
    }

    /// element-wise KL(self || other)
    pub fn kl_divergence(&self, other: &Normal) -> Result<Tensor> {
        gaussian_kl_elementwise(&self.mean, &self.var, &other.mean, &other.var)
    }
}

/// Zero-inflated negative binomial
///
/// * `mu` - mean of the negative binomial component
/// * `theta` - inverse dispersion, broadcast to `mu`
/// * `zi_logits` - logits of the zero (dropout) component
#[derive(Clone, Debug)]
pub struct ZeroInflatedNegBinom {
    mu: Tensor,
    theta: Tensor,
    zi_logits: Tensor,
}

impl ZeroInflatedNegBinom {
    pub fn new(mu: &Tensor, theta: &Tensor, zi_logits: &Tensor) -> Result<Self> {
        let theta = theta.broadcast_as(mu.dims())?;
        if zi_logits.dims() != mu.dims() {
            candle_core::bail!(
                "zero-inflation logits {:?} do not match mean {:?}",
                zi_logits.dims(),
                mu.dims()
            );
        }
        Ok(Self {
            mu: mu.clone(),
            theta,
            zi_logits: zi_logits.clone(),
        })
    }

    pub fn mean(&self) -> Result<Tensor> {
        let keep = ops::sigmoid(&self.zi_logits.neg()?)?;
        self.mu.mul(&keep)
    }

    /// dropout probabilities sigmoid(zi_logits)
    pub fn zi_probs(&self) -> Result<Tensor> {
        ops::sigmoid(&self.zi_logits)
    }

    /// element-wise log-likelihood of the counts `x`
    pub fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        zinb_log_likelihood(x, &self.mu, &self.theta, &self.zi_logits)
    }

    /// Draw one count per entry on the host:
    ///
    /// ```text
    /// rate ~ Gamma(theta, mu/theta)
    /// y ~ Poisson(rate)
    /// y = 0 with probability sigmoid(zi_logits)
    /// ```
    ///
    /// The returned tensor is not attached to any computation graph.
    pub fn sample(&self) -> Result<Tensor> {
        let dims = self.mu.dims().to_vec();
        let dtype = self.mu.dtype();
        let device = self.mu.device();

        let to_host = |t: &Tensor| -> Result<Vec<f32>> {
            t.detach()
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()
        };

        let mu = to_host(&self.mu)?;
        let theta = to_host(&self.theta)?;
        let zi = to_host(&self.zi_probs()?)?;

        let mut rng = rand::rng();
        let mut counts = Vec::with_capacity(mu.len());

        for ((&m, &r), &p) in mu.iter().zip(theta.iter()).zip(zi.iter()) {
            let dropout = Bernoulli::new(p.clamp(0., 1.) as f64)
                .map_err(|e| candle_core::Error::Msg(format!("bernoulli: {}", e)))?;

            if dropout.sample(&mut rng) || !(m > 0.) {
                counts.push(0f32);
                continue;
            }

            let gamma = Gamma::new(r, m / r)
                .map_err(|e| candle_core::Error::Msg(format!("gamma: {}", e)))?;
            let rate = gamma.sample(&mut rng);

            let y: f32 = if rate > 0. {
                Poisson::new(rate)
                    .map_err(|e| candle_core::Error::Msg(format!("poisson: {}", e)))?
                    .sample(&mut rng)
            } else {
                0f32
            };
            counts.push(y);
        }

        Tensor::from_vec(counts, dims, device)?.to_dtype(dtype)
    }
}
