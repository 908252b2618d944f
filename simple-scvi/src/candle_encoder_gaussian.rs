use crate::candle_aux_layers::StackLayers;
use crate::candle_distributions::Normal;
use crate::candle_model_traits::*;

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};

/// Encodes data into a diagonal Gaussian posterior
///
/// ```text
/// q = fc(x)
/// mean = W_m q + b_m
/// var = exp(W_v q + b_v) + var_eps
/// z = mean + sqrt(var) * eps
/// ```
pub struct GaussianEncoder {
    n_input: usize,
    n_output: usize,
    fc: StackLayers,
    mean_encoder: Linear,
    var_encoder: Linear,
    var_eps: f64,
}

impl EncoderModuleT for GaussianEncoder {
    fn forward_t(&self, x_nd: &Tensor, n_samples: usize, train: bool) -> Result<GaussianLatent> {
        let (mean, var) = self.latent_gaussian_params(x_nd, train)?;
        let q = Normal::new(&mean, &var)?;

        if n_samples > 1 {
            let draw = q.rsample_n(n_samples)?;
            let dims = draw.dims().to_vec();
            Ok(GaussianLatent {
                mean: mean.unsqueeze(0)?.broadcast_as(dims.as_slice())?,
                var: var.unsqueeze(0)?.broadcast_as(dims.as_slice())?,
                draw,
            })
        } else {
            let draw = q.rsample()?;
            Ok(GaussianLatent { mean, var, draw })
        }
    }

    fn dim_obs(&self) -> usize {
        self.n_input
    }

    fn dim_latent(&self) -> usize {
        self.n_output
    }
}

impl GaussianEncoder {
    ///
    /// Evaluate latent Gaussian parameters: mean and variance
    pub fn latent_gaussian_params(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let q_nh = self.fc.forward_t(x_nd, train)?;
        let mean_nk = self.mean_encoder.forward(&q_nh)?;
        let var_nk = (self.var_encoder.forward(&q_nh)?.exp()? + self.var_eps)?;
        Ok((mean_nk, var_nk))
    }

    /// Will create a new Gaussian encoder module
    /// with these variables:
    ///
    /// * `fc.{}.linear.weight` where {} is the layer index
    /// * `mean.weight`
    /// * `var.weight`
    pub fn new(
        n_input: usize,
        n_output: usize,
        n_layers: usize,
        n_hidden: usize,
        dropout_rate: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = StackLayers::new(n_input, n_hidden, n_layers, dropout_rate, vs.clone())?;
        let mean_encoder = candle_nn::linear(n_hidden, n_output, vs.pp("mean"))?;
        let var_encoder = candle_nn::linear(n_hidden, n_output, vs.pp("var"))?;

        Ok(Self {
            n_input,
            n_output,
            fc,
            mean_encoder,
            var_encoder,
            var_eps: 1e-4,
        })
    }
}
