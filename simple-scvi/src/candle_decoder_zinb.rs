use crate::candle_aux_layers::StackLayers;
use crate::candle_model_traits::*;

use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, Module, ModuleT, VarBuilder};

//////////////////
// ZINB Decoder //
//////////////////

/// ```text
/// h = fc(z)
/// px_scale = softmax(W_s h)
/// px_dropout = W_d h
/// px_rate = exp(library) * px_scale
/// ```
///
/// Dispersion is per gene and owned by the caller, so there is no
/// `px_r` head here.
pub struct ZinbDecoder {
    n_latent: usize,
    n_output: usize,
    px_decoder: StackLayers,
    px_scale_decoder: Linear,
    px_dropout_decoder: Linear,
}

impl ZinbDecoder {
    /// Will create a new decoder with the following parameters:
    /// * `fc.{}.linear.weight`
    /// * `px_scale.weight`
    /// * `px_dropout.weight`
    pub fn new(
        n_latent: usize,
        n_output: usize,
        n_layers: usize,
        n_hidden: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let px_decoder = StackLayers::new(n_latent, n_hidden, n_layers, 0.0, vs.clone())?;
        let px_scale_decoder = candle_nn::linear(n_hidden, n_output, vs.pp("px_scale"))?;
        let px_dropout_decoder = candle_nn::linear(n_hidden, n_output, vs.pp("px_dropout"))?;

        Ok(Self {
            n_latent,
            n_output,
            px_decoder,
            px_scale_decoder,
            px_dropout_decoder,
        })
    }

    fn forward_flat(&self, z_nk: &Tensor, library_n1: &Tensor, train: bool) -> Result<ZinbParams> {
        let h_nh = self.px_decoder.forward_t(z_nk, train)?;
        let px_scale = ops::softmax_last_dim(&self.px_scale_decoder.forward(&h_nh)?)?;
        let px_dropout = self.px_dropout_decoder.forward(&h_nh)?;
        let px_rate = library_n1.exp()?.broadcast_mul(&px_scale)?;
        Ok(ZinbParams {
            px_scale,
            px_rate,
            px_dropout,
        })
    }
}

impl DecoderModuleT for ZinbDecoder {
    fn forward_t(&self, z_nk: &Tensor, library_n1: &Tensor, train: bool) -> Result<ZinbParams> {
        match *z_nk.dims() {
            [s, n, k] => {
                // fold draws into the cell axis and unfold afterwards
                let z_flat = z_nk.reshape((s * n, k))?;
                let lib_flat = library_n1.reshape((s * n, 1))?;
                let out = self.forward_flat(&z_flat, &lib_flat, train)?;
                let d = self.n_output;
                Ok(ZinbParams {
                    px_scale: out.px_scale.reshape((s, n, d))?,
                    px_rate: out.px_rate.reshape((s, n, d))?,
                    px_dropout: out.px_dropout.reshape((s, n, d))?,
                })
            }
            [_, _] => self.forward_flat(z_nk, library_n1, train),
            _ => candle_core::bail!("latent states must be rank 2 or 3: {:?}", z_nk.dims()),
        }
    }

    fn dim_obs(&self) -> usize {
        self.n_output
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}
