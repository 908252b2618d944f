use candle_core::{Result, Tensor};

/// A minibatch handed over by the host
/// * `x` - counts (n x genes)
/// * `batch_index` - experimental batch membership (n x 1), if any
pub struct ScviBatch {
    pub x: Tensor,
    pub batch_index: Option<Tensor>,
}

impl ScviBatch {
    pub fn new(x: Tensor, batch_index: Option<Tensor>) -> Self {
        Self { x, batch_index }
    }

    pub fn num_cells(&self) -> Result<usize> {
        self.x.dim(0)
    }
}

pub struct InferenceInputs {
    pub x: Tensor,
}

/// Approximate posterior of the latent states and library size
pub struct InferenceOutputs {
    pub z: Tensor,
    pub qz_m: Tensor,
    pub qz_v: Tensor,
    pub ql_m: Tensor,
    pub ql_v: Tensor,
    pub library: Tensor,
}

pub struct GenerativeInputs {
    pub z: Tensor,
    pub library: Tensor,
}

/// Parameters of the ZINB observation model
pub struct GenerativeOutputs {
    pub px_scale: Tensor,
    pub px_r: Tensor,
    pub px_rate: Tensor,
    pub px_dropout: Tensor,
}

/// Per-cell KL terms
pub struct KlLocal {
    pub kl_l: Tensor,
    pub kl_z: Tensor,
}

pub struct LossOutput {
    /// scalar objective
    pub loss: Tensor,
    /// per-cell negative log-likelihood
    pub reconstruction_loss: Tensor,
    pub kl_local: KlLocal,
}

/// Output of a Gaussian encoder
/// * `mean` - posterior mean
/// * `var` - posterior variance (strictly positive)
/// * `draw` - one reparameterized sample
pub struct GaussianLatent {
    pub mean: Tensor,
    pub var: Tensor,
    pub draw: Tensor,
}

/// Output of a ZINB decoder
pub struct ZinbParams {
    pub px_scale: Tensor,
    pub px_rate: Tensor,
    pub px_dropout: Tensor,
}

pub trait EncoderModuleT {
    /// An encoder that spits out posterior mean, variance and `n_samples` draws
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `n_samples` - number of draws; more than one adds a leading axis
    /// * `train` - whether to use dropout/batchnorm or not
    fn forward_t(&self, x_nd: &Tensor, n_samples: usize, train: bool) -> Result<GaussianLatent>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out the parameters of the observation model
    /// * `z_nk` - latent states (n x k) or (s x n x k)
    /// * `library_n1` - log library size (n x 1) or (s x n x 1)
    fn forward_t(&self, z_nk: &Tensor, library_n1: &Tensor, train: bool) -> Result<ZinbParams>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// The functions a host calls on a VAE module
pub trait VaeModuleT {
    fn get_inference_input(&self, batch: &ScviBatch) -> InferenceInputs;

    fn get_generative_input(
        &self,
        batch: &ScviBatch,
        inference_outputs: &InferenceOutputs,
    ) -> GenerativeInputs;

    /// Encode counts `x` into `z`, `qz_m`, `qz_v`, `ql_m`, `ql_v`, `library`
    fn inference(&self, x: &Tensor, train: bool) -> Result<InferenceOutputs>;

    /// Decode into `px_scale`, `px_r`, `px_rate`, `px_dropout`
    fn generative(&self, z: &Tensor, library: &Tensor, train: bool) -> Result<GenerativeOutputs>;

    /// Negative ELBO with the latent KL term scaled by `kl_weight`
    fn loss(
        &self,
        batch: &ScviBatch,
        inference_outputs: &InferenceOutputs,
        generative_outputs: &GenerativeOutputs,
        kl_weight: f64,
    ) -> Result<LossOutput>;

    /// Posterior predictive counts, (n x genes) or (n x genes x samples)
    fn sample(&self, batch: &ScviBatch, n_samples: usize, library_size: usize) -> Result<Tensor>;

    /// Importance-sampled log marginal likelihood summed over cells
    fn marginal_ll(&self, batch: &ScviBatch, n_mc_samples: usize) -> Result<f64>;

    /// inference -> generative -> loss
    fn forward(
        &self,
        batch: &ScviBatch,
        kl_weight: f64,
        train: bool,
    ) -> Result<(InferenceOutputs, GenerativeOutputs, LossOutput)> {
        let inference_inputs = self.get_inference_input(batch);
        let inference_outputs = self.inference(&inference_inputs.x, train)?;
        let generative_inputs = self.get_generative_input(batch, &inference_outputs);
        let generative_outputs =
            self.generative(&generative_inputs.z, &generative_inputs.library, train)?;
        let losses = self.loss(batch, &inference_outputs, &generative_outputs, kl_weight)?;
        Ok((inference_outputs, generative_outputs, losses))
    }
}
