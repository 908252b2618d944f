use crate::candle_decoder_zinb::*;
use crate::candle_distributions::*;
use crate::candle_encoder_gaussian::GaussianEncoder;
use crate::candle_library_prior::LibraryPrior;
use crate::candle_model_traits::*;

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Construction options
///
/// * `n_input` - number of input genes
/// * `n_batch` - number of batches; 0 ignores batch labels for the library prior
/// * `n_hidden` - nodes per hidden layer
/// * `n_latent` - dimensionality of the latent space
/// * `n_layers` - number of hidden layers in the `z` encoder and the decoder
/// * `dropout_rate` - dropout rate in the encoders
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScviConfig {
    pub n_input: usize,
    pub n_batch: usize,
    pub n_hidden: usize,
    pub n_latent: usize,
    pub n_layers: usize,
    pub dropout_rate: f32,
}

impl Default for ScviConfig {
    fn default() -> Self {
        Self {
            n_input: 0,
            n_batch: 0,
            n_hidden: 128,
            n_latent: 10,
            n_layers: 1,
            dropout_rate: 0.1,
        }
    }
}

impl ScviConfig {
    pub fn new(n_input: usize) -> Self {
        Self {
            n_input,
            ..Default::default()
        }
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_n_hidden(mut self, n_hidden: usize) -> Self {
        self.n_hidden = n_hidden;
        self
    }

    pub fn with_n_latent(mut self, n_latent: usize) -> Self {
        self.n_latent = n_latent;
        self
    }

    pub fn with_n_layers(mut self, n_layers: usize) -> Self {
        self.n_layers = n_layers;
        self
    }

    pub fn with_dropout_rate(mut self, dropout_rate: f32) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }

    /// Read a (possibly partial) JSON document; missing fields take defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_input == 0 {
            candle_core::bail!("n_input must be positive");
        }
        if self.n_hidden == 0 || self.n_latent == 0 || self.n_layers == 0 {
            candle_core::bail!(
                "n_hidden ({}), n_latent ({}) and n_layers ({}) must be positive",
                self.n_hidden,
                self.n_latent,
                self.n_layers
            );
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            candle_core::bail!("dropout rate {} outside [0, 1)", self.dropout_rate);
        }
        Ok(())
    }
}

/// Trainable parts: they live in the caller's `VarMap`
pub struct ScviParams {
    /// per-gene log inverse dispersion
    px_r: Tensor,
    z_encoder: GaussianEncoder,
    l_encoder: GaussianEncoder,
    decoder: ZinbDecoder,
}

/// Skeleton VAE for single-cell counts with a ZINB likelihood
///
/// ```text
/// z ~ N(0, I)
/// l ~ N(library_log_means[b], library_log_vars[b])
/// x | z, l ~ ZINB(exp(l) * softmax(f(z)), exp(px_r), g(z))
/// ```
///
/// Inference networks encode `log1p(x)` into `q(z|x)` and `q(l|x)`.
pub struct ScviModule {
    config: ScviConfig,
    params: ScviParams,
    buffers: LibraryPrior,
}

impl ScviModule {
    /// Will create a new module with these variables:
    ///
    /// * `px_r`
    /// * `z_encoder.*`, `l_encoder.*`
    /// * `decoder.*`
    ///
    /// The library prior is kept outside `vs`.
    pub fn new(config: ScviConfig, library_prior: LibraryPrior, vs: VarBuilder) -> Result<Self> {
        config.validate()?;

        if config.n_batch > 0 && library_prior.num_batches() != config.n_batch {
            candle_core::bail!(
                "library prior has {} batches, config says {}",
                library_prior.num_batches(),
                config.n_batch
            );
        }

        let px_r = vs.get_with_hints(
            config.n_input,
            "px_r",
            candle_nn::Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;

        let z_encoder = GaussianEncoder::new(
            config.n_input,
            config.n_latent,
            config.n_layers,
            config.n_hidden,
            config.dropout_rate,
            vs.pp("z_encoder"),
        )?;

        let l_encoder = GaussianEncoder::new(
            config.n_input,
            1,
            1,
            config.n_hidden,
            config.dropout_rate,
            vs.pp("l_encoder"),
        )?;

        let decoder = ZinbDecoder::new(
            config.n_latent,
            config.n_input,
            config.n_layers,
            config.n_hidden,
            vs.pp("decoder"),
        )?;

        if z_encoder.dim_latent() != decoder.dim_latent()
            || z_encoder.dim_obs() != decoder.dim_obs()
        {
            candle_core::bail!("encoder and decoder dimensions disagree");
        }

        info!(
            "scVI module: {} genes, {} latent, {} hidden x {} layers, {} prior batch(es)",
            config.n_input,
            config.n_latent,
            config.n_hidden,
            config.n_layers,
            library_prior.num_batches()
        );

        Ok(Self {
            config,
            params: ScviParams {
                px_r,
                z_encoder,
                l_encoder,
                decoder,
            },
            buffers: library_prior,
        })
    }

    pub fn config(&self) -> &ScviConfig {
        &self.config
    }

    pub fn library_prior(&self) -> &LibraryPrior {
        &self.buffers
    }

    /// exp(px_r), one positive value per gene
    pub fn dispersion(&self) -> Result<Tensor> {
        self.params.px_r.exp()
    }

    /// Check the gene axis and the sign of `x`, then cast it to the
    /// parameter dtype so integer counts go through the float ops.
    fn prepare_counts(&self, x: &Tensor) -> Result<Tensor> {
        let (_, n_genes) = x.dims2()?;
        if n_genes != self.config.n_input {
            candle_core::bail!(
                "expected {} genes, got {}",
                self.config.n_input,
                n_genes
            );
        }
        let min_val = x.min_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        if min_val < 0. {
            candle_core::bail!("counts must be non-negative, found {}", min_val);
        }
        x.to_dtype(self.params.px_r.dtype())
    }

    /// Batch labels are required whenever the prior is batch-specific
    fn batch_labels<'a>(&self, batch: &'a ScviBatch) -> Result<Option<&'a Tensor>> {
        if self.config.n_batch == 0 {
            return Ok(None);
        }
        match batch.batch_index.as_ref() {
            Some(b) => Ok(Some(b)),
            None => candle_core::bail!(
                "batch labels are missing but the model has {} batches",
                self.config.n_batch
            ),
        }
    }

    /// Inference with `n_samples` draws from one encoder pass.
    /// More than one draw puts a leading sample axis on every output.
    pub fn inference_n(&self, x: &Tensor, n_samples: usize, train: bool) -> Result<InferenceOutputs> {
        if n_samples == 0 {
            candle_core::bail!("need at least one sample");
        }
        let x = self.prepare_counts(x)?;

        let x_ = (x + 1.)?.log()?;

        let qz = self.params.z_encoder.forward_t(&x_, n_samples, train)?;
        let ql = self.params.l_encoder.forward_t(&x_, n_samples, train)?;

        Ok(InferenceOutputs {
            z: qz.draw,
            qz_m: qz.mean,
            qz_v: qz.var,
            ql_m: ql.mean,
            ql_v: ql.var,
            library: ql.draw,
        })
    }

    /// log p(l) under the batch-specific prior, summed over its dimension
    fn library_log_prior(&self, batch: &ScviBatch, library: &Tensor) -> Result<Tensor> {
        let n_cells = batch.num_cells()?;
        let (mean_n1, var_n1) = self.buffers.local_params(self.batch_labels(batch)?, n_cells)?;
        Normal::new(&mean_n1, &var_n1)?
            .log_prob(library)?
            .sum(library.rank() - 1)
    }

    /// Posterior mean of `z` (or one draw), detached
    pub fn latent_representation(&self, x: &Tensor, give_mean: bool) -> Result<Tensor> {
        let out = self.inference(x, false)?;
        Ok(if give_mean { out.qz_m } else { out.z }.detach())
    }

    /// Decoder `px_scale` averaged over `n_samples` latent draws, detached
    pub fn normalized_expression(&self, x: &Tensor, n_samples: usize) -> Result<Tensor> {
        let inf = self.inference_n(x, n_samples, false)?;
        let gen = self.generative(&inf.z, &inf.library, false)?;
        let px_scale = if n_samples > 1 {
            gen.px_scale.mean(0)?
        } else {
            gen.px_scale
        };
        Ok(px_scale.detach())
    }
}

impl VaeModuleT for ScviModule {
    fn get_inference_input(&self, batch: &ScviBatch) -> InferenceInputs {
        InferenceInputs {
            x: batch.x.clone(),
        }
    }

    fn get_generative_input(
        &self,
        _batch: &ScviBatch,
        inference_outputs: &InferenceOutputs,
    ) -> GenerativeInputs {
        GenerativeInputs {
            z: inference_outputs.z.clone(),
            library: inference_outputs.library.clone(),
        }
    }

    fn inference(&self, x: &Tensor, train: bool) -> Result<InferenceOutputs> {
        self.inference_n(x, 1, train)
    }

    fn generative(&self, z: &Tensor, library: &Tensor, train: bool) -> Result<GenerativeOutputs> {
        let px = self.params.decoder.forward_t(z, library, train)?;
        let px_r = self.dispersion()?;

        Ok(GenerativeOutputs {
            px_scale: px.px_scale,
            px_r,
            px_rate: px.px_rate,
            px_dropout: px.px_dropout,
        })
    }

    fn loss(
        &self,
        batch: &ScviBatch,
        inference_outputs: &InferenceOutputs,
        generative_outputs: &GenerativeOutputs,
        kl_weight: f64,
    ) -> Result<LossOutput> {
        if !(kl_weight >= 0. && kl_weight.is_finite()) {
            candle_core::bail!("kl_weight must be finite and non-negative: {}", kl_weight);
        }

        let x = &self.prepare_counts(&batch.x)?;
        let n_cells = batch.num_cells()?;
        let qz_m = &inference_outputs.qz_m;
        let last = qz_m.rank() - 1;

        // 1. KL(q(z|x) || N(0, I))
        let qz = Normal::new(qz_m, &inference_outputs.qz_v)?;
        let kl_divergence_z = qz.kl_divergence(&Normal::standard_like(qz_m)?)?.sum(last)?;

        // 2-3. KL(q(l|x) || p(l | batch))
        let (mean_n1, var_n1) = self.buffers.local_params(self.batch_labels(batch)?, n_cells)?;
        let ql = Normal::new(&inference_outputs.ql_m, &inference_outputs.ql_v)?;
        let kl_divergence_l = ql
            .kl_divergence(&Normal::new(&mean_n1, &var_n1)?)?
            .sum(inference_outputs.ql_m.rank() - 1)?;

        // 4. -log p(x | z, l)
        let px = ZeroInflatedNegBinom::new(
            &generative_outputs.px_rate,
            &generative_outputs.px_r,
            &generative_outputs.px_dropout,
        )?;
        let reconst_loss = px.log_prob(x)?.sum(x.rank() - 1)?.neg()?;

        // 5. warm-up only touches the latent term
        let weighted_kl_local = (&kl_divergence_z * kl_weight)?.broadcast_add(&kl_divergence_l)?;

        // 6.
        let loss = reconst_loss.broadcast_add(&weighted_kl_local)?.mean_all()?;

        Ok(LossOutput {
            loss,
            reconstruction_loss: reconst_loss,
            kl_local: KlLocal {
                kl_l: kl_divergence_l,
                kl_z: kl_divergence_z,
            },
        })
    }

    /// `library_size` is accepted but does not rescale the draws.
    fn sample(&self, batch: &ScviBatch, n_samples: usize, _library_size: usize) -> Result<Tensor> {
        if n_samples == 0 {
            candle_core::bail!("n_samples must be positive");
        }

        let inference_inputs = self.get_inference_input(batch);
        let inference_outputs = self.inference_n(&inference_inputs.x, n_samples, false)?;
        let generative_inputs = self.get_generative_input(batch, &inference_outputs);
        let generative_outputs =
            self.generative(&generative_inputs.z, &generative_inputs.library, false)?;

        let dist = ZeroInflatedNegBinom::new(
            &generative_outputs.px_rate.detach(),
            &generative_outputs.px_r.detach(),
            &generative_outputs.px_dropout.detach(),
        )?;

        let exprs = if n_samples > 1 {
            // (samples, cells, genes) -> (cells, genes, samples)
            dist.sample()?.permute((1, 2, 0))?.contiguous()?
        } else {
            dist.sample()?
        };

        Ok(exprs.detach())
    }

    fn marginal_ll(&self, batch: &ScviBatch, n_mc_samples: usize) -> Result<f64> {
        if n_mc_samples == 0 {
            candle_core::bail!("n_mc_samples must be positive");
        }

        let mut to_sum = Vec::with_capacity(n_mc_samples);

        for _ in 0..n_mc_samples {
            let (inference_outputs, _, losses) = self.forward(batch, 1.0, false)?;
            let InferenceOutputs {
                z,
                qz_m,
                qz_v,
                ql_m,
                ql_v,
                library,
            } = inference_outputs;

            let p_z = Normal::standard_like(&qz_m)?.log_prob(&z)?.sum(1)?;
            let p_l = self.library_log_prior(batch, &library)?;
            let p_x_zl = losses.reconstruction_loss.neg()?;
            let q_z_x = Normal::new(&qz_m, &qz_v)?.log_prob(&z)?.sum(1)?;
            let q_l_x = Normal::new(&ql_m, &ql_v)?.log_prob(&library)?.sum(1)?;

            let log_w = ((((p_z + p_l)? + p_x_zl)? - q_z_x)? - q_l_x)?;
            to_sum.push(log_w.detach());
        }

        // cells x samples
        let to_sum = Tensor::stack(&to_sum, 1)?;
        let batch_log_lkl = (to_sum.log_sum_exp(1)? - (n_mc_samples as f64).ln())?;
        let log_lkl = batch_log_lkl
            .sum_all()?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;

        debug!(
            "marginal log-likelihood over {} cells with {} draws: {}",
            batch_log_lkl.dim(0)?,
            n_mc_samples,
            log_lkl
        );

        Ok(log_lkl)
    }
}
