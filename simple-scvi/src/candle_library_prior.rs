use candle_core::{DType, Device, Result, Tensor};

/// Fixed per-batch prior on the log library size
///
/// Both statistics are `1 x n_batch` tensors. They are set once at
/// construction and never handed to an optimizer.
#[derive(Clone, Debug)]
pub struct LibraryPrior {
    log_means_1b: Tensor,
    log_vars_1b: Tensor,
}

impl LibraryPrior {
    /// * `log_means_1b` - mean of log library size per batch (1 x B)
    /// * `log_vars_1b` - variance of log library size per batch (1 x B)
    pub fn new(log_means_1b: Tensor, log_vars_1b: Tensor) -> Result<Self> {
        let (r1, nb) = log_means_1b.dims2()?;
        let (r2, nb2) = log_vars_1b.dims2()?;
        if r1 != 1 || r2 != 1 || nb != nb2 || nb == 0 {
            candle_core::bail!(
                "library prior must be 1 x n_batch: means {:?}, vars {:?}",
                log_means_1b.dims(),
                log_vars_1b.dims()
            );
        }

        let min_var = log_vars_1b
            .min_all()?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()?;
        if !(min_var > 0.) {
            candle_core::bail!("library prior variance must be positive: {}", min_var);
        }

        Ok(Self {
            log_means_1b: log_means_1b.detach(),
            log_vars_1b: log_vars_1b.detach(),
        })
    }

    /// Build from host vectors, one entry per batch
    pub fn from_slices(log_means: &[f32], log_vars: &[f32], device: &Device) -> Result<Self> {
        let nb = log_means.len();
        Self::new(
            Tensor::from_slice(log_means, (1, nb), device)?,
            Tensor::from_slice(log_vars, (1, log_vars.len()), device)?,
        )
    }

    /// Empirical mean and variance of log total counts in each batch
    ///
    /// Cells with zero total count contribute zero on the log scale.
    /// Variances are floored at `1e-4` so that single-cell batches still
    /// give a proper prior.
    ///
    /// * `x_nd` - counts (n x genes)
    /// * `batch_n` - batch membership of each cell; `None` puts all cells in one batch
    /// * `n_batch` - number of batches (at least one)
    pub fn from_counts(x_nd: &Tensor, batch_n: Option<&Tensor>, n_batch: usize) -> Result<Self> {
        let n_batch = n_batch.max(1);
        let n_cells = x_nd.dim(0)?;

        let totals = x_nd
            .sum(1)?
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?;

        let membership: Vec<u32> = match batch_n {
            Some(b) => batch_indices_u32(b)?.to_vec1::<u32>()?,
            None => vec![0; n_cells],
        };

        if membership.len() != n_cells {
            candle_core::bail!(
                "{} batch labels for {} cells",
                membership.len(),
                n_cells
            );
        }

        let mut log_lib_by_batch: Vec<Vec<f64>> = vec![vec![]; n_batch];
        for (&tot, &b) in totals.iter().zip(membership.iter()) {
            let b = b as usize;
            if b >= n_batch {
                candle_core::bail!("batch label {} out of range {}", b, n_batch);
            }
            log_lib_by_batch[b].push(if tot > 0. { tot.ln() } else { 0. });
        }

        let mut log_means = Vec::with_capacity(n_batch);
        let mut log_vars = Vec::with_capacity(n_batch);
        for (b, vals) in log_lib_by_batch.iter().enumerate() {
            if vals.is_empty() {
                candle_core::bail!("no cells in batch {}", b);
            }
            let nn = vals.len() as f64;
            let mu = vals.iter().sum::<f64>() / nn;
            let var = vals.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / nn;
            log_means.push(mu as f32);
            log_vars.push(var.max(1e-4) as f32);
        }

        Self::from_slices(&log_means, &log_vars, x_nd.device())
    }

    pub fn num_batches(&self) -> usize {
        self.log_means_1b.dims()[1]
    }

    pub fn log_means(&self) -> &Tensor {
        &self.log_means_1b
    }

    pub fn log_vars(&self) -> &Tensor {
        &self.log_vars_1b
    }

    /// One-hot encoding of batch labels (n x n_batch)
    pub fn one_hot(&self, batch_n: &Tensor) -> Result<Tensor> {
        let nb = self.num_batches();
        let labels_n1 = batch_indices_u32(batch_n)?.unsqueeze(1)?;

        let max_label = labels_n1.max_all()?.to_scalar::<u32>()? as usize;
        if max_label >= nb {
            candle_core::bail!("batch label {} out of range {}", max_label, nb);
        }

        let levels_1b = Tensor::arange(0u32, nb as u32, batch_n.device())?.unsqueeze(0)?;
        labels_n1
            .broadcast_eq(&levels_1b)?
            .to_dtype(self.log_means_1b.dtype())
    }

    /// Per-cell prior mean and variance (n x 1 each), a linear
    /// projection of the one-hot batch labels onto the statistics.
    /// Without labels every cell takes the first batch.
    pub fn local_params(&self, batch_n: Option<&Tensor>, n_cells: usize) -> Result<(Tensor, Tensor)> {
        let dev = self.log_means_1b.device();
        let onehot_nb = match batch_n {
            Some(b) => self.one_hot(b)?,
            None => {
                let zeros = Tensor::zeros(n_cells, DType::U32, dev)?;
                self.one_hot(&zeros)?
            }
        };

        if onehot_nb.dim(0)? != n_cells {
            candle_core::bail!(
                "{} batch labels for {} cells",
                onehot_nb.dim(0)?,
                n_cells
            );
        }

        let mean_n1 = onehot_nb.matmul(&self.log_means_1b.t()?.contiguous()?)?;
        let var_n1 = onehot_nb.matmul(&self.log_vars_1b.t()?.contiguous()?)?;
        Ok((mean_n1, var_n1))
    }
}

/// flatten batch labels of any numeric dtype into a u32 vector
fn batch_indices_u32(batch_n: &Tensor) -> Result<Tensor> {
    let flat = batch_n.flatten_all()?;
    match flat.dtype() {
        DType::U32 => Ok(flat),
        DType::U8 | DType::I64 => flat.to_dtype(DType::U32),
        _ => {
            let min_label = flat.min_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            if min_label < 0. {
                candle_core::bail!("negative batch label {}", min_label);
            }
            flat.round()?.to_dtype(DType::U32)
        }
    }
}
