use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder};

/// One fully-connected block: linear -> batch norm -> activation -> dropout
pub struct FcBlock {
    linear: Linear,
    bn: BatchNorm,
    activation: Activation,
    dropout: Option<Dropout>,
}

impl ModuleT for FcBlock {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.linear.forward(input)?;
        let h = self.bn.forward_t(&h, train)?;
        let h = self.activation.forward(&h)?;
        match &self.dropout {
            Some(dropout) => dropout.forward_t(&h, train),
            None => Ok(h),
        }
    }
}

/// build a stack of fully-connected blocks
pub struct StackLayers {
    blocks: Vec<FcBlock>,
}

impl ModuleT for StackLayers {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for block in self.blocks.iter() {
            x = block.forward_t(&x, train)?;
        }
        Ok(x)
    }
}

impl StackLayers {
    /// Will create `n_layers` blocks with these variables:
    ///
    /// * `fc.{}.linear.{weight,bias}` where {} is the layer index
    /// * `fc.{}.bn.{weight,bias,running_mean,running_var}`
    ///
    /// # Arguments
    /// * `n_in` - input dimension
    /// * `n_out` - output dimension of every block
    /// * `n_layers` - number of blocks (at least one)
    /// * `dropout_rate` - dropout after each activation (0 turns it off)
    pub fn new(
        n_in: usize,
        n_out: usize,
        n_layers: usize,
        dropout_rate: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        if n_layers == 0 {
            candle_core::bail!("need at least one hidden layer");
        }
        if !(0.0..1.0).contains(&dropout_rate) {
            candle_core::bail!("dropout rate {} outside [0, 1)", dropout_rate);
        }

        let mut blocks = Vec::with_capacity(n_layers);
        let mut prev_dim = n_in;
        for j in 0..n_layers {
            let vs_j = vs.pp(format!("fc.{}", j));
            let linear = candle_nn::linear(prev_dim, n_out, vs_j.pp("linear"))?;
            let bn_config = candle_nn::BatchNormConfig {
                eps: 1e-3,
                remove_mean: true,
                affine: true,
                momentum: 0.01,
            };
            let bn = candle_nn::batch_norm(n_out, bn_config, vs_j.pp("bn"))?;
            let dropout = (dropout_rate > 0.0).then(|| Dropout::new(dropout_rate));
            blocks.push(FcBlock {
                linear,
                bn,
                activation: Activation::Relu,
                dropout,
            });
            prev_dim = n_out;
        }

        Ok(Self { blocks })
    }
}
