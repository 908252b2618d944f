pub mod candle_aux_layers;
pub mod candle_decoder_zinb;
pub mod candle_distributions;
pub mod candle_encoder_gaussian;
pub mod candle_library_prior;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_scvi_module;

pub use candle_core;
pub use candle_nn;

pub use candle_library_prior::LibraryPrior;
pub use candle_model_traits::{ScviBatch, VaeModuleT};
pub use candle_scvi_module::{ScviConfig, ScviModule};
