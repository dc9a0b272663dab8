//! RepLKNet large-kernel CNN backbones for candle.
//!
//! Implementation of the backbone family from
//! ["Scaling Up Your Kernels to 31x31: Revisiting Large Kernel Design in
//! CNNs"](https://arxiv.org/abs/2203.06717), trainable (stochastic depth,
//! batchnorm running statistics) and convertible to the single-branch
//! inference form through structural reparameterization.
//!
//! ```no_run
//! use candle::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use candle_replknet::{Config, RepLKNet};
//!
//! fn main() -> candle::Result<()> {
//!     let varmap = VarMap::new();
//!     let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//!     // Multi-scale features for a detection neck.
//!     let cfg = Config::replknet_31b().with_out_indices(vec![0, 1, 2, 3], true);
//!     let model = RepLKNet::new(&cfg, vb)?;
//!     let image = Tensor::zeros((1, 3, 224, 224), DType::F32, &Device::Cpu)?;
//!     let features = model.forward_features(&image, false)?;
//!     for f in features.iter() {
//!         println!("{:?}", f.shape());
//!     }
//!     Ok(())
//! }
//! ```

pub mod blocks;
pub mod layers;
pub mod model;
pub mod reparam;

pub use model::{Config, RepLKNet};
pub use reparam::ReparamLargeKernelConv;
