//! Conv+BN building blocks shared by the stem, transitions and residual blocks.

use candle::{Result, Tensor, D};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, ModuleT, VarBuilder};

const BN_EPS: f64 = 1e-5;

/// Fuses a bias-free convolution kernel and a batchnorm layer into the weight
/// and bias of a single equivalent convolution, using the batchnorm's running
/// statistics. Per output channel: `t = gamma / sqrt(var + eps)`, the kernel
/// is scaled by `t` and the bias is `beta - mean * t`.
pub fn fuse_conv_bn(weights: &Tensor, bn: &BatchNorm) -> Result<(Tensor, Tensor)> {
    let (gamma, beta) = match bn.weight_and_bias() {
        Some(wb) => wb,
        None => candle::bail!("cannot fuse a batchnorm without affine parameters"),
    };
    let mu = bn.running_mean();
    if weights.dim(0)? != mu.dim(0)? {
        candle::bail!(
            "channel mismatch between conv ({}) and batchnorm ({})",
            weights.dim(0)?,
            mu.dim(0)?
        )
    }
    let sigma = ((bn.running_var() + bn.eps())?).sqrt()?;
    let t = (gamma / &sigma)?;
    let bias = (beta - mu * &t)?;
    let weights = weights.broadcast_mul(&t.reshape(((), 1, 1, 1))?)?;

    Ok((weights, bias))
}

/// A bias-free convolution followed by a batchnorm, the training-time form of
/// every convolution in the network. Padding is always `kernel / 2` so the
/// convolution itself never changes the spatial size unless strided.
#[derive(Debug)]
pub struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    /// The `(weight, bias)` of the single convolution equivalent to this
    /// conv+bn pair at inference time.
    pub fn fuse(&self) -> Result<(Tensor, Tensor)> {
        fuse_conv_bn(self.conv.weight(), &self.bn)
    }
}

impl ModuleT for ConvBn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply(&self.conv)?.apply_t(&self.bn, train)
    }
}

pub fn conv_bn(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    groups: usize,
    vb: VarBuilder,
) -> Result<ConvBn> {
    let conv2d_cfg = Conv2dConfig {
        stride,
        padding: kernel / 2,
        groups,
        ..Default::default()
    };
    let conv = conv2d_no_bias(in_channels, out_channels, kernel, conv2d_cfg, vb.pp("conv"))?;
    let bn = batch_norm(out_channels, BN_EPS, vb.pp("bn"))?;
    Ok(ConvBn { conv, bn })
}

/// Conv+BN followed by a ReLU.
#[derive(Debug)]
pub struct ConvBnRelu {
    inner: ConvBn,
}

impl ModuleT for ConvBnRelu {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.inner.forward_t(xs, train)?.relu()
    }
}

pub fn conv_bn_relu(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    groups: usize,
    vb: VarBuilder,
) -> Result<ConvBnRelu> {
    let inner = conv_bn(in_channels, out_channels, kernel, stride, groups, vb)?;
    Ok(ConvBnRelu { inner })
}

/// Stochastic depth over a residual branch. During training the whole branch
/// output is zeroed with probability `drop_prob`, one independent draw per
/// call; surviving outputs are not rescaled. Inference is the identity.
#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    drop_prob: f32,
}

impl DropPath {
    pub fn new(drop_prob: f32) -> Self {
        Self { drop_prob }
    }
}

impl ModuleT for DropPath {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_prob <= 0. {
            return Ok(xs.clone());
        }
        let coin = Tensor::rand(0f32, 1f32, 1, xs.device())?.to_vec1::<f32>()?[0];
        if coin < self.drop_prob {
            xs.zeros_like()
        } else {
            Ok(xs.clone())
        }
    }
}

/// Zero-pads a small square kernel on both spatial axes so that it covers the
/// receptive field of a `large`-sized kernel.
pub(crate) fn pad_kernel_to(kernel: &Tensor, large: usize) -> Result<Tensor> {
    let small = kernel.dim(D::Minus1)?;
    if small > large {
        candle::bail!("cannot pad a {small}x{small} kernel down to {large}x{large}")
    }
    let pad = (large - small) / 2;
    kernel
        .pad_with_zeros(D::Minus1, pad, pad)?
        .pad_with_zeros(D::Minus2, pad, pad)
}
