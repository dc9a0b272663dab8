//! Structural reparameterization of large-kernel convolutions.
//!
//! During training a large depthwise kernel is regularized by a parallel
//! small-kernel branch; both branches carry their own batchnorm and the
//! forward pass sums their outputs. After training the two conv+bn pairs are
//! fused and summed into one plain convolution with a bias, see
//! "Scaling Up Your Kernels to 31x31" (https://arxiv.org/abs/2203.06717).

use candle::{Module, Result, Tensor};
use candle_nn::{Conv2d, ModuleT, VarBuilder};

use crate::layers::{conv_bn, pad_kernel_to, ConvBn};

#[derive(Debug)]
enum Branches {
    /// Training-time form: large-kernel conv+bn plus an optional parallel
    /// small-kernel conv+bn of identical stride and groups.
    Origin {
        lkb: ConvBn,
        small: Option<ConvBn>,
    },
    /// Inference-time form, the only state reachable after `merge_kernel`.
    Fused(Conv2d),
}

#[derive(Debug)]
pub struct ReparamLargeKernelConv {
    branches: Branches,
    kernel_size: usize,
}

impl ReparamLargeKernelConv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        small_kernel: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if let Some(small) = small_kernel {
            if small > kernel_size {
                candle::bail!(
                    "the kernel size for re-param cannot be larger than the large kernel ({small} > {kernel_size})"
                )
            }
        }
        let lkb = conv_bn(
            in_channels,
            out_channels,
            kernel_size,
            stride,
            groups,
            vb.pp("lkb_origin"),
        )?;
        let small = match small_kernel {
            Some(small) => Some(conv_bn(
                in_channels,
                out_channels,
                small,
                stride,
                groups,
                vb.pp("small_conv"),
            )?),
            None => None,
        };
        Ok(Self {
            branches: Branches::Origin { lkb, small },
            kernel_size,
        })
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.branches, Branches::Fused(_))
    }

    /// The `(weight, bias)` of the single large convolution equivalent to the
    /// two training-time branches: each branch is fused with its batchnorm,
    /// the small kernel is zero-padded to the large spatial extent, then
    /// kernels and biases are summed.
    pub fn equivalent_kernel_bias(&self) -> Result<(Tensor, Tensor)> {
        match &self.branches {
            Branches::Fused(_) => candle::bail!("the large-kernel conv has already been merged"),
            Branches::Origin { lkb, small } => {
                let (mut eq_k, mut eq_b) = lkb.fuse()?;
                if let Some(small) = small {
                    let (small_k, small_b) = small.fuse()?;
                    eq_k = (eq_k + pad_kernel_to(&small_k, self.kernel_size)?)?;
                    eq_b = (eq_b + small_b)?;
                }
                Ok((eq_k, eq_b))
            }
        }
    }

    /// One-way transition to the fused inference form. Both training branches
    /// are discarded; calling this again is a no-op. Must only be used once
    /// training is over, the fusion bakes in the current running statistics.
    pub fn merge_kernel(&mut self) -> Result<()> {
        let conv2d_cfg = match &self.branches {
            Branches::Fused(_) => return Ok(()),
            Branches::Origin { lkb, .. } => *lkb.conv().config(),
        };
        let (eq_k, eq_b) = self.equivalent_kernel_bias()?;
        self.branches = Branches::Fused(Conv2d::new(eq_k, Some(eq_b), conv2d_cfg));
        Ok(())
    }
}

impl ModuleT for ReparamLargeKernelConv {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match &self.branches {
            Branches::Fused(conv) => conv.forward(xs),
            Branches::Origin { lkb, small } => {
                let out = lkb.forward_t(xs, train)?;
                match small {
                    Some(small) => out + small.forward_t(xs, train)?,
                    None => Ok(out),
                }
            }
        }
    }
}
