//! Residual blocks and their stage-level assembly.

use candle::{Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, ModuleT, VarBuilder};

use crate::layers::{conv_bn, conv_bn_relu, ConvBn, ConvBnRelu, DropPath};
use crate::reparam::ReparamLargeKernelConv;

/// Channel-mixing feed-forward block: BN, 1x1 expansion, GELU, 1x1 projection
/// back to the input width, with a stochastic-depth gate on the residual
/// branch.
#[derive(Debug)]
pub struct ConvFfn {
    preffn_bn: BatchNorm,
    pw1: ConvBn,
    pw2: ConvBn,
    drop_path: DropPath,
}

impl ConvFfn {
    pub fn new(
        in_channels: usize,
        internal_channels: usize,
        out_channels: usize,
        drop_path: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if in_channels != out_channels {
            candle::bail!(
                "the ffn residual add needs matching widths ({in_channels} <> {out_channels})"
            )
        }
        let preffn_bn = batch_norm(in_channels, 1e-5, vb.pp("preffn_bn"))?;
        let pw1 = conv_bn(in_channels, internal_channels, 1, 1, 1, vb.pp("pw1"))?;
        let pw2 = conv_bn(internal_channels, out_channels, 1, 1, 1, vb.pp("pw2"))?;
        Ok(Self {
            preffn_bn,
            pw1,
            pw2,
            drop_path: DropPath::new(drop_path),
        })
    }
}

impl ModuleT for ConvFfn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = xs.apply_t(&self.preffn_bn, train)?;
        let out = self.pw1.forward_t(&out, train)?.gelu_erf()?;
        let out = self.pw2.forward_t(&out, train)?;
        xs + self.drop_path.forward_t(&out, train)?
    }
}

/// Large-kernel residual block: BN, 1x1 expansion with ReLU, reparameterized
/// depthwise large-kernel conv, ReLU, 1x1 projection back, stochastic-depth
/// gate and residual add.
#[derive(Debug)]
pub struct RepLkBlock {
    prelkb_bn: BatchNorm,
    pw1: ConvBnRelu,
    large_kernel: ReparamLargeKernelConv,
    pw2: ConvBn,
    drop_path: DropPath,
}

impl RepLkBlock {
    pub fn new(
        in_channels: usize,
        dw_channels: usize,
        block_lk_size: usize,
        small_kernel: Option<usize>,
        drop_path: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let prelkb_bn = batch_norm(in_channels, 1e-5, vb.pp("prelkb_bn"))?;
        let pw1 = conv_bn_relu(in_channels, dw_channels, 1, 1, 1, vb.pp("pw1"))?;
        let large_kernel = ReparamLargeKernelConv::new(
            dw_channels,
            dw_channels,
            block_lk_size,
            1,
            dw_channels,
            small_kernel,
            vb.pp("large_kernel"),
        )?;
        let pw2 = conv_bn(dw_channels, in_channels, 1, 1, 1, vb.pp("pw2"))?;
        Ok(Self {
            prelkb_bn,
            pw1,
            large_kernel,
            pw2,
            drop_path: DropPath::new(drop_path),
        })
    }

    pub fn large_kernel_mut(&mut self) -> &mut ReparamLargeKernelConv {
        &mut self.large_kernel
    }
}

impl ModuleT for RepLkBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = xs.apply_t(&self.prelkb_bn, train)?;
        let out = self.pw1.forward_t(&out, train)?;
        let out = self.large_kernel.forward_t(&out, train)?.relu()?;
        let out = self.pw2.forward_t(&out, train)?;
        xs + self.drop_path.forward_t(&out, train)?
    }
}

#[derive(Debug)]
enum Block {
    LargeKernel(RepLkBlock),
    ChannelMix(ConvFfn),
}

impl ModuleT for Block {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::LargeKernel(blk) => blk.forward_t(xs, train),
            Self::ChannelMix(blk) => blk.forward_t(xs, train),
        }
    }
}

/// A stage: alternating (large-kernel, channel-mixing) block pairs at a fixed
/// width and resolution. All large-kernel blocks of a stage share the stage's
/// kernel size.
#[derive(Debug)]
pub struct RepLKNetStage {
    blocks: Vec<Block>,
    norm: Option<BatchNorm>,
}

impl RepLKNetStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: usize,
        num_blocks: usize,
        stage_lk_size: usize,
        drop_path: &[f32],
        small_kernel: Option<usize>,
        dw_ratio: f64,
        ffn_ratio: f64,
        norm_intermediate_features: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if drop_path.len() != num_blocks {
            candle::bail!(
                "expected {num_blocks} drop-path rates, got {}",
                drop_path.len()
            )
        }
        let vb_b = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * num_blocks);
        for (i, &block_drop_path) in drop_path.iter().enumerate() {
            blocks.push(Block::LargeKernel(RepLkBlock::new(
                channels,
                (channels as f64 * dw_ratio) as usize,
                stage_lk_size,
                small_kernel,
                block_drop_path,
                vb_b.pp(2 * i),
            )?));
            blocks.push(Block::ChannelMix(ConvFfn::new(
                channels,
                (channels as f64 * ffn_ratio) as usize,
                channels,
                block_drop_path,
                vb_b.pp(2 * i + 1),
            )?));
        }
        let norm = if norm_intermediate_features {
            Some(batch_norm(channels, 1e-5, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self { blocks, norm })
    }

    /// Applies the optional trailing norm, used on stage outputs that are
    /// handed to external heads. Identity when the stage has no norm.
    pub fn norm_features(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match &self.norm {
            Some(norm) => xs.apply_t(norm, train),
            None => Ok(xs.clone()),
        }
    }

    pub(crate) fn merge_kernels(&mut self) -> Result<()> {
        for block in self.blocks.iter_mut() {
            if let Block::LargeKernel(blk) = block {
                blk.large_kernel_mut().merge_kernel()?
            }
        }
        Ok(())
    }
}

impl ModuleT for RepLKNetStage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for block in self.blocks.iter() {
            xs = block.forward_t(&xs, train)?
        }
        Ok(xs)
    }
}
