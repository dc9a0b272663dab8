//! RepLKNet backbone assembly.
//!
//! A backbone is built either for classification (`num_classes`, final norm +
//! global average pool + linear head) or as a multi-scale feature extractor
//! for detection/segmentation (`out_indices`, one feature map per requested
//! stage). The two modes are exclusive and fixed at construction.

use candle::{Result, Tensor, D};
use candle_nn::{batch_norm, linear, BatchNorm, Linear, ModuleT, VarBuilder};

use crate::blocks::RepLKNetStage;
use crate::layers::{conv_bn_relu, ConvBnRelu};

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
pub struct Config {
    /// Per-stage depthwise kernel size.
    pub large_kernel_sizes: Vec<usize>,
    /// Per-stage number of (large-kernel, channel-mixing) block pairs.
    pub layers: Vec<usize>,
    /// Per-stage channel width.
    pub channels: Vec<usize>,
    /// Maximum stochastic-depth rate; per-block rates ramp up linearly to it.
    pub drop_path_rate: f32,
    /// Parallel small-kernel branch size, `None` disables the branch.
    pub small_kernel: Option<usize>,
    /// Width multiplier for the depthwise part of large-kernel blocks.
    pub dw_ratio: f64,
    /// Expansion ratio of the channel-mixing blocks.
    pub ffn_ratio: f64,
    pub in_channels: usize,
    /// Classification mode; exclusive with `out_indices`.
    pub num_classes: Option<usize>,
    /// Feature-extraction mode: indices of the stages whose outputs are
    /// returned, strictly increasing.
    pub out_indices: Option<Vec<usize>>,
    /// Batch-normalize the returned stage outputs. Only valid in
    /// feature-extraction mode.
    pub norm_intermediate_features: bool,
}

impl Config {
    /// RepLKNet-31B, ImageNet classification by default.
    pub fn replknet_31b() -> Self {
        Self {
            large_kernel_sizes: vec![31, 29, 27, 13],
            layers: vec![2, 2, 18, 2],
            channels: vec![128, 256, 512, 1024],
            drop_path_rate: 0.3,
            small_kernel: Some(5),
            dw_ratio: 1.,
            ffn_ratio: 4.,
            in_channels: 3,
            num_classes: Some(1000),
            out_indices: None,
            norm_intermediate_features: false,
        }
    }

    /// RepLKNet-31L.
    pub fn replknet_31l() -> Self {
        Self {
            channels: vec![192, 384, 768, 1536],
            ..Self::replknet_31b()
        }
    }

    /// RepLKNet-XL: wider, no small-kernel branch, 1.5x depthwise width.
    pub fn replknet_xl() -> Self {
        Self {
            large_kernel_sizes: vec![27, 27, 27, 13],
            channels: vec![256, 512, 1024, 2048],
            small_kernel: None,
            dw_ratio: 1.5,
            ..Self::replknet_31b()
        }
    }

    /// Switches the config to multi-scale feature-extraction mode.
    pub fn with_out_indices(mut self, out_indices: Vec<usize>, norm_features: bool) -> Self {
        self.num_classes = None;
        self.out_indices = Some(out_indices);
        self.norm_intermediate_features = norm_features;
        self
    }

    fn num_stages(&self) -> usize {
        self.layers.len()
    }

    fn validate(&self) -> Result<()> {
        match (&self.num_classes, &self.out_indices) {
            (None, None) => candle::bail!(
                "must specify one of num_classes (for pretraining) and out_indices (for downstream tasks)"
            ),
            (Some(_), Some(_)) => candle::bail!(
                "cannot specify both num_classes (for pretraining) and out_indices (for downstream tasks)"
            ),
            (Some(_), None) if self.norm_intermediate_features => candle::bail!(
                "for pretraining, no need to normalize the intermediate feature maps"
            ),
            _ => {}
        }
        if self.layers.is_empty() {
            candle::bail!("at least one stage is required")
        }
        if self.channels.len() != self.num_stages() || self.large_kernel_sizes.len() != self.num_stages() {
            candle::bail!(
                "per-stage config lengths disagree: {} kernel sizes, {} layer counts, {} widths",
                self.large_kernel_sizes.len(),
                self.layers.len(),
                self.channels.len()
            )
        }
        if let Some(small) = self.small_kernel {
            for &lk_size in self.large_kernel_sizes.iter() {
                if small > lk_size {
                    candle::bail!(
                        "the kernel size for re-param cannot be larger than the large kernel ({small} > {lk_size})"
                    )
                }
            }
        }
        if let Some(out_indices) = &self.out_indices {
            if out_indices.is_empty() {
                candle::bail!("out_indices cannot be empty")
            }
            for w in out_indices.windows(2) {
                if w[1] <= w[0] {
                    candle::bail!("out_indices must be strictly increasing, got {out_indices:?}")
                }
            }
            if out_indices[out_indices.len() - 1] >= self.num_stages() {
                candle::bail!(
                    "out_indices {:?} out of range for {} stages",
                    out_indices,
                    self.num_stages()
                )
            }
        }
        Ok(())
    }

    /// Linear block-wise ramp from 0 to `drop_path_rate` over the whole
    /// network, so later blocks are more likely to be dropped.
    fn drop_path_rates(&self) -> Vec<f32> {
        let total: usize = self.layers.iter().sum();
        (0..total)
            .map(|i| {
                if total > 1 {
                    self.drop_path_rate * i as f32 / (total - 1) as f32
                } else {
                    0.
                }
            })
            .collect()
    }
}

/// Learned downsampling between consecutive stages: a 1x1 width change
/// followed by a stride-2 depthwise 3x3.
#[derive(Debug)]
struct Transition {
    pw: ConvBnRelu,
    dw: ConvBnRelu,
}

impl Transition {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let pw = conv_bn_relu(in_channels, out_channels, 1, 1, 1, vb.pp(0))?;
        let dw = conv_bn_relu(out_channels, out_channels, 3, 2, out_channels, vb.pp(1))?;
        Ok(Self { pw, dw })
    }
}

impl ModuleT for Transition {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.dw.forward_t(&self.pw.forward_t(xs, train)?, train)
    }
}

#[derive(Debug)]
struct ClassifierHead {
    norm: BatchNorm,
    linear: Linear,
}

#[derive(Debug)]
pub struct RepLKNet {
    stem: Vec<ConvBnRelu>,
    stages: Vec<RepLKNetStage>,
    transitions: Vec<Transition>,
    out_indices: Option<Vec<usize>>,
    head: Option<ClassifierHead>,
}

impl RepLKNet {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let num_stages = cfg.num_stages();
        let base_width = cfg.channels[0];

        // Overall 4x spatial reduction before the first stage.
        let vb_s = vb.pp("stem");
        let stem = vec![
            conv_bn_relu(cfg.in_channels, base_width, 3, 2, 1, vb_s.pp(0))?,
            conv_bn_relu(base_width, base_width, 3, 1, base_width, vb_s.pp(1))?,
            conv_bn_relu(base_width, base_width, 1, 1, 1, vb_s.pp(2))?,
            conv_bn_relu(base_width, base_width, 3, 2, base_width, vb_s.pp(3))?,
        ];

        let dpr = cfg.drop_path_rates();
        let mut stages = Vec::with_capacity(num_stages);
        let mut transitions = Vec::with_capacity(num_stages.saturating_sub(1));
        let vb_st = vb.pp("stages");
        let vb_tr = vb.pp("transitions");
        let mut block_idx = 0;
        for stage_idx in 0..num_stages {
            let num_blocks = cfg.layers[stage_idx];
            stages.push(RepLKNetStage::new(
                cfg.channels[stage_idx],
                num_blocks,
                cfg.large_kernel_sizes[stage_idx],
                &dpr[block_idx..block_idx + num_blocks],
                cfg.small_kernel,
                cfg.dw_ratio,
                cfg.ffn_ratio,
                cfg.norm_intermediate_features,
                vb_st.pp(stage_idx),
            )?);
            block_idx += num_blocks;
            if stage_idx < num_stages - 1 {
                transitions.push(Transition::new(
                    cfg.channels[stage_idx],
                    cfg.channels[stage_idx + 1],
                    vb_tr.pp(stage_idx),
                )?);
            }
        }

        let head = match cfg.num_classes {
            Some(num_classes) => Some(ClassifierHead {
                norm: batch_norm(cfg.channels[num_stages - 1], 1e-5, vb.pp("norm"))?,
                linear: linear(cfg.channels[num_stages - 1], num_classes, vb.pp("head"))?,
            }),
            None => None,
        };

        Ok(Self {
            stem,
            stages,
            transitions,
            out_indices: cfg.out_indices.clone(),
            head,
        })
    }

    fn forward_stem(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for stem_layer in self.stem.iter() {
            xs = stem_layer.forward_t(&xs, train)?
        }
        Ok(xs)
    }

    /// Multi-scale forward pass, only valid in feature-extraction mode.
    /// Returns the (optionally normalized) outputs of the requested stages in
    /// increasing stage order.
    pub fn forward_features(&self, xs: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let out_indices = match &self.out_indices {
            Some(out_indices) => out_indices,
            None => candle::bail!(
                "this backbone was built for classification, use forward_t instead"
            ),
        };
        let mut xs = self.forward_stem(xs, train)?;
        let mut outs = Vec::with_capacity(out_indices.len());
        for (stage_idx, stage) in self.stages.iter().enumerate() {
            xs = stage.forward_t(&xs, train)?;
            if out_indices.contains(&stage_idx) {
                outs.push(stage.norm_features(&xs, train)?)
            }
            if stage_idx < self.stages.len() - 1 {
                xs = self.transitions[stage_idx].forward_t(&xs, train)?
            }
        }
        Ok(outs)
    }

    /// Fuses every reparameterizable large-kernel conv into its single-branch
    /// inference form. One-shot and irreversible; run it after training,
    /// never during (the fused kernels freeze the batchnorm statistics).
    pub fn structural_reparam(&mut self) -> Result<()> {
        for stage in self.stages.iter_mut() {
            stage.merge_kernels()?
        }
        Ok(())
    }
}

impl ModuleT for RepLKNet {
    /// Classification forward pass, only valid when built with `num_classes`.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let head = match &self.head {
            Some(head) => head,
            None => candle::bail!(
                "this backbone was built with out_indices, use forward_features instead"
            ),
        };
        let mut xs = self.forward_stem(xs, train)?;
        for (stage_idx, stage) in self.stages.iter().enumerate() {
            xs = stage.forward_t(&xs, train)?;
            if stage_idx < self.stages.len() - 1 {
                xs = self.transitions[stage_idx].forward_t(&xs, train)?
            }
        }
        xs.apply_t(&head.norm, train)?
            .mean(D::Minus2)?
            .mean(D::Minus1)?
            .apply(&head.linear)
    }
}
