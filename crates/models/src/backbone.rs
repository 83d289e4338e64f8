//! ReXNet-style backbone: a truncated trunk plus spliced-in tail bottlenecks.
//!
//! Shapes (320x320 input, normalized to [-1, 1]):
//! - Trunk output: `[B, 128, 20, 20]` (overall stride 16)
//! - Pyramid maps: channels `[672, 480, 512, 256, 256, 128]`,
//!   spatial sizes `20, 10, 5, 3, 2, 2`

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{backend::Backend, Tensor};

const BN_EPS: f64 = 1e-3;
const BN_MOMENTUM: f64 = 0.03;

fn silu<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.clone() * sigmoid(x)
}

fn relu6<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.clamp(0.0, 6.0)
}

fn batch_norm<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels)
        .with_epsilon(BN_EPS)
        .with_momentum(BN_MOMENTUM)
        .init(device)
}

/// Channel attention gate: pool, reduce, expand, sigmoid scale.
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    pub fn new(channels: usize, se_ratio: usize, device: &B::Device) -> Self {
        let squeezed = (channels / se_ratio.max(1)).max(1);
        let reduce = Conv2dConfig::new([channels, squeezed], [1, 1]).init(device);
        let norm = batch_norm(squeezed, device);
        let expand = Conv2dConfig::new([squeezed, channels], [1, 1]).init(device);
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce,
            norm,
            expand,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let gate = self.pool.forward(input.clone());
        let gate = relu(self.norm.forward(self.reduce.forward(gate)));
        let gate = sigmoid(self.expand.forward(gate));
        input * gate
    }
}

/// One linear bottleneck: expand (1x1), depthwise (3x3), optional SE,
/// linear projection (1x1). The expansion stage is skipped when
/// `expand_ratio == 1`.
#[derive(Debug, Clone, Copy)]
pub struct BottleneckConfig {
    pub in_channels: usize,
    pub channels: usize,
    pub expand_ratio: usize,
    pub stride: usize,
    pub use_se: bool,
    pub se_ratio: usize,
}

impl BottleneckConfig {
    pub const fn new(in_channels: usize, channels: usize, expand_ratio: usize, stride: usize) -> Self {
        Self {
            in_channels,
            channels,
            expand_ratio,
            stride,
            use_se: false,
            se_ratio: 12,
        }
    }

    pub const fn with_se(mut self) -> Self {
        self.use_se = true;
        self
    }
}

#[derive(Module, Debug)]
pub struct LinearBottleneck<B: Backend> {
    expand_conv: Option<Conv2d<B>>,
    expand_norm: Option<BatchNorm<B, 2>>,
    depthwise: Conv2d<B>,
    depthwise_norm: BatchNorm<B, 2>,
    se: Option<SqueezeExcite<B>>,
    project: Conv2d<B>,
    project_norm: BatchNorm<B, 2>,
    use_shortcut: bool,
}

impl<B: Backend> LinearBottleneck<B> {
    pub fn new(cfg: BottleneckConfig, device: &B::Device) -> Self {
        let mid = cfg.in_channels * cfg.expand_ratio.max(1);
        let (expand_conv, expand_norm) = if cfg.expand_ratio > 1 {
            let conv = Conv2dConfig::new([cfg.in_channels, mid], [1, 1])
                .with_bias(false)
                .init(device);
            (Some(conv), Some(batch_norm(mid, device)))
        } else {
            (None, None)
        };

        let depthwise = Conv2dConfig::new([mid, mid], [3, 3])
            .with_stride([cfg.stride, cfg.stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_groups(mid)
            .with_bias(false)
            .init(device);
        let depthwise_norm = batch_norm(mid, device);

        let se = cfg
            .use_se
            .then(|| SqueezeExcite::new(mid, cfg.se_ratio, device));

        let project = Conv2dConfig::new([mid, cfg.channels], [1, 1])
            .with_bias(false)
            .init(device);
        let project_norm = batch_norm(cfg.channels, device);

        Self {
            expand_conv,
            expand_norm,
            depthwise,
            depthwise_norm,
            se,
            project,
            project_norm,
            use_shortcut: cfg.stride == 1 && cfg.in_channels == cfg.channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = self.use_shortcut.then(|| input.clone());

        let mut x = input;
        if let (Some(conv), Some(norm)) = (&self.expand_conv, &self.expand_norm) {
            x = silu(norm.forward(conv.forward(x)));
        }
        x = relu6(self.depthwise_norm.forward(self.depthwise.forward(x)));
        if let Some(se) = &self.se {
            x = se.forward(x);
        }
        x = self.project_norm.forward(self.project.forward(x));

        match residual {
            Some(residual) => x + residual,
            None => x,
        }
    }
}

/// Trunk schedule standing in for the kept prefix of the pretrained
/// backbone: stem at stride 2, bottlenecks down to stride 16, ending at
/// 128 channels.
#[derive(Debug, Clone)]
pub struct TrunkConfig {
    pub blocks: Vec<BottleneckConfig>,
}

impl Default for TrunkConfig {
    fn default() -> Self {
        Self {
            blocks: vec![
                BottleneckConfig::new(32, 16, 1, 1),
                BottleneckConfig::new(16, 32, 6, 2),
                BottleneckConfig::new(32, 48, 6, 1),
                BottleneckConfig::new(48, 64, 6, 2).with_se(),
                BottleneckConfig::new(64, 96, 6, 1).with_se(),
                BottleneckConfig::new(96, 128, 6, 2).with_se(),
            ],
        }
    }
}

impl TrunkConfig {
    pub fn out_channels(&self) -> usize {
        self.blocks.last().map(|b| b.channels).unwrap_or(32)
    }

    fn stride(&self) -> usize {
        // Stem contributes a factor of 2.
        self.blocks.iter().fold(2, |s, b| s * b.stride)
    }
}

#[derive(Module, Debug)]
pub struct Trunk<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: BatchNorm<B, 2>,
    blocks: Vec<LinearBottleneck<B>>,
}

impl<B: Backend> Trunk<B> {
    pub fn new(cfg: &TrunkConfig, device: &B::Device) -> Self {
        let stem_channels = cfg.blocks.first().map(|b| b.in_channels).unwrap_or(32);
        let stem = Conv2dConfig::new([3, stem_channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let stem_norm = batch_norm(stem_channels, device);
        let blocks = cfg
            .blocks
            .iter()
            .map(|b| LinearBottleneck::new(*b, device))
            .collect();
        Self {
            stem,
            stem_norm,
            blocks,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = silu(self.stem_norm.forward(self.stem.forward(input)));
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }
}

#[derive(Debug, Clone)]
pub struct BackboneConfig {
    pub trunk: TrunkConfig,
    pub tails: Vec<BottleneckConfig>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            trunk: TrunkConfig::default(),
            tails: vec![
                BottleneckConfig::new(128, 672, 1, 1),
                BottleneckConfig::new(672, 480, 1, 2),
                BottleneckConfig::new(480, 512, 1, 2),
                BottleneckConfig::new(512, 256, 1, 2),
                BottleneckConfig::new(256, 256, 1, 2),
                BottleneckConfig::new(256, 128, 1, 1),
            ],
        }
    }
}

impl BackboneConfig {
    /// Channel count of each pyramid level, in order.
    pub fn out_channels(&self) -> Vec<usize> {
        self.tails.iter().map(|t| t.channels).collect()
    }

    /// Spatial size of each pyramid level for a given input size.
    pub fn feature_sizes(&self, image_size: (usize, usize)) -> Vec<(usize, usize)> {
        fn halve(n: usize) -> usize {
            (n - 1) / 2 + 1
        }
        let stride = self.trunk.stride();
        let mut h = image_size.0;
        let mut w = image_size.1;
        let mut s = 1;
        while s < stride {
            h = halve(h);
            w = halve(w);
            s *= 2;
        }
        let mut sizes = Vec::with_capacity(self.tails.len());
        for tail in &self.tails {
            if tail.stride == 2 {
                h = halve(h);
                w = halve(w);
            }
            sizes.push((h, w));
        }
        sizes
    }
}

/// Trunk plus tail blocks; every tail output is a pyramid level fed to the
/// detection head.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub trunk: Trunk<B>,
    tails: Vec<LinearBottleneck<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn new(cfg: &BackboneConfig, device: &B::Device) -> Self {
        let trunk = Trunk::new(&cfg.trunk, device);
        let tails = cfg
            .tails
            .iter()
            .map(|t| LinearBottleneck::new(*t, device))
            .collect();
        Self { trunk, tails }
    }

    /// Replace the trunk, e.g. with one restored from a pretraining
    /// checkpoint.
    pub fn with_trunk(mut self, trunk: Trunk<B>) -> Self {
        self.trunk = trunk;
        self
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = self.trunk.forward(images);
        let mut features = Vec::with_capacity(self.tails.len());
        for tail in &self.tails {
            x = tail.forward(x);
            features.push(x.clone());
        }
        features
    }
}
