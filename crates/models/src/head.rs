//! SSDLite-style prediction head: one classification and one regression
//! branch per pyramid level, each a 3x3 depthwise conv + BN + ReLU6 followed
//! by a 1x1 projection.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::{backend::Backend, Tensor};

const BN_EPS: f64 = 1e-3;
const BN_MOMENTUM: f64 = 0.03;

#[derive(Module, Debug)]
pub struct PredictionBranch<B: Backend> {
    depthwise: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    project: Conv2d<B>,
}

impl<B: Backend> PredictionBranch<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let depthwise = Conv2dConfig::new([in_channels, in_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_groups(in_channels)
            .with_bias(false)
            .init(device);
        let norm = BatchNormConfig::new(in_channels)
            .with_epsilon(BN_EPS)
            .with_momentum(BN_MOMENTUM)
            .init(device);
        let project = Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device);
        Self {
            depthwise,
            norm,
            project,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.norm.forward(self.depthwise.forward(input));
        self.project.forward(x.clamp(0.0, 6.0))
    }
}

/// Flatten `[B, A*C, H, W]` into `[B, H*W*A, C]`, matching the anchor grid
/// layout (row-major, anchor-minor).
fn flatten_predictions<B: Backend>(x: Tensor<B, 4>, channels: usize) -> Tensor<B, 3> {
    let [b, ac, h, w] = x.dims();
    let a = ac / channels;
    let x: Tensor<B, 5> = x.reshape([b, a, channels, h, w]);
    let x = x.permute([0, 3, 4, 1, 2]);
    x.reshape([b, h * w * a, channels])
}

#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    cls_branches: Vec<PredictionBranch<B>>,
    reg_branches: Vec<PredictionBranch<B>>,
    num_classes: usize,
}

impl<B: Backend> Head<B> {
    pub fn new(
        out_channels: &[usize],
        anchors_per_location: &[usize],
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        assert_eq!(
            out_channels.len(),
            anchors_per_location.len(),
            "pyramid levels and anchor layouts must pair up"
        );
        let mut cls_branches = Vec::with_capacity(out_channels.len());
        let mut reg_branches = Vec::with_capacity(out_channels.len());
        for (&channels, &anchors) in out_channels.iter().zip(anchors_per_location) {
            cls_branches.push(PredictionBranch::new(
                channels,
                anchors * num_classes,
                device,
            ));
            reg_branches.push(PredictionBranch::new(channels, anchors * 4, device));
        }
        Self {
            cls_branches,
            reg_branches,
            num_classes,
        }
    }

    /// Class logits `[B, N, num_classes]` and box regression `[B, N, 4]`,
    /// where N is the total anchor count over every level.
    pub fn forward(&self, features: &[Tensor<B, 4>]) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let mut cls = Vec::with_capacity(features.len());
        let mut reg = Vec::with_capacity(features.len());
        for (i, feature) in features.iter().enumerate() {
            cls.push(flatten_predictions(
                self.cls_branches[i].forward(feature.clone()),
                self.num_classes,
            ));
            reg.push(flatten_predictions(
                self.reg_branches[i].forward(feature.clone()),
                4,
            ));
        }
        (Tensor::cat(cls, 1), Tensor::cat(reg, 1))
    }
}
