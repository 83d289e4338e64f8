//! Burn modules for the ReXNet-SSD detector.
//!
//! This crate defines the network architecture and its composition:
//! - `Backbone`: ReXNet-style trunk, truncated and extended with tail
//!   bottlenecks that feed the feature pyramid.
//! - `Head`: SSDLite-style per-level classification/regression branches.
//! - `SsdDetector`: the composed model with anchor grid, matching loss, and
//!   post-processing.
//!
//! These are pure Burn Modules with no dataset or CLI awareness; the
//! `training` crate wires them into the train/eval loops.

pub mod anchors;
pub mod backbone;
pub mod boxes;
pub mod detector;
pub mod head;

pub use anchors::AnchorConfig;
pub use backbone::{
    Backbone, BackboneConfig, BottleneckConfig, LinearBottleneck, SqueezeExcite, Trunk, TrunkConfig,
};
pub use boxes::{iou_xyxy, nms, BoxCoder};
pub use detector::{collect_ground_truth, Detection, DetectionLoss, DetectorConfig, SsdDetector};
pub use head::Head;

pub mod prelude {
    pub use super::{AnchorConfig, Backbone, BackboneConfig, Detection, DetectorConfig, SsdDetector};
}
