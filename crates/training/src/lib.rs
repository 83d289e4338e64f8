#![recursion_limit = "256"]

//! Train/eval loops, dataset loading, and the mAP metric for the
//! ReXNet-SSD detector.

pub mod dataset;
pub mod metrics;
pub mod util;

pub use dataset::{
    collate, split_samples, validate_class_ids, CollatedBatch, DatasetConfig, DatasetError,
    DatasetPathConfig, DetectionLabel, LabelFile, RunSample,
};
pub use metrics::{GroundTruth, MapReport, MeanAveragePrecision};
pub use models::{Detection, DetectorConfig, SsdDetector};
pub use util::{run_train, run_validation, TrainArgs};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
