//! Training loop, validation pass, and checkpoint helpers.

use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::{backend::Backend, Tensor};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::dataset::{collate, DatasetConfig, DatasetPathConfig, RunSample};
use crate::metrics::{GroundTruth, MapReport, MeanAveragePrecision};
use crate::TrainBackend;
use models::{collect_ground_truth, DetectorConfig, SsdDetector, Trunk};

type ADBackend = Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the ReXNet-SSD detector")]
pub struct TrainArgs {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Dataset root containing labels/ and images.
    #[arg(long, default_value = "assets/datasets/detection")]
    pub dataset_root: String,
    /// Labels subdirectory relative to dataset root.
    #[arg(long, default_value = "labels")]
    pub labels_subdir: String,
    /// Images subdirectory relative to dataset root.
    #[arg(long, default_value = ".")]
    pub images_subdir: String,
    /// Class count including background.
    #[arg(long, default_value_t = 21)]
    pub num_classes: usize,
    /// Square input size images are resized to.
    #[arg(long, default_value_t = 320)]
    pub image_size: u32,
    /// Maximum boxes per image (pads/truncates to this for collation).
    #[arg(long, default_value_t = 32)]
    pub max_boxes: usize,
    /// Number of epochs.
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,
    /// Batch size.
    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f32,
    /// Fraction of samples held out for validation.
    #[arg(long, default_value_t = 0.2)]
    pub val_ratio: f32,
    /// Seed for the split, shuffling, and augmentation.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Probability of horizontal-flip augmentation during training.
    #[arg(long, default_value_t = 0.0)]
    pub flip_horizontal_prob: f32,
    /// IoU threshold for the validation mAP.
    #[arg(long, default_value_t = 0.5)]
    pub iou_thresh: f32,
    /// Checkpoint output path.
    #[arg(long)]
    pub checkpoint_out: Option<String>,
    /// Trunk checkpoint from pretraining to load before composing the
    /// detector.
    #[arg(long)]
    pub backbone_weights: Option<String>,
    /// Disable gradient updates on the backbone trunk.
    #[arg(long, default_value_t = false)]
    pub freeze_backbone: bool,
}

pub fn detector_config(num_classes: usize, image_size: u32) -> DetectorConfig {
    DetectorConfig {
        num_classes,
        image_size: (image_size as usize, image_size as usize),
        ..Default::default()
    }
}

pub fn load_detector_from_checkpoint<P: AsRef<Path>>(
    path: P,
    config: DetectorConfig,
    device: &<TrainBackend as Backend>::Device,
) -> Result<SsdDetector<TrainBackend>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    SsdDetector::<TrainBackend>::new(config, device).load_file(path.as_ref(), &recorder, device)
}

fn scalar_value<B: Backend>(tensor: &Tensor<B, 1>) -> f32 {
    tensor
        .clone()
        .detach()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(0.0)
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;

    let paths = DatasetPathConfig {
        root: args.dataset_root.clone().into(),
        labels_subdir: args.labels_subdir.clone(),
        images_subdir: args.images_subdir.clone(),
    };
    let samples = paths.load()?;
    if samples.is_empty() {
        anyhow::bail!("no samples found under {}", paths.root.display());
    }
    crate::dataset::validate_class_ids(&samples, args.num_classes)?;

    let seed = args.seed.unwrap_or(42);
    let (mut train, val) = crate::dataset::split_samples(samples, args.val_ratio, seed);
    info!(train = train.len(), val = val.len(), "dataset split");

    let ckpt_path = args
        .checkpoint_out
        .clone()
        .unwrap_or_else(|| "checkpoints/rexnet_ssd.bin".to_string());
    if let Some(parent) = Path::new(&ckpt_path).parent() {
        fs::create_dir_all(parent)?;
    }

    let device = <ADBackend as Backend>::Device::default();
    let config = detector_config(args.num_classes, args.image_size);
    let mut model = SsdDetector::<ADBackend>::new(config.clone(), &device);

    if let Some(path) = &args.backbone_weights {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let trunk = Trunk::<ADBackend>::new(&config.backbone.trunk, &device)
            .load_file(Path::new(path), &recorder, &device)
            .map_err(|e| anyhow::anyhow!("failed to load backbone weights from {path}: {e}"))?;
        model = model.with_trunk(trunk);
        info!("loaded backbone trunk weights from {path}");
    }
    if args.freeze_backbone {
        info!("disabling updates on backbone trunk");
        model = model.freeze_trunk();
    } else {
        info!("enabling updates on backbone trunk");
    }

    let mut optim = AdamConfig::new().init();
    let train_cfg = DatasetConfig {
        image_size: (args.image_size, args.image_size),
        max_boxes: args.max_boxes,
        flip_horizontal_prob: args.flip_horizontal_prob,
    };
    let val_cfg = DatasetConfig {
        flip_horizontal_prob: 0.0,
        ..train_cfg.clone()
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let batch_size = args.batch_size.max(1);

    for epoch in 0..args.epochs {
        train.shuffle(&mut rng);
        let mut cls_losses = Vec::new();
        let mut box_losses = Vec::new();
        let mut total_losses = Vec::new();

        for chunk in train.chunks(batch_size) {
            let batch = collate::<ADBackend>(chunk, &train_cfg, &mut rng, &device)?;
            let (cls_logits, bbox_reg) = model.forward(batch.images);
            let loss = model.loss(cls_logits, bbox_reg, batch.boxes, batch.labels, batch.box_mask);
            let total = loss.total();

            let cls_val = scalar_value(&loss.classification);
            let box_val = scalar_value(&loss.bbox_regression);
            let total_val = scalar_value(&total);
            debug!(
                train_loss_classification = cls_val,
                train_loss_bbox_regression = box_val,
                train_loss = total_val,
                "train step"
            );
            cls_losses.push(cls_val);
            box_losses.push(box_val);
            total_losses.push(total_val);

            let grads = GradientsParams::from_grads(total.backward(), &model);
            model = optim.step(args.lr as f64, model, grads);
        }

        info!(
            epoch,
            train_loss = mean(&total_losses),
            train_loss_classification = mean(&cls_losses),
            train_loss_bbox_regression = mean(&box_losses),
            "epoch complete"
        );

        if !val.is_empty() {
            let report = run_validation(
                &model.valid(),
                &val,
                &val_cfg,
                batch_size,
                args.num_classes,
                args.iou_thresh,
                &device,
            )?;
            info!(epoch, valid_mean_ap = report.mean, "validation mAP: {:.4}", report.mean);
        }
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(Path::new(&ckpt_path), &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
    info!("saved checkpoint to {ckpt_path}");

    Ok(())
}

/// One validation pass: reset the metric, accumulate detections and ground
/// truth per image, and report mAP at the given IoU threshold.
pub fn run_validation(
    model: &SsdDetector<TrainBackend>,
    samples: &[RunSample],
    cfg: &DatasetConfig,
    batch_size: usize,
    num_classes: usize,
    iou_thresh: f32,
    device: &<TrainBackend as Backend>::Device,
) -> anyhow::Result<MapReport> {
    let mut metric = MeanAveragePrecision::new(num_classes);
    metric.reset();
    // Collation takes an RNG but validation never flips.
    let mut rng = StdRng::seed_from_u64(0);

    for chunk in samples.chunks(batch_size.max(1)) {
        let batch = collate::<TrainBackend>(chunk, cfg, &mut rng, device)?;
        let detections = model.detect(batch.images);
        let ground_truth = collect_ground_truth(&batch.boxes, &batch.labels, &batch.box_mask);
        for (preds, gts) in detections.iter().zip(&ground_truth) {
            let gts: Vec<GroundTruth> = gts
                .iter()
                .map(|&(bbox, label)| GroundTruth { bbox, label })
                .collect();
            metric.add(preds, &gts);
        }
    }

    Ok(metric.value(iou_thresh))
}
