use clap::Parser;
use tracing::{info, warn};

use models::SsdDetector;
use training::dataset::{validate_class_ids, DatasetConfig, DatasetPathConfig};
use training::util::{
    detector_config, init_tracing, load_detector_from_checkpoint, run_validation,
    validate_backend_choice, BackendKind,
};
use training::TrainBackend;

#[derive(Parser, Debug)]
#[command(name = "eval", about = "Evaluate a detector checkpoint on a dataset (mAP by IoU)")]
struct Args {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    /// Dataset root containing labels/ and images.
    #[arg(long, default_value = "assets/datasets/detection")]
    dataset_root: String,
    /// Labels subdirectory relative to dataset root.
    #[arg(long, default_value = "labels")]
    labels_subdir: String,
    /// Images subdirectory relative to dataset root.
    #[arg(long, default_value = ".")]
    images_subdir: String,
    /// Class count including background.
    #[arg(long, default_value_t = 21)]
    num_classes: usize,
    /// Square input size images are resized to.
    #[arg(long, default_value_t = 320)]
    image_size: u32,
    /// Maximum boxes per image (pads/truncates to this for collation).
    #[arg(long, default_value_t = 32)]
    max_boxes: usize,
    /// Batch size.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    /// Checkpoint path to load.
    #[arg(long)]
    checkpoint: Option<String>,
    /// IoU threshold for mAP.
    #[arg(long, default_value_t = 0.5)]
    iou_thresh: f32,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let paths = DatasetPathConfig {
        root: args.dataset_root.into(),
        labels_subdir: args.labels_subdir,
        images_subdir: args.images_subdir,
    };
    let samples = paths.load()?;
    if samples.is_empty() {
        info!("no samples found under {}", paths.root.display());
        return Ok(());
    }
    validate_class_ids(&samples, args.num_classes)?;

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let config = detector_config(args.num_classes, args.image_size);
    let model = match &args.checkpoint {
        Some(path) => load_detector_from_checkpoint(path, config.clone(), &device)
            .unwrap_or_else(|e| {
                warn!("failed to load checkpoint {path}; using fresh model ({e})");
                SsdDetector::<TrainBackend>::new(config.clone(), &device)
            }),
        None => {
            warn!("no checkpoint provided; using fresh model");
            SsdDetector::<TrainBackend>::new(config.clone(), &device)
        }
    };

    let dataset_cfg = DatasetConfig {
        image_size: (args.image_size, args.image_size),
        max_boxes: args.max_boxes,
        flip_horizontal_prob: 0.0,
    };
    let report = run_validation(
        &model,
        &samples,
        &dataset_cfg,
        args.batch_size,
        args.num_classes,
        args.iou_thresh,
        &device,
    )?;

    info!(
        mean_ap = report.mean,
        iou_thresh = args.iou_thresh,
        "eval complete: mAP {:.4}",
        report.mean
    );
    for (i, ap) in report.per_class.iter().enumerate() {
        match ap {
            Some(ap) => info!("class {}: AP {:.4}", i + 1, ap),
            None => info!("class {}: no ground truth", i + 1),
        }
    }

    Ok(())
}
