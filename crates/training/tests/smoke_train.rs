//! End-to-end smoke test: synthetic dataset on disk, one optimizer step,
//! checkpoint round trip, and an inference pass on the restored model.

use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use models::SsdDetector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use training::dataset::{collate, DatasetConfig, DatasetPathConfig};
use training::util::detector_config;
use training::TrainBackend;

type ADBackend = Autodiff<TrainBackend>;

fn synthetic_dataset(root: &std::path::Path, count: usize) {
    let labels_dir = root.join("labels");
    fs::create_dir_all(&labels_dir).unwrap();
    for i in 0..count {
        let stem = format!("frame_{i:05}");
        let json = format!(
            r#"{{
                "image": "{stem}.png",
                "labels": [
                    {{"bbox_norm": [0.2, 0.2, 0.6, 0.7], "bbox_px": null, "class_id": {}}}
                ]
            }}"#,
            1 + i % 3
        );
        fs::write(labels_dir.join(format!("{stem}.json")), json).unwrap();
        let img = image::RgbImage::from_fn(64, 64, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 4) as u8, (i * 60) as u8])
        });
        img.save(root.join(format!("{stem}.png"))).unwrap();
    }
}

#[test]
fn one_step_trains_saves_and_restores() {
    let temp = tempfile::tempdir().unwrap();
    synthetic_dataset(temp.path(), 2);

    let paths = DatasetPathConfig {
        root: temp.path().to_path_buf(),
        labels_subdir: "labels".into(),
        images_subdir: ".".into(),
    };
    let samples = paths.load().unwrap();
    assert_eq!(samples.len(), 2);

    let cfg = DatasetConfig {
        image_size: (64, 64),
        max_boxes: 4,
        flip_horizontal_prob: 0.0,
    };
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(3);
    let batch = collate::<ADBackend>(&samples, &cfg, &mut rng, &device).unwrap();

    let config = detector_config(4, 64);
    let mut model = SsdDetector::<ADBackend>::new(config.clone(), &device);
    let mut optim = AdamConfig::new().init();

    let (cls_logits, bbox_reg) = model.forward(batch.images.clone());
    let loss = model.loss(cls_logits, bbox_reg, batch.boxes, batch.labels, batch.box_mask);
    let total = loss.total();

    let cls_val = loss.classification.into_data().to_vec::<f32>().unwrap()[0];
    let box_val = loss.bbox_regression.into_data().to_vec::<f32>().unwrap()[0];
    let total_val = total.clone().detach().into_data().to_vec::<f32>().unwrap()[0];
    assert!(cls_val.is_finite() && cls_val > 0.0, "classification {cls_val}");
    assert!(box_val.is_finite() && box_val >= 0.0, "bbox_regression {box_val}");
    assert!((total_val - (cls_val + box_val)).abs() < 1e-4);

    let grads = GradientsParams::from_grads(total.backward(), &model);
    model = optim.step(1e-3, model, grads);

    let ckpt = temp.path().join("smoke.bin");
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model.clone().save_file(&ckpt, &recorder).unwrap();

    let restored = SsdDetector::<TrainBackend>::new(config, &device)
        .load_file(&ckpt, &recorder, &device)
        .unwrap();
    assert_eq!(restored.num_anchors(), model.num_anchors());

    let val_batch = collate::<TrainBackend>(&samples, &cfg, &mut rng, &device).unwrap();
    let detections = restored.detect(val_batch.images);
    assert_eq!(detections.len(), 2);

    // Freezing and running validation on the trained model also works.
    let valid_model = model.freeze_trunk().valid();
    let report = training::util::run_validation(
        &valid_model,
        &samples,
        &cfg,
        2,
        4,
        0.5,
        &device,
    )
    .unwrap();
    assert!(report.mean.is_finite());
    assert_eq!(report.per_class.len(), 3);
}
