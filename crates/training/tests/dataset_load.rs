use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;
use training::dataset::{
    collate, validate_class_ids, DatasetConfig, DatasetError, DatasetPathConfig,
};
use training::TrainBackend;

fn write_sample(root: &std::path::Path, stem: &str, json: &str) {
    let labels_dir = root.join("labels");
    fs::create_dir_all(&labels_dir).unwrap();
    fs::write(labels_dir.join(format!("{stem}.json")), json).unwrap();
    let img = image::RgbImage::from_fn(8, 8, |x, _y| image::Rgb([(x * 30) as u8, 0, 255]));
    img.save(root.join(format!("{stem}.png"))).unwrap();
}

fn path_config(root: &std::path::Path) -> DatasetPathConfig {
    DatasetPathConfig {
        root: PathBuf::from(root),
        labels_subdir: "labels".into(),
        images_subdir: ".".into(),
    }
}

#[test]
fn load_and_collate_synthetic_dataset() {
    let temp = tempfile::tempdir().unwrap();
    write_sample(
        temp.path(),
        "frame_00001",
        r#"{
            "image": "frame_00001.png",
            "labels": [
                {"bbox_norm": [0.1, 0.1, 0.4, 0.5], "bbox_px": null, "class_id": 1},
                {"bbox_norm": null, "bbox_px": [2.0, 2.0, 6.0, 6.0], "class_id": 2}
            ]
        }"#,
    );

    let samples = path_config(temp.path()).load().unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].labels.len(), 2);

    let cfg = DatasetConfig {
        image_size: (32, 32),
        max_boxes: 4,
        flip_horizontal_prob: 0.0,
    };
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(7);
    let batch = collate::<TrainBackend>(&samples, &cfg, &mut rng, &device).unwrap();

    assert_eq!(batch.images.dims(), [1, 3, 32, 32]);
    assert_eq!(batch.boxes.dims(), [1, 4, 4]);
    assert_eq!(batch.labels.dims(), [1, 4]);
    assert_eq!(batch.box_mask.dims(), [1, 4]);

    let mask: Vec<f32> = batch.box_mask.into_data().to_vec().unwrap();
    assert_eq!(mask, vec![1.0, 1.0, 0.0, 0.0]);

    let labels: Vec<f32> = batch.labels.into_data().to_vec().unwrap();
    assert_eq!(&labels[..2], &[1.0, 2.0]);

    // Pixel-space box resolved against the 8x8 source image.
    let boxes: Vec<f32> = batch.boxes.into_data().to_vec().unwrap();
    assert!((boxes[4] - 0.25).abs() < 1e-6);
    assert!((boxes[6] - 0.75).abs() < 1e-6);

    // Mean 0.5 / std 0.5 normalization puts pixels in [-1, 1].
    let pixels: Vec<f32> = batch.images.into_data().to_vec().unwrap();
    assert!(pixels.iter().all(|v| (-1.0..=1.0).contains(v)));
    assert!(pixels.iter().any(|v| *v > 0.9)); // blue channel is saturated
}

#[test]
fn background_class_id_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    write_sample(
        temp.path(),
        "frame_00001",
        r#"{
            "image": "frame_00001.png",
            "labels": [{"bbox_norm": [0.1, 0.1, 0.4, 0.5], "bbox_px": null, "class_id": 0}]
        }"#,
    );

    let err = path_config(temp.path()).load().unwrap_err();
    assert!(matches!(err, DatasetError::Validation { .. }));
}

#[test]
fn class_id_beyond_class_count_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    write_sample(
        temp.path(),
        "frame_00001",
        r#"{
            "image": "frame_00001.png",
            "labels": [{"bbox_norm": [0.1, 0.1, 0.4, 0.5], "bbox_px": null, "class_id": 7}]
        }"#,
    );

    // Per-file validation passes; the range check needs the class count.
    let samples = path_config(temp.path()).load().unwrap();
    let err = validate_class_ids(&samples, 3).unwrap_err();
    assert!(matches!(err, DatasetError::Validation { .. }));
    assert!(validate_class_ids(&samples, 8).is_ok());
}

#[test]
fn degenerate_box_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    write_sample(
        temp.path(),
        "frame_00001",
        r#"{
            "image": "frame_00001.png",
            "labels": [{"bbox_norm": [0.4, 0.1, 0.4, 0.5], "bbox_px": null, "class_id": 1}]
        }"#,
    );

    let err = path_config(temp.path()).load().unwrap_err();
    assert!(matches!(err, DatasetError::Validation { .. }));
}

#[test]
fn horizontal_flip_mirrors_boxes() {
    let temp = tempfile::tempdir().unwrap();
    write_sample(
        temp.path(),
        "frame_00001",
        r#"{
            "image": "frame_00001.png",
            "labels": [{"bbox_norm": [0.1, 0.2, 0.3, 0.6], "bbox_px": null, "class_id": 1}]
        }"#,
    );

    let samples = path_config(temp.path()).load().unwrap();
    let cfg = DatasetConfig {
        image_size: (16, 16),
        max_boxes: 2,
        flip_horizontal_prob: 1.0,
    };
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(7);
    let batch = collate::<TrainBackend>(&samples, &cfg, &mut rng, &device).unwrap();

    let boxes: Vec<f32> = batch.boxes.into_data().to_vec().unwrap();
    assert!((boxes[0] - 0.7).abs() < 1e-6);
    assert!((boxes[1] - 0.2).abs() < 1e-6);
    assert!((boxes[2] - 0.9).abs() < 1e-6);
    assert!((boxes[3] - 0.6).abs() < 1e-6);
}
