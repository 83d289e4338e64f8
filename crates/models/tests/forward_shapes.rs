use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use models::{BackboneConfig, Backbone, DetectorConfig, SsdDetector};

type TestBackend = NdArray<f32>;

#[test]
fn backbone_pyramid_shapes() {
    let device = Default::default();
    let cfg = BackboneConfig::default();
    let backbone = Backbone::<TestBackend>::new(&cfg, &device);

    let input = Tensor::<TestBackend, 4>::zeros([1, 3, 320, 320], &device);
    let features = backbone.forward(input);

    let expected_channels = [672, 480, 512, 256, 256, 128];
    let expected_sizes = [20, 10, 5, 3, 2, 2];
    assert_eq!(features.len(), expected_channels.len());
    for (i, feature) in features.iter().enumerate() {
        assert_eq!(
            feature.dims(),
            [1, expected_channels[i], expected_sizes[i], expected_sizes[i]],
            "pyramid level {i}"
        );
    }
}

#[test]
fn feature_sizes_match_forward() {
    let cfg = BackboneConfig::default();
    let sizes = cfg.feature_sizes((320, 320));
    assert_eq!(sizes, vec![(20, 20), (10, 10), (5, 5), (3, 3), (2, 2), (2, 2)]);
    assert_eq!(cfg.out_channels(), vec![672, 480, 512, 256, 256, 128]);
}

#[test]
fn detector_output_shapes_match_anchor_grid() {
    let device = Default::default();
    let config = DetectorConfig {
        num_classes: 4,
        image_size: (64, 64),
        ..Default::default()
    };
    let detector = SsdDetector::<TestBackend>::new(config, &device);

    // 64x64 input: pyramid sizes 4, 2, 1, 1, 1, 1 -> 24 locations, 6 anchors each.
    assert_eq!(detector.num_anchors(), 144);

    let input = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
    let (cls_logits, bbox_reg) = detector.forward(input);
    assert_eq!(cls_logits.dims(), [2, 144, 4]);
    assert_eq!(bbox_reg.dims(), [2, 144, 4]);
}

#[test]
fn loss_without_foreground_anchors_has_zero_regression() {
    let device = Default::default();
    let config = DetectorConfig {
        num_classes: 3,
        image_size: (64, 64),
        ..Default::default()
    };
    let detector = SsdDetector::<TestBackend>::new(config, &device);

    let input = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
    let (cls_logits, bbox_reg) = detector.forward(input);

    // Empty mask: every box slot is padding, so nothing matches.
    let gt_boxes = Tensor::<TestBackend, 3>::zeros([1, 4, 4], &device);
    let gt_labels = Tensor::<TestBackend, 2>::zeros([1, 4], &device);
    let gt_mask = Tensor::<TestBackend, 2>::zeros([1, 4], &device);
    let loss = detector.loss(cls_logits, bbox_reg, gt_boxes, gt_labels, gt_mask);

    let box_val = loss.bbox_regression.into_data().to_vec::<f32>().unwrap()[0];
    let cls_val = loss.classification.into_data().to_vec::<f32>().unwrap()[0];
    assert_eq!(box_val, 0.0);
    assert!(cls_val.is_finite() && cls_val >= 0.0);
}

#[test]
fn detect_returns_per_image_results() {
    let device = Default::default();
    let config = DetectorConfig {
        num_classes: 3,
        image_size: (64, 64),
        ..Default::default()
    };
    let detector = SsdDetector::<TestBackend>::new(config.clone(), &device);

    let input = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
    let detections = detector.detect(input);
    assert_eq!(detections.len(), 2);
    for per_image in &detections {
        assert!(per_image.len() <= config.detections_per_img);
        for d in per_image {
            assert!(d.label >= 1 && d.label < config.num_classes);
            assert!(d.score > config.score_thresh);
            assert!(d.bbox.iter().all(|v| (0.0..=1.0).contains(v)));
            // Sorted score-descending within an image.
        }
        for pair in per_image.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
