use models::{iou_xyxy, nms, BoxCoder};

#[test]
fn iou_of_identical_boxes_is_one() {
    let b = [0.2, 0.2, 0.6, 0.6];
    assert!((iou_xyxy(b, b) - 1.0).abs() < 1e-6);
}

#[test]
fn iou_of_disjoint_boxes_is_zero() {
    assert_eq!(iou_xyxy([0.0, 0.0, 0.2, 0.2], [0.5, 0.5, 0.9, 0.9]), 0.0);
}

#[test]
fn encode_decode_roundtrip() {
    let coder = BoxCoder::default();
    let anchor = [0.25, 0.25, 0.75, 0.75];
    let gt = [0.3, 0.2, 0.7, 0.65];
    let decoded = coder.decode(coder.encode(gt, anchor), anchor);
    for (d, g) in decoded.iter().zip(&gt) {
        assert!((d - g).abs() < 1e-4, "decoded {d} vs {g}");
    }
}

#[test]
fn encode_of_anchor_itself_is_zero() {
    let coder = BoxCoder::default();
    let anchor = [0.1, 0.1, 0.5, 0.7];
    let encoded = coder.encode(anchor, anchor);
    for v in encoded {
        assert!(v.abs() < 1e-5);
    }
}

#[test]
fn decode_output_stays_in_unit_square() {
    let coder = BoxCoder::default();
    let anchor = [0.0, 0.0, 0.3, 0.3];
    let decoded = coder.decode([50.0, 50.0, 50.0, 50.0], anchor);
    assert!(decoded.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn nms_suppresses_overlaps_and_keeps_disjoint() {
    let boxes = [
        [0.1, 0.1, 0.4, 0.4],
        [0.12, 0.1, 0.42, 0.4], // heavy overlap with the first, lower score
        [0.6, 0.6, 0.9, 0.9],
    ];
    let scores = [0.9, 0.8, 0.7];
    let keep = nms(&boxes, &scores, 0.5);
    assert_eq!(keep, vec![0, 2]);
}

#[test]
fn nms_keeps_highest_score_first() {
    let boxes = [[0.1, 0.1, 0.4, 0.4], [0.6, 0.6, 0.9, 0.9]];
    let scores = [0.2, 0.9];
    let keep = nms(&boxes, &scores, 0.5);
    assert_eq!(keep, vec![1, 0]);
}
