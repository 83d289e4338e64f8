//! The composed single-shot detector: backbone, head, anchor grid, matching
//! loss, and post-processing.
//!
//! Training mode mirrors the two-term loss surface (`classification` +
//! `bbox_regression`); eval mode decodes, thresholds, and NMS-filters the raw
//! head outputs into per-image detections.

use burn::module::{Ignored, Module};
use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::{backend::Backend, Tensor};

use crate::anchors::AnchorConfig;
use crate::backbone::{Backbone, BackboneConfig, Trunk};
use crate::boxes::{iou_xyxy, nms, BoxCoder};
use crate::head::Head;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Class count including background at index 0.
    pub num_classes: usize,
    pub image_size: (usize, usize),
    pub score_thresh: f32,
    pub nms_thresh: f32,
    pub detections_per_img: usize,
    pub topk_candidates: usize,
    /// Anchors below this IoU against every ground truth stay background.
    pub iou_match_thresh: f32,
    /// Hard-negative mining ratio (negatives per foreground anchor).
    pub negative_ratio: f32,
    pub backbone: BackboneConfig,
    pub anchors: AnchorConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            num_classes: 21,
            image_size: (320, 320),
            score_thresh: 0.001,
            nms_thresh: 0.55,
            detections_per_img: 300,
            topk_candidates: 300,
            iou_match_thresh: 0.5,
            negative_ratio: 3.0,
            backbone: BackboneConfig::default(),
            anchors: AnchorConfig::default(),
        }
    }
}

/// One decoded detection in normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub label: usize,
    pub score: f32,
}

/// The two loss terms reported separately before summation.
#[derive(Debug, Clone)]
pub struct DetectionLoss<B: Backend> {
    pub classification: Tensor<B, 1>,
    pub bbox_regression: Tensor<B, 1>,
}

impl<B: Backend> DetectionLoss<B> {
    pub fn total(&self) -> Tensor<B, 1> {
        self.classification.clone() + self.bbox_regression.clone()
    }
}

#[derive(Module, Debug)]
pub struct SsdDetector<B: Backend> {
    backbone: Backbone<B>,
    head: Head<B>,
    pub config: Ignored<DetectorConfig>,
    anchors: Ignored<Vec<[f32; 4]>>,
}

impl<B: Backend> SsdDetector<B> {
    pub fn new(config: DetectorConfig, device: &B::Device) -> Self {
        let out_channels = config.backbone.out_channels();
        let anchors_per_location = config.anchors.anchors_per_location();
        assert_eq!(
            out_channels.len(),
            anchors_per_location.len(),
            "backbone pyramid depth must match the anchor layout"
        );

        let backbone = Backbone::new(&config.backbone, device);
        let head = Head::new(
            &out_channels,
            &anchors_per_location,
            config.num_classes,
            device,
        );
        let feature_sizes = config.backbone.feature_sizes(config.image_size);
        let anchors = config.anchors.generate(&feature_sizes);

        Self {
            backbone,
            head,
            config: Ignored(config),
            anchors: Ignored(anchors),
        }
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.0.len()
    }

    /// Swap in a trunk restored from a pretraining checkpoint.
    pub fn with_trunk(mut self, trunk: Trunk<B>) -> Self {
        self.backbone = self.backbone.with_trunk(trunk);
        self
    }

    /// Detach trunk parameters from gradient tracking.
    pub fn freeze_trunk(mut self) -> Self {
        let trunk = self.backbone.trunk.clone().no_grad();
        self.backbone = self.backbone.with_trunk(trunk);
        self
    }

    /// Raw head outputs: class logits `[B, N, C]` and box regression
    /// `[B, N, 4]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let features = self.backbone.forward(images);
        self.head.forward(&features)
    }

    /// Matching loss over a batch: smooth-L1 on encoded offsets of matched
    /// anchors plus hard-negative-mined cross-entropy, both normalized by
    /// the foreground anchor count.
    pub fn loss(
        &self,
        cls_logits: Tensor<B, 3>,
        bbox_reg: Tensor<B, 3>,
        gt_boxes: Tensor<B, 3>,
        gt_labels: Tensor<B, 2>,
        gt_mask: Tensor<B, 2>,
    ) -> DetectionLoss<B> {
        let device = cls_logits.device();
        let [batch, num_anchors, num_classes] = cls_logits.dims();
        let ground_truth = collect_ground_truth(&gt_boxes, &gt_labels, &gt_mask);
        let coder = BoxCoder::default();
        let anchors = &self.anchors.0;

        let mut one_hot = vec![0.0f32; batch * num_anchors * num_classes];
        let mut reg_targets = vec![0.0f32; batch * num_anchors * 4];
        let mut fg_mask = vec![0.0f32; batch * num_anchors * 4];
        let mut assignments = Vec::with_capacity(batch);
        let mut total_fg = 0usize;

        for (b, gts) in ground_truth.iter().enumerate() {
            let assignment = match_anchors(anchors, gts, self.config.0.iou_match_thresh);
            for (n, matched) in assignment.iter().enumerate() {
                let cls_base = (b * num_anchors + n) * num_classes;
                match matched {
                    Some(g) => {
                        let (gt_box, label) = gts[*g];
                        one_hot[cls_base + label.min(num_classes - 1)] = 1.0;
                        let encoded = coder.encode(gt_box, anchors[n]);
                        let reg_base = (b * num_anchors + n) * 4;
                        reg_targets[reg_base..reg_base + 4].copy_from_slice(&encoded);
                        fg_mask[reg_base..reg_base + 4].copy_from_slice(&[1.0; 4]);
                        total_fg += 1;
                    }
                    None => one_hot[cls_base] = 1.0,
                }
            }
            assignments.push(assignment);
        }

        let one_hot = Tensor::<B, 1>::from_floats(one_hot.as_slice(), &device).reshape([
            batch,
            num_anchors,
            num_classes,
        ]);
        let log_probs = log_softmax(cls_logits, 2);
        let ce: Tensor<B, 2> = (log_probs * one_hot)
            .sum_dim(2)
            .neg()
            .reshape([batch, num_anchors]);

        // Negatives ranked by their own (detached) loss, kept at the
        // configured ratio against the per-image foreground count.
        let ce_host = host_values(ce.clone().detach());
        let mut weights = vec![0.0f32; batch * num_anchors];
        for (b, assignment) in assignments.iter().enumerate() {
            let mut fg_count = 0usize;
            let mut negatives: Vec<(f32, usize)> = Vec::new();
            for (n, matched) in assignment.iter().enumerate() {
                let idx = b * num_anchors + n;
                if matched.is_some() {
                    weights[idx] = 1.0;
                    fg_count += 1;
                } else {
                    negatives.push((ce_host[idx], n));
                }
            }
            negatives.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            let keep = (self.config.0.negative_ratio * fg_count as f32).ceil() as usize;
            for &(_, n) in negatives.iter().take(keep) {
                weights[b * num_anchors + n] = 1.0;
            }
        }
        let weights =
            Tensor::<B, 1>::from_floats(weights.as_slice(), &device).reshape([batch, num_anchors]);

        let norm = total_fg.max(1) as f32;
        let classification = (ce * weights).sum().div_scalar(norm);

        let reg_targets = Tensor::<B, 1>::from_floats(reg_targets.as_slice(), &device).reshape([
            batch,
            num_anchors,
            4,
        ]);
        let fg_mask =
            Tensor::<B, 1>::from_floats(fg_mask.as_slice(), &device).reshape([batch, num_anchors, 4]);

        // Smooth L1 on the masked offsets.
        let diff = (bbox_reg - reg_targets) * fg_mask;
        let abs = diff.abs();
        let small_mask = abs.clone().lower_elem(1.0).float();
        let small = (abs.clone() * abs.clone()).mul_scalar(0.5);
        let large = abs.sub_scalar(0.5);
        let per_elem =
            small * small_mask.clone() + large * (small_mask.ones_like() - small_mask);
        let bbox_regression = per_elem.sum().div_scalar(norm);

        DetectionLoss {
            classification,
            bbox_regression,
        }
    }

    /// Eval mode: decode, threshold, and NMS-filter into per-image
    /// detections sorted by score.
    pub fn detect(&self, images: Tensor<B, 4>) -> Vec<Vec<Detection>> {
        let (cls_logits, bbox_reg) = self.forward(images);
        self.postprocess(cls_logits, bbox_reg)
    }

    pub fn postprocess(
        &self,
        cls_logits: Tensor<B, 3>,
        bbox_reg: Tensor<B, 3>,
    ) -> Vec<Vec<Detection>> {
        let cfg = &self.config.0;
        let [batch, num_anchors, num_classes] = cls_logits.dims();
        let coder = BoxCoder::default();
        let anchors = &self.anchors.0;

        let probs = host_values(softmax(cls_logits, 2));
        let regs = host_values(bbox_reg);

        let mut results = Vec::with_capacity(batch);
        for b in 0..batch {
            let mut detections: Vec<Detection> = Vec::new();
            for class in 1..num_classes {
                let mut candidates: Vec<(f32, usize)> = (0..num_anchors)
                    .filter_map(|n| {
                        let score = probs[(b * num_anchors + n) * num_classes + class];
                        (score > cfg.score_thresh).then_some((score, n))
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
                });
                candidates.truncate(cfg.topk_candidates);

                let boxes: Vec<[f32; 4]> = candidates
                    .iter()
                    .map(|&(_, n)| {
                        let base = (b * num_anchors + n) * 4;
                        let reg = [regs[base], regs[base + 1], regs[base + 2], regs[base + 3]];
                        coder.decode(reg, anchors[n])
                    })
                    .collect();
                let scores: Vec<f32> = candidates.iter().map(|&(s, _)| s).collect();

                for keep in nms(&boxes, &scores, cfg.nms_thresh) {
                    detections.push(Detection {
                        bbox: boxes[keep],
                        label: class,
                        score: scores[keep],
                    });
                }
            }
            detections.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            detections.truncate(cfg.detections_per_img);
            results.push(detections);
        }
        results
    }
}

/// Tensor values on the host. `to_vec` only fails on a dtype mismatch, which
/// the preceding `convert` rules out.
fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    match tensor.into_data().convert::<f32>().to_vec::<f32>() {
        Ok(values) => values,
        Err(err) => panic!("tensor values not f32 after conversion: {err:?}"),
    }
}

/// Per-anchor assignment: best ground truth above the IoU threshold, with
/// every ground truth force-assigned to its own best anchor.
fn match_anchors(
    anchors: &[[f32; 4]],
    gts: &[([f32; 4], usize)],
    iou_thresh: f32,
) -> Vec<Option<usize>> {
    let mut assignment = vec![None; anchors.len()];
    if gts.is_empty() {
        return assignment;
    }

    let mut best_anchor_for_gt = vec![(0usize, -1.0f32); gts.len()];
    for (n, anchor) in anchors.iter().enumerate() {
        let mut best_iou = -1.0f32;
        let mut best_gt = 0usize;
        for (g, (gt_box, _)) in gts.iter().enumerate() {
            let iou = iou_xyxy(*anchor, *gt_box);
            if iou > best_iou {
                best_iou = iou;
                best_gt = g;
            }
            if iou > best_anchor_for_gt[g].1 {
                best_anchor_for_gt[g] = (n, iou);
            }
        }
        if best_iou >= iou_thresh {
            assignment[n] = Some(best_gt);
        }
    }
    for (g, &(n, iou)) in best_anchor_for_gt.iter().enumerate() {
        if iou > 0.0 {
            assignment[n] = Some(g);
        }
    }
    assignment
}

/// Extract per-image (box, label) ground truth from batch tensors.
pub fn collect_ground_truth<B: Backend>(
    gt_boxes: &Tensor<B, 3>,
    gt_labels: &Tensor<B, 2>,
    gt_mask: &Tensor<B, 2>,
) -> Vec<Vec<([f32; 4], usize)>> {
    let [batch, max_boxes, _] = gt_boxes.dims();
    let boxes = host_values(gt_boxes.clone());
    let labels = host_values(gt_labels.clone());
    let mask = host_values(gt_mask.clone());

    let mut per_img = Vec::with_capacity(batch);
    for b in 0..batch {
        let mut gts = Vec::new();
        for g in 0..max_boxes {
            let idx = b * max_boxes + g;
            if mask[idx] <= 0.0 {
                continue;
            }
            let base = idx * 4;
            gts.push((
                [
                    boxes[base].clamp(0.0, 1.0),
                    boxes[base + 1].clamp(0.0, 1.0),
                    boxes[base + 2].clamp(0.0, 1.0),
                    boxes[base + 3].clamp(0.0, 1.0),
                ],
                labels[idx] as usize,
            ));
        }
        per_img.push(gts);
    }
    per_img
}
