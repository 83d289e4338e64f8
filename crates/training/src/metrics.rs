//! Mean-average-precision accumulator with a reset/add/value lifecycle.
//!
//! Predictions and ground truth are added per image; `value` recomputes AP
//! at the requested IoU threshold from everything accumulated since the last
//! `reset`.

use models::{iou_xyxy, Detection};

#[derive(Debug, Clone, Copy)]
pub struct GroundTruth {
    pub bbox: [f32; 4],
    pub label: usize,
}

#[derive(Debug, Clone, Default)]
struct FrameRecord {
    preds: Vec<Detection>,
    gts: Vec<GroundTruth>,
}

#[derive(Debug, Clone)]
pub struct MapReport {
    /// AP per foreground class (index 0 is class id 1); `None` when the
    /// class has no ground truth.
    pub per_class: Vec<Option<f32>>,
    pub mean: f32,
}

#[derive(Debug, Clone)]
pub struct MeanAveragePrecision {
    /// Class count including background; classes 1..num_classes are scored.
    num_classes: usize,
    frames: Vec<FrameRecord>,
}

impl MeanAveragePrecision {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            frames: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.frames.clear();
    }

    pub fn add(&mut self, preds: &[Detection], gts: &[GroundTruth]) {
        self.frames.push(FrameRecord {
            preds: preds.to_vec(),
            gts: gts.to_vec(),
        });
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn value(&self, iou_thresh: f32) -> MapReport {
        let mut per_class = Vec::with_capacity(self.num_classes.saturating_sub(1));
        for class in 1..self.num_classes {
            per_class.push(self.average_precision(class, iou_thresh));
        }
        let scored: Vec<f32> = per_class.iter().filter_map(|ap| *ap).collect();
        let mean = if scored.is_empty() {
            0.0
        } else {
            scored.iter().sum::<f32>() / scored.len() as f32
        };
        MapReport { per_class, mean }
    }

    fn average_precision(&self, class: usize, iou_thresh: f32) -> Option<f32> {
        let total_gt: usize = self
            .frames
            .iter()
            .map(|f| f.gts.iter().filter(|g| g.label == class).count())
            .sum();
        if total_gt == 0 {
            return None;
        }

        // Pool predictions across frames, score-descending.
        let mut preds: Vec<(f32, usize, [f32; 4])> = Vec::new();
        for (frame, record) in self.frames.iter().enumerate() {
            for p in record.preds.iter().filter(|p| p.label == class) {
                preds.push((p.score, frame, p.bbox));
            }
        }
        preds.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut matched: Vec<Vec<bool>> = self
            .frames
            .iter()
            .map(|f| vec![false; f.gts.len()])
            .collect();

        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut precisions = Vec::with_capacity(preds.len());
        let mut recalls = Vec::with_capacity(preds.len());
        for (_, frame, bbox) in preds {
            let gts = &self.frames[frame].gts;
            let mut best_iou = 0.0f32;
            let mut best_g = None;
            for (g, gt) in gts.iter().enumerate() {
                if gt.label != class || matched[frame][g] {
                    continue;
                }
                let iou = iou_xyxy(bbox, gt.bbox);
                if iou > best_iou {
                    best_iou = iou;
                    best_g = Some(g);
                }
            }
            match best_g {
                Some(g) if best_iou >= iou_thresh => {
                    matched[frame][g] = true;
                    tp += 1;
                }
                _ => fp += 1,
            }
            precisions.push(tp as f32 / (tp + fp) as f32);
            recalls.push(tp as f32 / total_gt as f32);
        }

        if precisions.is_empty() {
            return Some(0.0);
        }

        // All-points interpolation: monotone precision envelope, then the
        // area under the precision-recall steps.
        for i in (0..precisions.len() - 1).rev() {
            precisions[i] = precisions[i].max(precisions[i + 1]);
        }
        let mut ap = 0.0f32;
        let mut prev_recall = 0.0f32;
        for (p, r) in precisions.iter().zip(&recalls) {
            ap += (r - prev_recall) * p;
            prev_recall = *r;
        }
        Some(ap)
    }
}
