//! Host-side box math: IoU, center-offset coding, and greedy NMS.

/// Intersection-over-union of two corner-form boxes.
pub fn iou_xyxy(a: [f32; 4], b: [f32; 4]) -> f32 {
    let inter_x0 = a[0].max(b[0]);
    let inter_y0 = a[1].max(b[1]);
    let inter_x1 = a[2].min(b[2]);
    let inter_y1 = a[3].min(b[3]);

    let inter_w = (inter_x1 - inter_x0).max(0.0);
    let inter_h = (inter_y1 - inter_y0).max(0.0);
    let inter = inter_w * inter_h;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let denom = area_a + area_b - inter;
    if denom <= 0.0 {
        0.0
    } else {
        inter / denom
    }
}

/// Center-offset box coder with per-coordinate weights.
#[derive(Debug, Clone, Copy)]
pub struct BoxCoder {
    pub weights: [f32; 4],
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self {
            weights: [10.0, 10.0, 5.0, 5.0],
        }
    }
}

// Largest permitted w/h exponent when decoding.
const SCALE_CLAMP: f32 = 4.135_166_6; // ln(1000 / 16)

fn to_cxcywh(b: [f32; 4]) -> (f32, f32, f32, f32) {
    let w = (b[2] - b[0]).max(1e-6);
    let h = (b[3] - b[1]).max(1e-6);
    ((b[0] + b[2]) * 0.5, (b[1] + b[3]) * 0.5, w, h)
}

impl BoxCoder {
    /// Regression target for a ground-truth box relative to an anchor.
    pub fn encode(&self, gt: [f32; 4], anchor: [f32; 4]) -> [f32; 4] {
        let (gcx, gcy, gw, gh) = to_cxcywh(gt);
        let (acx, acy, aw, ah) = to_cxcywh(anchor);
        [
            self.weights[0] * (gcx - acx) / aw,
            self.weights[1] * (gcy - acy) / ah,
            self.weights[2] * (gw / aw).ln(),
            self.weights[3] * (gh / ah).ln(),
        ]
    }

    /// Decode a regression output against its anchor, clamped to [0, 1].
    pub fn decode(&self, reg: [f32; 4], anchor: [f32; 4]) -> [f32; 4] {
        let (acx, acy, aw, ah) = to_cxcywh(anchor);
        let dx = reg[0] / self.weights[0];
        let dy = reg[1] / self.weights[1];
        let dw = (reg[2] / self.weights[2]).min(SCALE_CLAMP);
        let dh = (reg[3] / self.weights[3]).min(SCALE_CLAMP);

        let cx = acx + dx * aw;
        let cy = acy + dy * ah;
        let w = dw.exp() * aw;
        let h = dh.exp() * ah;

        [
            (cx - w * 0.5).clamp(0.0, 1.0),
            (cy - h * 0.5).clamp(0.0, 1.0),
            (cx + w * 0.5).clamp(0.0, 1.0),
            (cy + h * 0.5).clamp(0.0, 1.0),
        ]
    }
}

/// Greedy NMS; returns kept indices in score-descending order.
pub fn nms(boxes: &[[f32; 4]], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|a, b| {
        scores[*b]
            .partial_cmp(&scores[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    while !order.is_empty() {
        let i = order.remove(0);
        keep.push(i);
        order.retain(|&j| iou_xyxy(boxes[i], boxes[j]) <= iou_thresh);
    }
    keep
}
