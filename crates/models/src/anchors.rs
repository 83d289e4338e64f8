//! Default-box generation for the single-shot head.
//!
//! Scales are linearly interpolated between `min_ratio` and `max_ratio`
//! across pyramid levels, with a terminal scale of 1.0. Per location a level
//! contributes the square at its scale, the square at the geometric mean of
//! neighbouring scales, and a stretched pair per aspect ratio.

#[derive(Debug, Clone)]
pub struct AnchorConfig {
    /// One aspect-ratio list per pyramid level.
    pub aspect_ratios: Vec<Vec<f32>>,
    pub min_ratio: f32,
    pub max_ratio: f32,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            aspect_ratios: vec![vec![2.0, 3.0]; 6],
            min_ratio: 0.2,
            max_ratio: 0.95,
        }
    }
}

impl AnchorConfig {
    pub fn num_levels(&self) -> usize {
        self.aspect_ratios.len()
    }

    /// Anchors per feature-map location, per level.
    pub fn anchors_per_location(&self) -> Vec<usize> {
        self.aspect_ratios.iter().map(|r| 2 + 2 * r.len()).collect()
    }

    /// Per-level scales plus the terminal 1.0.
    pub fn scales(&self) -> Vec<f32> {
        let m = self.num_levels();
        let mut scales = Vec::with_capacity(m + 1);
        if m == 1 {
            scales.push(self.min_ratio);
        } else {
            let step = (self.max_ratio - self.min_ratio) / (m - 1) as f32;
            for k in 0..m {
                scales.push(self.min_ratio + step * k as f32);
            }
        }
        scales.push(1.0);
        scales
    }

    /// Width/height pairs for one level, in normalized units.
    fn wh_pairs(&self, level: usize) -> Vec<(f32, f32)> {
        let scales = self.scales();
        let s_k = scales[level];
        let s_next = scales[level + 1];
        let s_prime = (s_k * s_next).sqrt();

        let mut pairs = vec![(s_k, s_k), (s_prime, s_prime)];
        for &ratio in &self.aspect_ratios[level] {
            let sq = ratio.sqrt();
            pairs.push((s_k * sq, s_k / sq));
            pairs.push((s_k / sq, s_k * sq));
        }
        pairs
    }

    /// All default boxes for the given feature-map sizes, corner-form and
    /// clipped to [0, 1]. Layout is level-major, row-major within a level,
    /// anchor-minor, matching the head's flattened prediction order.
    pub fn generate(&self, feature_sizes: &[(usize, usize)]) -> Vec<[f32; 4]> {
        assert_eq!(
            feature_sizes.len(),
            self.num_levels(),
            "one aspect-ratio list is required per pyramid level"
        );

        let mut anchors = Vec::new();
        for (level, &(f_h, f_w)) in feature_sizes.iter().enumerate() {
            let pairs = self.wh_pairs(level);
            for y in 0..f_h {
                for x in 0..f_w {
                    let cx = (x as f32 + 0.5) / f_w as f32;
                    let cy = (y as f32 + 0.5) / f_h as f32;
                    for &(w, h) in &pairs {
                        anchors.push([
                            (cx - w * 0.5).clamp(0.0, 1.0),
                            (cy - h * 0.5).clamp(0.0, 1.0),
                            (cx + w * 0.5).clamp(0.0, 1.0),
                            (cy + h * 0.5).clamp(0.0, 1.0),
                        ]);
                    }
                }
            }
        }
        anchors
    }
}
