//! Filesystem dataset: label JSON scanning, validation, and batch collation.
//!
//! Labels live as one JSON file per image under `labels_subdir`; each entry
//! carries a normalized and/or pixel-space box plus a 1-based class id
//! (0 is background).

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("label validation failed at {path:?}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("image decode error at {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionLabel {
    /// Corner-form box in [0, 1] coordinates.
    pub bbox_norm: Option<[f32; 4]>,
    /// Corner-form box in pixels of the source image.
    pub bbox_px: Option<[f32; 4]>,
    /// 1-based class id; 0 is reserved for background.
    pub class_id: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelFile {
    pub image: String,
    pub labels: Vec<DetectionLabel>,
}

impl LabelFile {
    pub fn validate(&self) -> Result<(), String> {
        for (i, label) in self.labels.iter().enumerate() {
            if label.class_id == 0 {
                return Err(format!("label {i}: class_id 0 is reserved for background"));
            }
            let bbox = match (label.bbox_norm, label.bbox_px) {
                (Some(b), _) => b,
                (None, Some(b)) => b,
                (None, None) => return Err(format!("label {i}: no bbox present")),
            };
            if bbox[2] <= bbox[0] || bbox[3] <= bbox[1] {
                return Err(format!("label {i}: bbox has non-positive area"));
            }
            if let Some(norm) = label.bbox_norm {
                if norm.iter().any(|v| !(0.0..=1.0).contains(v)) {
                    return Err(format!("label {i}: bbox_norm outside [0, 1]"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunSample {
    pub image: PathBuf,
    pub labels: Vec<DetectionLabel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetPathConfig {
    pub root: PathBuf,
    pub labels_subdir: String,
    pub images_subdir: String,
}

impl DatasetPathConfig {
    pub fn load(&self) -> DatasetResult<Vec<RunSample>> {
        let labels_dir = self.root.join(&self.labels_subdir);
        let entries = fs::read_dir(&labels_dir).map_err(|source| DatasetError::Io {
            path: labels_dir.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut samples = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(&path).map_err(|source| DatasetError::Io {
                path: path.clone(),
                source,
            })?;
            let file: LabelFile =
                serde_json::from_slice(&bytes).map_err(|source| DatasetError::Json {
                    path: path.clone(),
                    source,
                })?;
            file.validate().map_err(|msg| DatasetError::Validation {
                path: path.clone(),
                msg,
            })?;
            samples.push(RunSample {
                image: self.root.join(&self.images_subdir).join(&file.image),
                labels: file.labels,
            });
        }
        Ok(samples)
    }
}

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Resize every image (stretch) to this (width, height).
    pub image_size: (u32, u32),
    /// Cap on boxes per image; extras are dropped, padding uses zeros with
    /// mask.
    pub max_boxes: usize,
    /// Probability of a horizontal flip applied to image and boxes together.
    pub flip_horizontal_prob: f32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            image_size: (320, 320),
            max_boxes: 32,
            flip_horizontal_prob: 0.0,
        }
    }
}

/// Reject samples whose class ids fall outside the configured class count.
/// `LabelFile::validate` cannot check this; the count is only known to the
/// caller.
pub fn validate_class_ids(samples: &[RunSample], num_classes: usize) -> DatasetResult<()> {
    for sample in samples {
        for (i, label) in sample.labels.iter().enumerate() {
            if label.class_id >= num_classes {
                return Err(DatasetError::Validation {
                    path: sample.image.clone(),
                    msg: format!(
                        "label {i}: class_id {} out of range for {num_classes} classes",
                        label.class_id
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Deterministic shuffle-and-split into train and validation sets.
pub fn split_samples(
    mut samples: Vec<RunSample>,
    val_ratio: f32,
    seed: u64,
) -> (Vec<RunSample>, Vec<RunSample>) {
    use rand::seq::SliceRandom;
    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);
    let val_len = ((samples.len() as f32 * val_ratio).round() as usize).min(samples.len());
    let val = samples.split_off(samples.len() - val_len);
    (samples, val)
}

#[derive(Debug, Clone)]
pub struct CollatedBatch<B: Backend> {
    /// Images in CHW layout, normalized to [-1, 1] (mean 0.5, std 0.5).
    pub images: Tensor<B, 4>,
    /// Normalized boxes per sample (shape: [batch, max_boxes, 4]).
    pub boxes: Tensor<B, 3>,
    /// Class ids per box slot (shape: [batch, max_boxes]).
    pub labels: Tensor<B, 2>,
    /// Mask indicating which box slots are populated (shape: [batch, max_boxes]).
    pub box_mask: Tensor<B, 2>,
}

pub fn collate<B: Backend>(
    samples: &[RunSample],
    cfg: &DatasetConfig,
    rng: &mut StdRng,
    device: &B::Device,
) -> DatasetResult<CollatedBatch<B>> {
    if samples.is_empty() {
        return Err(DatasetError::Other("cannot collate empty batch".into()));
    }
    let (width, height) = cfg.image_size;
    let batch = samples.len();
    let max_boxes = cfg.max_boxes.max(1);
    let pixels = (width * height) as usize;

    let mut image_buf: Vec<f32> = Vec::with_capacity(batch * 3 * pixels);
    let mut boxes_buf = vec![0.0f32; batch * max_boxes * 4];
    let mut labels_buf = vec![0.0f32; batch * max_boxes];
    let mut mask_buf = vec![0.0f32; batch * max_boxes];

    for (b, sample) in samples.iter().enumerate() {
        let img = image::open(&sample.image).map_err(|source| DatasetError::Image {
            path: sample.image.clone(),
            source,
        })?;
        let mut rgb = img.to_rgb8();
        let (orig_w, orig_h) = rgb.dimensions();

        let mut boxes: Vec<([f32; 4], usize)> = Vec::new();
        for label in &sample.labels {
            let bbox = if let Some(norm) = label.bbox_norm {
                norm
            } else if let Some(px) = label.bbox_px {
                [
                    px[0] / orig_w as f32,
                    px[1] / orig_h as f32,
                    px[2] / orig_w as f32,
                    px[3] / orig_h as f32,
                ]
            } else {
                continue;
            };
            boxes.push((bbox, label.class_id));
            if boxes.len() >= max_boxes {
                break;
            }
        }

        if cfg.flip_horizontal_prob > 0.0 && rng.random::<f32>() < cfg.flip_horizontal_prob {
            rgb = image::imageops::flip_horizontal(&rgb);
            for (bbox, _) in boxes.iter_mut() {
                let (x0, x1) = (1.0 - bbox[2], 1.0 - bbox[0]);
                bbox[0] = x0;
                bbox[2] = x1;
            }
        }

        let resized = image::imageops::resize(&rgb, width, height, FilterType::Triangle);
        for c in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let v = resized.get_pixel(x, y)[c] as f32 / 255.0;
                    image_buf.push((v - 0.5) / 0.5);
                }
            }
        }

        for (i, (bbox, class_id)) in boxes.iter().enumerate() {
            let base = (b * max_boxes + i) * 4;
            boxes_buf[base..base + 4].copy_from_slice(bbox);
            labels_buf[b * max_boxes + i] = *class_id as f32;
            mask_buf[b * max_boxes + i] = 1.0;
        }
    }

    let images = Tensor::<B, 4>::from_data(
        TensorData::new(image_buf, [batch, 3, height as usize, width as usize]),
        device,
    );
    let boxes = Tensor::<B, 3>::from_data(TensorData::new(boxes_buf, [batch, max_boxes, 4]), device);
    let labels = Tensor::<B, 2>::from_data(TensorData::new(labels_buf, [batch, max_boxes]), device);
    let box_mask = Tensor::<B, 2>::from_data(TensorData::new(mask_buf, [batch, max_boxes]), device);

    Ok(CollatedBatch {
        images,
        boxes,
        labels,
        box_mask,
    })
}
