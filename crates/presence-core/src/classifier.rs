//! LBPH (Local Binary Patterns Histograms) identity classifier.
//!
//! The model file is produced by an external training step: a JSON document
//! with the LBP parameters, the face resolution it was trained at, and one
//! spatial histogram per training image. Prediction is nearest-neighbour
//! under the chi-square distance, so distances live on roughly the same
//! scale as the classic OpenCV recognizer (0 = identical).

use crate::types::{EmployeeId, Prediction};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_FACE_SIZE: u32 = 200;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier not trained yet ({0}); train the model first")]
    ModelNotTrained(String),
    #[error("failed to read model: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed model file: {0}")]
    Malformed(String),
    #[error("face crop is {actual_w}x{actual_h}, model expects {expected_w}x{expected_h}")]
    InputSize {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

/// Domain interface for identity classification of a normalized face crop.
pub trait IdentityClassifier {
    /// The (width, height) every crop must be resized to before `predict`.
    fn input_size(&self) -> (u32, u32);

    fn predict(&self, crop: &GrayImage) -> Result<Prediction, ClassifierError>;
}

impl<T: IdentityClassifier + ?Sized> IdentityClassifier for &T {
    fn input_size(&self) -> (u32, u32) {
        (**self).input_size()
    }

    fn predict(&self, crop: &GrayImage) -> Result<Prediction, ClassifierError> {
        (**self).predict(crop)
    }
}

/// LBP operator and spatial grid parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Concatenated per-cell LBP histograms of `image`, each cell normalized
    /// by its pixel count.
    pub fn histogram(&self, image: &GrayImage) -> Vec<f32> {
        let codes = lbp_codes(image, self.radius, self.neighbors);
        let code_w = image.width().saturating_sub(2 * self.radius) as usize;
        let code_h = image.height().saturating_sub(2 * self.radius) as usize;
        let bins = self.bins();
        let gx = self.grid_x.max(1) as usize;
        let gy = self.grid_y.max(1) as usize;
        let mut hist = vec![0f32; gx * gy * bins];

        let cell_w = code_w / gx;
        let cell_h = code_h / gy;
        if cell_w == 0 || cell_h == 0 {
            return hist;
        }

        for row in 0..gy {
            for col in 0..gx {
                let base = (row * gx + col) * bins;
                for y in row * cell_h..(row + 1) * cell_h {
                    for x in col * cell_w..(col + 1) * cell_w {
                        hist[base + codes[y * code_w + x] as usize] += 1.0;
                    }
                }
                let total = (cell_w * cell_h) as f32;
                for v in &mut hist[base..base + bins] {
                    *v /= total;
                }
            }
        }

        hist
    }
}

/// Circular LBP codes with bilinear sampling; output excludes a `radius` border.
fn lbp_codes(image: &GrayImage, radius: u32, neighbors: u32) -> Vec<u32> {
    let w = image.width() as i64;
    let h = image.height() as i64;
    let r = radius as i64;
    if w <= 2 * r || h <= 2 * r || neighbors == 0 {
        return Vec::new();
    }
    let out_w = (w - 2 * r) as usize;
    let out_h = (h - 2 * r) as usize;
    let mut codes = vec![0u32; out_w * out_h];
    let px = |x: i64, y: i64| image.get_pixel(x as u32, y as u32)[0] as f32;

    for n in 0..neighbors {
        let angle = 2.0 * std::f32::consts::PI * n as f32 / neighbors as f32;
        let sx = radius as f32 * angle.cos();
        let sy = -(radius as f32) * angle.sin();
        let fx = sx.floor() as i64;
        let fy = sy.floor() as i64;
        let cx = sx.ceil() as i64;
        let cy = sy.ceil() as i64;
        let tx = sx - fx as f32;
        let ty = sy - fy as f32;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for y in r..h - r {
            for x in r..w - r {
                let sample = w1 * px(x + fx, y + fy)
                    + w2 * px(x + cx, y + fy)
                    + w3 * px(x + fx, y + cy)
                    + w4 * px(x + cx, y + cy);
                let center = px(x, y);
                if sample >= center - 1e-3 {
                    let idx = (y - r) as usize * out_w + (x - r) as usize;
                    codes[idx] |= 1 << n;
                }
            }
        }
    }

    codes
}

/// Chi-square distance, alternative (symmetric) form.
pub fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let sum = (x + y) as f64;
            if sum > 0.0 {
                let diff = (x - y) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

/// One enrolled training histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphSample {
    pub label: EmployeeId,
    pub histogram: Vec<f32>,
}

/// Serialized LBPH model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    pub params: LbphParams,
    pub face_width: u32,
    pub face_height: u32,
    pub samples: Vec<LbphSample>,
}

impl LbphModel {
    pub fn new(params: LbphParams, face_width: u32, face_height: u32) -> Self {
        Self {
            params,
            face_width,
            face_height,
            samples: Vec::new(),
        }
    }

    pub fn add_sample(&mut self, label: EmployeeId, histogram: Vec<f32>) {
        self.samples.push(LbphSample { label, histogram });
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        if self.params.neighbors == 0 || self.params.neighbors > 16 {
            return Err(ClassifierError::Malformed(format!(
                "neighbors must be in 1..=16, got {}",
                self.params.neighbors
            )));
        }
        if self.face_width == 0 || self.face_height == 0 {
            return Err(ClassifierError::Malformed("zero face resolution".into()));
        }
        let expected =
            (self.params.grid_x.max(1) * self.params.grid_y.max(1)) as usize * self.params.bins();
        if let Some(bad) = self.samples.iter().find(|s| s.histogram.len() != expected) {
            return Err(ClassifierError::Malformed(format!(
                "sample for label {} has {} bins, expected {expected}",
                bad.label,
                bad.histogram.len()
            )));
        }
        Ok(())
    }
}

/// Nearest-neighbour LBPH classifier over a loaded [`LbphModel`].
pub struct LbphClassifier {
    model: LbphModel,
}

impl LbphClassifier {
    /// Load a trained model from disk.
    ///
    /// A missing file or a model without samples is `ModelNotTrained`.
    pub fn load(model_path: &Path) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotTrained(model_path.display().to_string()));
        }
        let raw = std::fs::read_to_string(model_path)?;
        let model: LbphModel =
            serde_json::from_str(&raw).map_err(|e| ClassifierError::Malformed(e.to_string()))?;
        let classifier = Self::from_model(model)
            .map_err(|e| match e {
                ClassifierError::ModelNotTrained(_) => {
                    ClassifierError::ModelNotTrained(model_path.display().to_string())
                }
                other => other,
            })?;

        tracing::info!(
            path = %model_path.display(),
            samples = classifier.model.samples.len(),
            face_width = classifier.model.face_width,
            face_height = classifier.model.face_height,
            "loaded LBPH model"
        );
        Ok(classifier)
    }

    pub fn from_model(model: LbphModel) -> Result<Self, ClassifierError> {
        model.validate()?;
        if model.samples.is_empty() {
            return Err(ClassifierError::ModelNotTrained("model has no samples".into()));
        }
        Ok(Self { model })
    }

    pub fn sample_count(&self) -> usize {
        self.model.samples.len()
    }
}

impl IdentityClassifier for LbphClassifier {
    fn input_size(&self) -> (u32, u32) {
        (self.model.face_width, self.model.face_height)
    }

    fn predict(&self, crop: &GrayImage) -> Result<Prediction, ClassifierError> {
        let (expected_w, expected_h) = self.input_size();
        if crop.dimensions() != (expected_w, expected_h) {
            return Err(ClassifierError::InputSize {
                expected_w,
                expected_h,
                actual_w: crop.width(),
                actual_h: crop.height(),
            });
        }

        let query = self.model.params.histogram(crop);
        let mut best: Option<Prediction> = None;
        for sample in &self.model.samples {
            let distance = chi_square(&sample.histogram, &query);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    label: sample.label,
                    distance,
                });
            }
        }

        best.ok_or_else(|| ClassifierError::ModelNotTrained("model has no samples".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u32 = 48;

    fn stripes(period: u32) -> GrayImage {
        GrayImage::from_fn(SIZE, SIZE, |x, y| image::Luma([if (x / period + y / 7) % 2 == 0 { 40 } else { 210 }]))
    }

    fn checker(cell: u32) -> GrayImage {
        GrayImage::from_fn(SIZE, SIZE, |x, y| image::Luma([if (x / cell + y / cell) % 2 == 0 { 20 } else { 230 }]))
    }

    fn params() -> LbphParams {
        LbphParams { radius: 1, neighbors: 8, grid_x: 4, grid_y: 4 }
    }

    fn trained() -> LbphClassifier {
        let p = params();
        let mut model = LbphModel::new(p, SIZE, SIZE);
        model.add_sample(EmployeeId(101), p.histogram(&stripes(3)));
        model.add_sample(EmployeeId(102), p.histogram(&checker(5)));
        LbphClassifier::from_model(model).unwrap()
    }

    #[test]
    fn test_histogram_cells_are_normalized() {
        let p = params();
        let hist = p.histogram(&stripes(3));
        assert_eq!(hist.len(), 16 * 256);
        for cell in hist.chunks(256) {
            let sum: f32 = cell.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "cell sums to {sum}");
        }
    }

    #[test]
    fn test_uniform_image_has_single_code() {
        let img = GrayImage::from_pixel(10, 10, image::Luma([128]));
        let codes = lbp_codes(&img, 1, 8);
        assert_eq!(codes.len(), 64);
        assert!(codes.iter().all(|&c| c == 0xFF));
    }

    #[test]
    fn test_chi_square_identity_and_symmetry() {
        let a = vec![0.5, 0.25, 0.25, 0.0];
        let b = vec![0.25, 0.25, 0.0, 0.5];
        assert_eq!(chi_square(&a, &a), 0.0);
        assert!((chi_square(&a, &b) - chi_square(&b, &a)).abs() < 1e-12);
        assert!(chi_square(&a, &b) > 0.0);
    }

    #[test]
    fn test_predict_exact_training_image_has_zero_distance() {
        let clf = trained();
        let pred = clf.predict(&checker(5)).unwrap();
        assert_eq!(pred.label, EmployeeId(102));
        assert!(pred.distance.abs() < 1e-9);
    }

    #[test]
    fn test_predict_picks_nearest_label() {
        let clf = trained();
        let pred = clf.predict(&stripes(3)).unwrap();
        assert_eq!(pred.label, EmployeeId(101));
    }

    #[test]
    fn test_predict_rejects_wrong_size() {
        let clf = trained();
        let err = clf.predict(&GrayImage::new(SIZE + 1, SIZE)).unwrap_err();
        assert!(matches!(err, ClassifierError::InputSize { expected_w: SIZE, .. }));
    }

    #[test]
    fn test_empty_model_is_not_trained() {
        let model = LbphModel::new(params(), SIZE, SIZE);
        assert!(matches!(
            LbphClassifier::from_model(model),
            Err(ClassifierError::ModelNotTrained(_))
        ));
    }

    #[test]
    fn test_missing_model_file_is_not_trained() {
        let err = LbphClassifier::load(Path::new("/nonexistent/presence/classifier.json")).err();
        assert!(matches!(err, Some(ClassifierError::ModelNotTrained(_))));
    }

    #[test]
    fn test_malformed_histogram_length_rejected() {
        let mut model = LbphModel::new(params(), SIZE, SIZE);
        model.add_sample(EmployeeId(1), vec![0.0; 10]);
        assert!(matches!(
            LbphClassifier::from_model(model),
            Err(ClassifierError::Malformed(_))
        ));
    }

    #[test]
    fn test_model_json_round_trip_loads() {
        let clf = trained();
        let json = serde_json::to_string(&clf.model).unwrap();
        let parsed: LbphModel = serde_json::from_str(&json).unwrap();
        let reloaded = LbphClassifier::from_model(parsed).unwrap();
        assert_eq!(reloaded.sample_count(), 2);
        assert_eq!(reloaded.input_size(), (SIZE, SIZE));
    }
}
