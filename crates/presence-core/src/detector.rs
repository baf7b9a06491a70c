//! Face-region detection.
//!
//! [`FaceDetector`] is the seam the pipeline calls through. [`ScrfdDetector`]
//! implements it with the SCRFD ONNX model: letterbox resize, 3-stride
//! anchor-free decoding, then NMS that also counts how many raw candidates
//! each kept box absorbed (cascade-style `min_neighbors`).

use crate::types::FaceRegion;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
    #[error("model file not found: {0}: download SCRFD from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection tuning, named after the cascade-detector parameters they replace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectParams {
    /// Pyramid step; must be > 1.0.
    pub scale_factor: f32,
    /// Minimum number of overlapping raw candidates merged into a kept box.
    pub min_neighbors: u32,
    /// Boxes narrower or shorter than this (pixels) are dropped.
    pub min_size: u32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 1,
            min_size: 30,
        }
    }
}

impl DetectParams {
    /// Relaxed parameters for a second attempt when the first finds nothing.
    pub fn lenient() -> Self {
        Self {
            scale_factor: 1.05,
            min_neighbors: 0,
            min_size: 20,
        }
    }

    pub fn validate(&self) -> Result<(), DetectorError> {
        if !self.scale_factor.is_finite() || self.scale_factor <= 1.0 {
            return Err(DetectorError::InvalidParams(format!(
                "scale_factor must be > 1.0, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// Domain interface for face detection.
pub trait FaceDetector {
    fn detect(
        &mut self,
        frame: &GrayImage,
        params: &DetectParams,
    ) -> Result<Vec<FaceRegion>, DetectorError>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for &mut T {
    fn detect(
        &mut self,
        frame: &GrayImage,
        params: &DetectParams,
    ) -> Result<Vec<FaceRegion>, DetectorError> {
        (**self).detect(frame, params)
    }
}

fn validate_frame(frame: &GrayImage) -> Result<(), DetectorError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(DetectorError::InvalidFrame(format!(
            "empty frame {}x{}",
            frame.width(),
            frame.height()
        )));
    }
    Ok(())
}

/// A raw decoded box before NMS, in original frame coordinates.
#[derive(Debug, Clone)]
struct Candidate {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
}

/// A box that survived NMS, with the count of candidates it suppressed.
#[derive(Debug, Clone)]
struct Merged {
    candidate: Candidate,
    neighbors: u32,
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Letterbox-resize the frame into a NCHW float tensor.
    fn preprocess(&self, frame: &GrayImage) -> (Array4<f32>, LetterboxInfo) {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let scale = (self.input_width as f32 / width as f32).min(self.input_height as f32 / height as f32);

        let new_w = ((width as f32 * scale).round() as usize).clamp(1, self.input_width);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, self.input_height);
        let pad_x = (self.input_width - new_w) as f32 / 2.0;
        let pad_y = (self.input_height - new_h) as f32 / 2.0;

        let resized = image::imageops::resize(
            frame,
            new_w as u32,
            new_h as u32,
            image::imageops::FilterType::Triangle,
        );

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));

        for y in 0..self.input_height {
            for x in 0..self.input_width {
                let inside = y >= pad_y_start
                    && y < pad_y_start + new_h
                    && x >= pad_x_start
                    && x < pad_x_start + new_w;
                let pixel = if inside {
                    resized.get_pixel((x - pad_x_start) as u32, (y - pad_y_start) as u32)[0] as f32
                } else {
                    SCRFD_MEAN
                };

                let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &mut self,
        frame: &GrayImage,
        params: &DetectParams,
    ) -> Result<Vec<FaceRegion>, DetectorError> {
        validate_frame(frame)?;
        params.validate()?;

        let (input, letterbox) = self.preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_width,
                self.input_height,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let merged = nms(candidates, SCRFD_NMS_THRESHOLD);
        Ok(to_regions(merged, params, frame.width(), frame.height()))
    }
}

/// Map SCRFD output tensors to stride slots, by name when possible.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut candidates = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * s;
        let anchor_cy = (anchor_idx / grid_w) as f32 * s;

        let x1 = (anchor_cx - bboxes[bbox_off] * s - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_cy - bboxes[bbox_off + 1] * s - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_cx + bboxes[bbox_off + 2] * s - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_cy + bboxes[bbox_off + 3] * s - letterbox.pad_y) / letterbox.scale;

        candidates.push(Candidate {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }

    candidates
}

/// Non-Maximum Suppression that records how many candidates each survivor absorbed.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Merged> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        let mut neighbors = 0u32;
        for j in (i + 1)..candidates.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&candidates[i], &candidates[j]) > iou_threshold {
                suppressed[j] = true;
                neighbors += 1;
            }
        }
        keep.push(Merged {
            candidate: candidates[i].clone(),
            neighbors,
        });
    }

    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Apply `min_neighbors`/`min_size` and convert to clamped integer regions.
fn to_regions(
    merged: Vec<Merged>,
    params: &DetectParams,
    frame_width: u32,
    frame_height: u32,
) -> Vec<FaceRegion> {
    merged
        .into_iter()
        .filter(|m| m.neighbors >= params.min_neighbors)
        .filter_map(|m| {
            let c = m.candidate;
            let x = c.x.max(0.0).round() as u32;
            let y = c.y.max(0.0).round() as u32;
            let x2 = (c.x + c.width).max(0.0).round() as u32;
            let y2 = (c.y + c.height).max(0.0).round() as u32;
            FaceRegion {
                x,
                y,
                width: x2.saturating_sub(x),
                height: y2.saturating_sub(y),
            }
            .clamp_to(frame_width, frame_height)
        })
        .filter(|r| r.width >= params.min_size && r.height >= params.min_size)
        .collect()
}
