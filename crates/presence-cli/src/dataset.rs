//! Face crop capture for building a training dataset.
//!
//! Each accepted frame contributes one greyscale crop of its largest face,
//! written as `<out>/<employee>.<n>.png`.

use anyhow::{Context, Result};
use presence_core::classifier::DEFAULT_FACE_SIZE;
use presence_core::detector::{DetectParams, FaceDetector};
use presence_core::pipeline::face_crop;
use presence_core::types::EmployeeId;
use presence_hw::Frame;
use std::path::{Path, PathBuf};

/// What happened to one offered frame.
#[derive(Debug, PartialEq)]
pub enum Offer {
    Saved(PathBuf),
    Dark,
    NoFace,
}

pub fn sample_path(out_dir: &Path, employee: EmployeeId, n: usize) -> PathBuf {
    out_dir.join(format!("{employee}.{n}.png"))
}

pub struct DatasetCapture<D> {
    detector: D,
    params: DetectParams,
    out_dir: PathBuf,
    employee: EmployeeId,
    saved: usize,
}

impl<D: FaceDetector> DatasetCapture<D> {
    pub fn new(detector: D, params: DetectParams, out_dir: PathBuf, employee: EmployeeId) -> Result<Self> {
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        Ok(Self {
            detector,
            params,
            out_dir,
            employee,
            saved: 0,
        })
    }

    pub fn saved(&self) -> usize {
        self.saved
    }

    pub fn offer(&mut self, frame: &Frame) -> Result<Offer> {
        if frame.is_dark {
            return Ok(Offer::Dark);
        }
        let gray = frame.gray();
        let regions = self.detector.detect(&gray, &self.params)?;
        let Some(region) = regions.iter().copied().max_by_key(|r| r.area()) else {
            return Ok(Offer::NoFace);
        };
        let Some(crop) = face_crop(&gray, region, (DEFAULT_FACE_SIZE, DEFAULT_FACE_SIZE)) else {
            return Ok(Offer::NoFace);
        };

        let path = sample_path(&self.out_dir, self.employee, self.saved + 1);
        crop.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.saved += 1;
        tracing::debug!(path = %path.display(), "saved face sample");
        Ok(Offer::Saved(path))
    }
}
