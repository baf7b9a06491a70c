//! Stateless single-image recognition.
//!
//! Same detect/classify/score steps as the streaming pipeline, run once.
//! Never touches a [`TrackState`](crate::debounce::TrackState) and never
//! commits attendance.

use crate::classifier::{ClassifierError, IdentityClassifier};
use crate::committer::EmployeeDirectory;
use crate::detector::{DetectParams, DetectorError, FaceDetector};
use crate::pipeline::face_crop;
use crate::scoring::ConfidenceScorer;
use crate::types::{Employee, FaceRegion};
use image::GrayImage;
use serde::Serialize;
use thiserror::Error;

/// Default minimum confidence for single-image recognition.
pub const DEFAULT_VERIFY_THRESHOLD: u8 = 60;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("directory lookup failed: {0}")]
    Directory(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecognitionResult {
    Recognized {
        employee: Employee,
        confidence: u8,
        region: FaceRegion,
    },
    NotRecognized {
        confidence: u8,
        region: FaceRegion,
    },
    NoFace,
}

/// Largest region by area; ties keep the detector's order.
fn largest(regions: &[FaceRegion]) -> Option<FaceRegion> {
    regions
        .iter()
        .copied()
        .reduce(|best, r| if r.area() > best.area() { r } else { best })
}

/// Recognize the most prominent face in `gray`.
///
/// Detection runs with `params` first and, if that finds nothing, once more
/// with [`DetectParams::lenient`].
pub fn recognize_image<Det, Cls, D>(
    detector: &mut Det,
    classifier: &Cls,
    directory: &D,
    scorer: &ConfidenceScorer,
    params: &DetectParams,
    verify_threshold: u8,
    gray: &GrayImage,
) -> Result<RecognitionResult, RecognizeError>
where
    Det: FaceDetector + ?Sized,
    Cls: IdentityClassifier + ?Sized,
    D: EmployeeDirectory,
{
    let mut regions = detector.detect(gray, params)?;
    if regions.is_empty() {
        tracing::debug!("no face with configured params; retrying lenient");
        regions = detector.detect(gray, &DetectParams::lenient())?;
    }

    let Some(region) = largest(&regions) else {
        return Ok(RecognitionResult::NoFace);
    };
    let Some(crop) = face_crop(gray, region, classifier.input_size()) else {
        return Ok(RecognitionResult::NoFace);
    };

    let prediction = classifier.predict(&crop)?;
    let confidence = scorer.score(prediction.distance);

    if confidence >= verify_threshold {
        let employee = directory
            .lookup_employee(prediction.label)
            .map_err(|e| RecognizeError::Directory(Box::new(e)))?
            .filter(|e| e.active);
        if let Some(employee) = employee {
            tracing::info!(employee_id = %employee.id, confidence, "image recognized");
            return Ok(RecognitionResult::Recognized {
                employee,
                confidence,
                region,
            });
        }
    }

    tracing::info!(label = %prediction.label, confidence, "image not recognized");
    Ok(RecognitionResult::NotRecognized { confidence, region })
}

/// Decode encoded image bytes (JPEG, PNG, ...) and run [`recognize_image`].
pub fn recognize_bytes<Det, Cls, D>(
    detector: &mut Det,
    classifier: &Cls,
    directory: &D,
    scorer: &ConfidenceScorer,
    params: &DetectParams,
    verify_threshold: u8,
    bytes: &[u8],
) -> Result<RecognitionResult, RecognizeError>
where
    Det: FaceDetector + ?Sized,
    Cls: IdentityClassifier + ?Sized,
    D: EmployeeDirectory,
{
    let gray = image::load_from_memory(bytes)?.to_luma8();
    recognize_image(detector, classifier, directory, scorer, params, verify_threshold, &gray)
}
