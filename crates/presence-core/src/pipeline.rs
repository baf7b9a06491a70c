//! Per-frame recognition pipeline.
//!
//! greyscale → detect → crop/resize → classify → score → debounce →
//! (on stable) commit → annotate. The pipeline owns the session's
//! [`RecognitionDebouncer`]; nothing else touches its counters.

use crate::annotate::{self, RegionLabel};
use crate::classifier::{ClassifierError, IdentityClassifier};
use crate::committer::{AttendanceCommitter, AttendanceLedger, CommitError, CommitOutcome, EmployeeDirectory};
use crate::debounce::{DebounceConfig, Observation, RecognitionDebouncer, TrackState, Verdict};
use crate::detector::{DetectParams, DetectorError, FaceDetector};
use crate::scoring::ConfidenceScorer;
use crate::types::{ClockInSource, Employee, FaceRegion, GeoPoint, RecognitionSample};
use chrono::NaiveDateTime;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed input; the caller should skip this frame and continue.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("detector: {0}")]
    Detector(DetectorError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
}

impl From<DetectorError> for PipelineError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::InvalidFrame(msg) => PipelineError::InvalidFrame(msg),
            other => PipelineError::Detector(other),
        }
    }
}

/// Crop `region` out of `gray` and resize it to the classifier resolution.
pub fn face_crop(gray: &GrayImage, region: FaceRegion, size: (u32, u32)) -> Option<GrayImage> {
    let r = region.clamp_to(gray.width(), gray.height())?;
    let crop = imageops::crop_imm(gray, r.x, r.y, r.width, r.height).to_image();
    Some(imageops::resize(&crop, size.0, size.1, FilterType::Triangle))
}

/// One region's trip through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub region: FaceRegion,
    pub sample: RecognitionSample,
    /// Directory entry when the label resolved to an active employee.
    pub employee: Option<Employee>,
    pub verdict: Verdict,
}

/// Everything produced for one input frame.
#[derive(Debug)]
pub struct ProcessedFrame {
    pub annotated: RgbImage,
    pub detections: Vec<Detection>,
    /// Present only on the frame where a recognition stabilized.
    pub commit: Option<Result<CommitOutcome, CommitError>>,
    /// Regions whose directory lookup failed; they were treated as unknown.
    pub lookup_failures: u32,
}

pub struct FramePipeline<Det, Cls, D, L> {
    detector: Det,
    classifier: Cls,
    scorer: ConfidenceScorer,
    params: DetectParams,
    debouncer: RecognitionDebouncer,
    committer: AttendanceCommitter<D, L>,
    site_location: Option<GeoPoint>,
}

impl<Det, Cls, D, L> FramePipeline<Det, Cls, D, L>
where
    Det: FaceDetector,
    Cls: IdentityClassifier,
    D: EmployeeDirectory,
    L: AttendanceLedger,
{
    pub fn new(
        detector: Det,
        classifier: Cls,
        scorer: ConfidenceScorer,
        params: DetectParams,
        debounce: DebounceConfig,
        committer: AttendanceCommitter<D, L>,
    ) -> Self {
        Self {
            detector,
            classifier,
            scorer,
            params,
            debouncer: RecognitionDebouncer::new(debounce),
            committer,
            site_location: None,
        }
    }

    /// Geolocation stamped onto camera commits.
    pub fn with_site_location(mut self, location: Option<GeoPoint>) -> Self {
        self.site_location = location;
        self
    }

    pub fn track_state(&self) -> TrackState {
        self.debouncer.state()
    }

    /// Forget any in-progress accumulation or cooldown (new session).
    pub fn reset(&mut self) {
        self.debouncer.reset();
    }

    pub fn committer(&self) -> &AttendanceCommitter<D, L> {
        &self.committer
    }

    /// Hand back the detector and classifier, e.g. when a session ends.
    pub fn into_parts(self) -> (Det, Cls) {
        (self.detector, self.classifier)
    }

    /// Borrow the models mid-session, e.g. for a one-off single-image recognition.
    pub fn models_mut(&mut self) -> (&mut Det, &Cls) {
        (&mut self.detector, &self.classifier)
    }

    pub fn process_frame(
        &mut self,
        frame: &DynamicImage,
        now: NaiveDateTime,
    ) -> Result<ProcessedFrame, PipelineError> {
        let gray = frame.to_luma8();
        let regions = self.detector.detect(&gray, &self.params)?;
        let size = self.classifier.input_size();

        let mut scored = Vec::with_capacity(regions.len());
        let mut lookup_failures = 0;
        for region in regions {
            let Some(crop) = face_crop(&gray, region, size) else {
                continue;
            };
            let prediction = self.classifier.predict(&crop)?;
            let confidence = self.scorer.score(prediction.distance);

            let threshold = self.debouncer.config().acceptance_threshold;
            let employee = if confidence >= threshold {
                match self.committer.resolve(prediction.label) {
                    Ok(employee) => employee,
                    Err(e) => {
                        lookup_failures += 1;
                        tracing::warn!(label = %prediction.label, error = %e, "directory lookup failed; region treated as unknown");
                        None
                    }
                }
            } else {
                None
            };

            scored.push((
                RecognitionSample {
                    label: prediction.label,
                    raw_distance: prediction.distance,
                    confidence,
                    region,
                    captured_at: now,
                },
                employee,
            ));
        }

        let observations: Vec<Observation> = scored
            .iter()
            .map(|(sample, employee)| match employee {
                Some(e) => Observation::Recognized {
                    identity: e.id,
                    confidence: sample.confidence,
                },
                None if sample.confidence >= self.debouncer.config().acceptance_threshold => {
                    Observation::Unknown
                }
                None => Observation::Recognized {
                    identity: sample.label,
                    confidence: sample.confidence,
                },
            })
            .collect();

        let verdicts = self.debouncer.process_frame(&observations);

        let mut commit = None;
        let detections: Vec<Detection> = scored
            .into_iter()
            .zip(verdicts)
            .map(|((sample, employee), verdict)| {
                tracing::trace!(
                    label = %sample.label,
                    distance = sample.raw_distance,
                    confidence = sample.confidence,
                    ?verdict,
                    "region evaluated"
                );
                if let Verdict::Stable { identity } = verdict {
                    let outcome =
                        self.committer
                            .commit(identity, now, self.site_location, ClockInSource::Camera);
                    if let Err(e) = &outcome {
                        tracing::error!(employee_id = %identity, error = %e, "attendance commit failed");
                    }
                    commit = Some(outcome);
                }
                Detection {
                    region: sample.region,
                    sample,
                    employee,
                    verdict,
                }
            })
            .collect();

        let mut annotated = frame.to_rgb8();
        let labels: Vec<RegionLabel<'_>> = detections
            .iter()
            .map(|d| RegionLabel {
                region: d.region,
                verdict: d.verdict,
                employee: d.employee.as_ref(),
            })
            .collect();
        annotate::annotate(&mut annotated, &labels, self.debouncer.config().stabilization_count);

        Ok(ProcessedFrame {
            annotated,
            detections,
            commit,
            lookup_failures,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::committer::fakes::{FakeDirectory, FakeLedger};
    use crate::types::EmployeeId;
    use chrono::NaiveDate;
    use std::sync::atomic::Ordering;

    type TestPipeline = FramePipeline<ScriptedDetector, BrightnessClassifier, FakeDirectory, FakeLedger>;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(8, 30, 0).unwrap()
    }

    /// distance 45 → confidence 85
    fn pipeline(detector: ScriptedDetector, ledger: FakeLedger) -> TestPipeline {
        FramePipeline::new(
            detector,
            BrightnessClassifier { distance: 45.0 },
            ConfidenceScorer::default(),
            DetectParams::default(),
            DebounceConfig::default(),
            AttendanceCommitter::new(FakeDirectory::default().with(12, "Ana", "Welder"), ledger),
        )
    }

    #[test]
    fn test_stable_after_thirty_frames_commits_once() {
        let mut p = pipeline(ScriptedDetector::always(vec![FACE]), FakeLedger::default());
        let frame = frame_for(12);
        let mut commits = Vec::new();
        for _ in 0..110 {
            let out = p.process_frame(&frame, now()).unwrap();
            if let Some(c) = out.commit {
                commits.push(c.unwrap());
            }
        }
        assert_eq!(commits.len(), 1);
        assert!(matches!(commits[0], CommitOutcome::Committed(_)));
        assert_eq!(p.committer().ledger().len(), 1);
    }

    #[test]
    fn test_unknown_label_never_advances_or_commits() {
        // label 9 has no directory entry
        let mut p = pipeline(ScriptedDetector::always(vec![FACE]), FakeLedger::default());
        let frame = frame_for(9);
        for _ in 0..60 {
            let out = p.process_frame(&frame, now()).unwrap();
            assert!(out.commit.is_none());
            assert_eq!(out.detections[0].verdict, Verdict::Unrecognized);
        }
        assert_eq!(p.track_state().consecutive_hits(), 0);
        assert_eq!(p.committer().ledger().len(), 0);
    }

    #[test]
    fn test_low_confidence_is_unrecognized() {
        let mut p = pipeline(ScriptedDetector::always(vec![FACE]), FakeLedger::default());
        p.classifier.distance = 120.0; // confidence 60
        let out = p.process_frame(&frame_for(12), now()).unwrap();
        assert_eq!(out.detections[0].sample.confidence, 60);
        assert_eq!(out.detections[0].verdict, Verdict::Unrecognized);
        assert!(out.detections[0].employee.is_none());
    }

    #[test]
    fn test_frame_without_face_resets_progress() {
        let mut frames: std::collections::VecDeque<Vec<FaceRegion>> = (0..10).map(|_| vec![FACE]).collect();
        frames.push_back(vec![]);
        let detector = ScriptedDetector { frames, fallback: vec![FACE] };
        let mut p = pipeline(detector, FakeLedger::default());
        let frame = frame_for(12);
        for _ in 0..10 {
            p.process_frame(&frame, now()).unwrap();
        }
        assert_eq!(p.track_state().consecutive_hits(), 10);
        let out = p.process_frame(&frame, now()).unwrap();
        assert!(out.detections.is_empty());
        assert_eq!(p.track_state(), TrackState::Idle);
    }

    #[test]
    fn test_commit_failure_keeps_cooldown() {
        let ledger = FakeLedger { fail_writes: true, ..FakeLedger::default() };
        let mut p = pipeline(ScriptedDetector::always(vec![FACE]), ledger);
        let frame = frame_for(12);
        let mut failures = 0;
        for _ in 0..30 {
            if let Some(Err(_)) = p.process_frame(&frame, now()).unwrap().commit {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
        assert!(matches!(p.track_state(), TrackState::Cooldown { last_stable: EmployeeId(12), .. }));
        // Still suppressed on the next frame: no immediate retry.
        let out = p.process_frame(&frame, now()).unwrap();
        assert!(out.commit.is_none());
        assert_eq!(out.detections[0].verdict, Verdict::Suppressed);
    }

    #[test]
    fn test_directory_failure_is_absorbed_per_frame() {
        let mut p = pipeline(ScriptedDetector::always(vec![FACE]), FakeLedger::default());
        let frame = frame_for(12);
        for _ in 0..5 {
            p.process_frame(&frame, now()).unwrap();
        }
        p.committer().directory().offline.store(true, Ordering::SeqCst);

        let out = p.process_frame(&frame, now()).unwrap();
        assert_eq!(out.lookup_failures, 1);
        assert_eq!(out.detections[0].verdict, Verdict::Unrecognized);
        assert!(out.commit.is_none());
        assert_eq!(p.track_state(), TrackState::Idle);

        // The directory comes back and the same session carries on.
        p.committer().directory().offline.store(false, Ordering::SeqCst);
        let mut commits = 0;
        for _ in 0..30 {
            let out = p.process_frame(&frame, now()).unwrap();
            assert_eq!(out.lookup_failures, 0);
            commits += out.commit.is_some() as usize;
        }
        assert_eq!(commits, 1);
    }

    #[test]
    fn test_invalid_frame_is_reported() {
        let mut p = pipeline(ScriptedDetector::always(vec![FACE]), FakeLedger::default());
        let empty = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert!(matches!(p.process_frame(&empty, now()), Err(PipelineError::InvalidFrame(_))));
    }

    #[test]
    fn test_annotated_frame_matches_input_size() {
        let mut p = pipeline(ScriptedDetector::always(vec![FACE]), FakeLedger::default());
        let out = p.process_frame(&frame_for(12), now()).unwrap();
        assert_eq!(out.annotated.dimensions(), (160, 120));
        assert!(matches!(out.detections[0].verdict, Verdict::Accumulating { hits: 1, .. }));
    }

    #[test]
    fn test_face_crop_resizes_and_clamps() {
        let gray = GrayImage::from_pixel(100, 80, image::Luma([50]));
        let crop = face_crop(&gray, FaceRegion { x: 90, y: 70, width: 40, height: 40 }, (20, 20)).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
        assert!(face_crop(&gray, FaceRegion { x: 100, y: 0, width: 5, height: 5 }, (20, 20)).is_none());
    }
}
