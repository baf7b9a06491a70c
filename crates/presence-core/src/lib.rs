//! presence-core: face identification and attendance commit engine.
//!
//! SCRFD (via ONNX Runtime) finds faces, an LBPH classifier names them,
//! and a debounce state machine decides when a recognition is stable
//! enough to record attendance.

pub mod annotate;
pub mod classifier;
pub mod committer;
pub mod debounce;
pub mod detector;
pub mod pipeline;
pub mod recognize;
pub mod scoring;
pub mod types;

pub use classifier::{IdentityClassifier, LbphClassifier};
pub use committer::{AttendanceCommitter, AttendanceLedger, CommitOutcome, EmployeeDirectory};
pub use debounce::{DebounceConfig, TrackState, Verdict};
pub use detector::{DetectParams, FaceDetector, ScrfdDetector};
pub use pipeline::{FramePipeline, ProcessedFrame};
pub use recognize::{recognize_image, RecognitionResult};
pub use scoring::ConfidenceScorer;
pub use types::{AttendanceEvent, ClockInSource, Employee, EmployeeId, FaceRegion, GeoPoint};

/// File name of the SCRFD detector model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_500m.onnx";
/// File name of the LBPH classifier model inside the model directory.
pub const CLASSIFIER_MODEL_FILE: &str = "classifier.json";
