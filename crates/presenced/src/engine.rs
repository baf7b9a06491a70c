use chrono::{Local, NaiveDateTime};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use presence_core::classifier::{ClassifierError, IdentityClassifier};
use presence_core::committer::{AttendanceCommitter, CommitError, CommitOutcome};
use presence_core::debounce::{DebounceConfig, TrackState, Verdict};
use presence_core::detector::{DetectParams, FaceDetector};
use presence_core::pipeline::{FramePipeline, PipelineError, ProcessedFrame};
use presence_core::recognize::{self, RecognitionResult, RecognizeError};
use presence_core::scoring::ConfidenceScorer;
use presence_core::types::{EmployeeId, GeoPoint};
use presence_hw::{Camera, CameraError, Frame};
use presence_store::Store;
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("no trained model: train the classifier first")]
    ModelNotTrained,
    #[error("classifier model unusable: {0}")]
    Classifier(ClassifierError),
    #[error("a stream is already running")]
    AlreadyStreaming,
    #[error("no stream is running")]
    NotStreaming,
    #[error("camera stopped before delivering a frame")]
    NoFrames,
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("recognition failed: {0}")]
    Recognize(#[from] RecognizeError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// The most recent annotated frame as JPEG, `None` while not streaming.
pub type LatestFrame = Option<Arc<Vec<u8>>>;

/// Where frames come from. `run` owns the device for exactly one session.
pub trait CameraBackend: Send + 'static {
    /// Open the device, hand frames to `on_frame` until it breaks, then release
    /// the device. The device must also be released on every error path.
    fn run(
        &mut self,
        on_frame: &mut dyn FnMut(DynamicImage) -> ControlFlow<()>,
    ) -> Result<(), EngineError>;
}

/// V4L2 camera opened per session.
pub struct V4lBackend {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub warmup_frames: usize,
}

impl CameraBackend for V4lBackend {
    fn run(
        &mut self,
        on_frame: &mut dyn FnMut(DynamicImage) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        // Dropping `camera` (after `stream`) closes the device on every return path.
        let camera = Camera::open(&self.device, self.width, self.height)?;
        let mut stream = camera.stream()?;

        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            for _ in 0..self.warmup_frames {
                skip_malformed(stream.next_frame())?;
            }
        }

        loop {
            let Some(frame) = skip_malformed(stream.next_frame())? else {
                continue;
            };
            if on_frame(frame.into_dynamic()).is_break() {
                return Ok(());
            }
        }
    }
}

/// A buffer that fails pixel conversion costs one frame, not the session.
fn skip_malformed(frame: Result<Frame, CameraError>) -> Result<Option<Frame>, CameraError> {
    match frame {
        Ok(frame) => Ok(Some(frame)),
        Err(CameraError::Frame(e)) => {
            tracing::warn!(error = %e, "skipping malformed camera buffer");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Tuning the engine needs from the daemon config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub detection: DetectParams,
    pub debounce: DebounceConfig,
    pub scorer: ConfidenceScorer,
    pub verify_threshold: u8,
    pub jpeg_quality: u8,
    pub site_location: Option<GeoPoint>,
}

/// Outcome of the last stable recognition, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CommitSummary {
    pub employee_id: EmployeeId,
    pub outcome: &'static str,
    pub at: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommitSummary {
    fn new(employee_id: EmployeeId, at: NaiveDateTime, result: &Result<CommitOutcome, CommitError>) -> Self {
        let (outcome, detail) = match result {
            Ok(CommitOutcome::Committed(event)) => ("committed", Some(event.time.to_string())),
            Ok(CommitOutcome::AlreadyCommittedToday { existing_time }) => {
                ("already_committed_today", Some(existing_time.to_string()))
            }
            Ok(CommitOutcome::UnknownIdentity) => ("unknown_identity", None),
            Err(e) => ("failed", Some(e.to_string())),
        };
        Self {
            employee_id,
            outcome,
            at,
            detail,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub streaming: bool,
    pub session: Option<String>,
    pub model_loaded: bool,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub lookup_failures: u64,
    pub track: String,
    pub last_commit: Option<CommitSummary>,
    pub last_error: Option<String>,
}

fn describe(state: TrackState) -> String {
    match state {
        TrackState::Idle => "idle".to_string(),
        TrackState::Accumulating { identity, hits } => format!("accumulating {identity} ({hits} hits)"),
        TrackState::Cooldown { remaining, last_stable } => {
            format!("cooldown {remaining} frames (last {last_stable})")
        }
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    StartStream {
        reply: oneshot::Sender<Result<Uuid, EngineError>>,
    },
    StopStream {
        reply: oneshot::Sender<Result<u64, EngineError>>,
    },
    Recognize {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<RecognitionResult, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// A handle whose engine is already gone; every request fails with `ChannelClosed`.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Open the camera and start the recognition loop. Resolves once the
    /// first frame arrives, or with the error that prevented it.
    pub async fn start_stream(&self) -> Result<Uuid, EngineError> {
        self.request(|reply| EngineRequest::StartStream { reply }).await?
    }

    /// Stop the running stream; returns the number of frames processed.
    pub async fn stop_stream(&self) -> Result<u64, EngineError> {
        self.request(|reply| EngineRequest::StopStream { reply }).await?
    }

    /// Stateless recognition of one encoded image.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<RecognitionResult, EngineError> {
        self.request(|reply| EngineRequest::Recognize { image, reply }).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Loads the classifier model; called again while no model is loaded.
pub type ClassifierLoader<Cls> = Box<dyn FnMut() -> Result<Cls, ClassifierError> + Send>;

/// Spawn the engine on a dedicated OS thread.
///
/// The detector is required. The classifier is loaded now and, while that
/// fails, again on every start or recognize request, so a model trained
/// after startup is picked up without a restart.
pub fn spawn_engine<B, Det, Cls>(
    backend: B,
    detector: Det,
    mut load_classifier: ClassifierLoader<Cls>,
    store: Store,
    settings: EngineSettings,
) -> (EngineHandle, watch::Receiver<LatestFrame>)
where
    B: CameraBackend,
    Det: FaceDetector + Send + 'static,
    Cls: IdentityClassifier + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (frames_tx, frames_rx) = watch::channel(None);

    let classifier = match load_classifier() {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "no usable classifier; recognition disabled until a model is trained");
            None
        }
    };

    let engine = Engine {
        backend,
        status: EngineStatus {
            model_loaded: classifier.is_some(),
            track: describe(TrackState::Idle),
            ..EngineStatus::default()
        },
        detector,
        classifier,
        load_classifier,
        store,
        settings,
        frames_tx,
    };

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || engine.run(rx))
        .expect("failed to spawn engine thread");

    (EngineHandle { tx }, frames_rx)
}

struct Engine<B, Det, Cls> {
    backend: B,
    detector: Det,
    classifier: Option<Cls>,
    load_classifier: ClassifierLoader<Cls>,
    store: Store,
    settings: EngineSettings,
    frames_tx: watch::Sender<LatestFrame>,
    status: EngineStatus,
}

/// The loaded classifier, loading it first if the slot is empty.
fn ensure_classifier<'a, Cls>(
    slot: &'a mut Option<Cls>,
    load: &mut ClassifierLoader<Cls>,
    status: &mut EngineStatus,
) -> Result<&'a Cls, EngineError> {
    if slot.is_none() {
        match load() {
            Ok(classifier) => {
                tracing::info!("classifier model loaded");
                status.model_loaded = true;
                *slot = Some(classifier);
            }
            Err(ClassifierError::ModelNotTrained(reason)) => {
                tracing::debug!(%reason, "classifier still not trained");
                return Err(EngineError::ModelNotTrained);
            }
            Err(e) => return Err(EngineError::Classifier(e)),
        }
    }
    slot.as_ref().ok_or(EngineError::ModelNotTrained)
}

impl<B, Det, Cls> Engine<B, Det, Cls>
where
    B: CameraBackend,
    Det: FaceDetector,
    Cls: IdentityClassifier,
{
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!("engine thread started");
        while let Some(req) = rx.blocking_recv() {
            match req {
                EngineRequest::StartStream { reply } => self.stream(&mut rx, reply),
                EngineRequest::StopStream { reply } => {
                    let _ = reply.send(Err(EngineError::NotStreaming));
                }
                EngineRequest::Recognize { image, reply } => {
                    let result =
                        ensure_classifier(&mut self.classifier, &mut self.load_classifier, &mut self.status)
                            .and_then(|classifier| {
                                recognize_with(&mut self.detector, classifier, &self.store, &self.settings, &image)
                            });
                    let _ = reply.send(result);
                }
                EngineRequest::Status { reply } => {
                    let _ = reply.send(self.status.clone());
                }
            }
        }
        tracing::info!("engine thread exiting");
    }

    /// Run one streaming session to completion.
    fn stream(
        &mut self,
        rx: &mut mpsc::Receiver<EngineRequest>,
        reply: oneshot::Sender<Result<Uuid, EngineError>>,
    ) {
        let Engine {
            backend,
            detector,
            classifier,
            load_classifier,
            store,
            settings,
            frames_tx,
            status,
        } = self;
        let store: &Store = store;
        let settings: &EngineSettings = settings;

        let classifier = match ensure_classifier(classifier, load_classifier, status) {
            Ok(classifier) => classifier,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let session = Uuid::new_v4();
        let span = tracing::info_span!("stream", session = %session);
        let _enter = span.enter();

        let mut pipeline = FramePipeline::new(
            &mut *detector,
            classifier,
            settings.scorer,
            settings.detection,
            settings.debounce,
            AttendanceCommitter::new(store.clone(), store.clone()),
        )
        .with_site_location(settings.site_location);

        status.streaming = true;
        status.session = Some(session.to_string());
        status.frames_processed = 0;
        status.frames_skipped = 0;
        status.lookup_failures = 0;
        status.last_error = None;

        let mut start_reply = Some(reply);
        let mut stop_reply = None;
        let mut failure = None;

        let result = backend.run(&mut |frame| {
            if let Some(reply) = start_reply.take() {
                tracing::info!("stream started");
                let _ = reply.send(Ok(session));
            }

            // Serve requests between frames so a stop is honoured within one frame.
            loop {
                match rx.try_recv() {
                    Ok(EngineRequest::StopStream { reply }) => {
                        stop_reply = Some(reply);
                        return ControlFlow::Break(());
                    }
                    Ok(EngineRequest::StartStream { reply }) => {
                        let _ = reply.send(Err(EngineError::AlreadyStreaming));
                    }
                    Ok(EngineRequest::Recognize { image, reply }) => {
                        let (det, cls) = pipeline.models_mut();
                        let _ = reply.send(recognize_with(det, cls, store, settings, &image));
                    }
                    Ok(EngineRequest::Status { reply }) => {
                        status.track = describe(pipeline.track_state());
                        let _ = reply.send(status.clone());
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return ControlFlow::Break(()),
                }
            }

            let now = Local::now().naive_local();
            match pipeline.process_frame(&frame, now) {
                Ok(processed) => {
                    status.frames_processed += 1;
                    status.lookup_failures += u64::from(processed.lookup_failures);
                    if let Some(summary) = record_visit(store, &processed, now) {
                        status.last_commit = Some(summary);
                    }
                    match encode_jpeg(&processed.annotated, settings.jpeg_quality) {
                        Ok(jpeg) => {
                            frames_tx.send_replace(Some(Arc::new(jpeg)));
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to encode frame"),
                    }
                    ControlFlow::Continue(())
                }
                Err(PipelineError::InvalidFrame(msg)) => {
                    status.frames_skipped += 1;
                    tracing::warn!(reason = %msg, "skipping invalid frame");
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    failure = Some(EngineError::from(e));
                    ControlFlow::Break(())
                }
            }
        });

        let frames = status.frames_processed;
        let outcome = result.and_then(|()| failure.map_or(Ok(()), Err));

        match &outcome {
            Ok(()) => tracing::info!(frames, "stream stopped"),
            Err(e) => tracing::error!(frames, error = %e, "stream terminated"),
        }

        status.streaming = false;
        status.session = None;
        status.track = describe(TrackState::Idle);
        status.last_error = outcome.as_ref().err().map(|e| e.to_string());
        frames_tx.send_replace(None);

        if let Some(reply) = stop_reply.take() {
            let _ = reply.send(Ok(frames));
        }
        // Still pending only if the backend failed or ended before the first frame.
        if let Some(reply) = start_reply.take() {
            let _ = reply.send(Err(outcome.err().unwrap_or(EngineError::NoFrames)));
        }
    }
}

/// Log an access for the identity that stabilized this frame, if any.
fn record_visit(store: &Store, processed: &ProcessedFrame, now: NaiveDateTime) -> Option<CommitSummary> {
    let result = processed.commit.as_ref()?;
    let identity = processed.detections.iter().find_map(|d| match d.verdict {
        Verdict::Stable { identity } => Some(identity),
        _ => None,
    })?;
    if let Err(e) = store.log_access(identity, now) {
        tracing::warn!(employee_id = %identity, error = %e, "failed to write access log");
    }
    Some(CommitSummary::new(identity, now, result))
}

fn recognize_with<Det, Cls>(
    detector: &mut Det,
    classifier: &Cls,
    store: &Store,
    settings: &EngineSettings,
    image: &[u8],
) -> Result<RecognitionResult, EngineError>
where
    Det: FaceDetector + ?Sized,
    Cls: IdentityClassifier + ?Sized,
{
    Ok(recognize::recognize_bytes(
        detector,
        classifier,
        store,
        &settings.scorer,
        &settings.detection,
        settings.verify_threshold,
        image,
    )?)
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(img)?;
    Ok(buf)
}
