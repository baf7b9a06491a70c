use anyhow::{Context, Result};
use presence_core::classifier::LbphClassifier;
use presence_core::detector::ScrfdDetector;
use presence_core::scoring::ConfidenceScorer;
use presence_store::Store;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::PresenceService;
use engine::{ClassifierLoader, EngineSettings, V4lBackend};

const BUS_NAME: &str = "org.presence.Attendance1";
const OBJECT_PATH: &str = "/org/presence/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        bus = ?config.bus,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path).context("failed to open database")?;

    // The detector is required; fail fast if it is missing.
    let detector = ScrfdDetector::load(&config.detector_model_path())
        .context("failed to load face detector model")?;

    // The classifier may not exist yet: the engine retries loading it on the
    // next start or recognize request, and rejects those until it succeeds.
    let classifier_path = config.classifier_model_path();
    let load_classifier: ClassifierLoader<LbphClassifier> = Box::new(move || {
        let classifier = LbphClassifier::load(&classifier_path)?;
        tracing::info!(samples = classifier.sample_count(), path = %classifier_path.display(), "classifier loaded");
        Ok(classifier)
    });

    let settings = EngineSettings {
        detection: config.detection,
        debounce: config.debounce,
        scorer: ConfidenceScorer::new(config.d_max)?,
        verify_threshold: config.verify_threshold,
        jpeg_quality: config.jpeg_quality,
        site_location: config.site_location(),
    };
    let backend = V4lBackend {
        device: config.camera_device.clone(),
        width: config.frame_width,
        height: config.frame_height,
        warmup_frames: config.warmup_frames,
    };

    let (engine, frames) = engine::spawn_engine(backend, detector, load_classifier, store.clone(), settings);
    let service = PresenceService::new(engine, store, frames, config.late_after);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
