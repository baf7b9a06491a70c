use chrono::NaiveTime;
use presence_core::debounce::DebounceConfig;
use presence_core::detector::DetectParams;
use presence_core::scoring::DEFAULT_D_MAX;
use presence_core::recognize::DEFAULT_VERIFY_THRESHOLD;
use presence_core::types::GeoPoint;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "session" => Some(BusKind::Session),
            "system" => Some(BusKind::System),
            _ => None,
        }
    }
}

/// Daemon configuration: compiled defaults, then an optional TOML file,
/// then `PRESENCE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frames discarded after opening the camera (auto-exposure settling).
    pub warmup_frames: usize,
    /// Directory holding the detector and classifier models.
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    pub detection: DetectParams,
    pub debounce: DebounceConfig,
    /// Raw classifier distance that maps to zero confidence.
    pub d_max: f64,
    /// Minimum confidence for single-image recognition.
    pub verify_threshold: u8,
    /// Check-ins at or after this time are late.
    pub late_after: NaiveTime,
    pub site_latitude: Option<f64>,
    pub site_longitude: Option<f64>,
    pub jpeg_quality: u8,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            warmup_frames: 4,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("presence.db"),
            detection: DetectParams::default(),
            debounce: DebounceConfig::default(),
            d_max: DEFAULT_D_MAX,
            verify_threshold: DEFAULT_VERIFY_THRESHOLD,
            late_after: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            site_latitude: None,
            site_longitude: None,
            jpeg_quality: 80,
            bus: BusKind::Session,
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

/// `PRESENCE_CONFIG`, or `$XDG_CONFIG_HOME/presence/presence.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PRESENCE_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("presence")
        .join("presence.toml")
}

impl Config {
    /// Load all three layers from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Override fields from `PRESENCE_*` variables returned by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let env = Env(&lookup);
        if let Some(v) = lookup("PRESENCE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env.parse("PRESENCE_FRAME_WIDTH", &mut self.frame_width)?;
        env.parse("PRESENCE_FRAME_HEIGHT", &mut self.frame_height)?;
        env.parse("PRESENCE_WARMUP_FRAMES", &mut self.warmup_frames)?;
        env.parse("PRESENCE_SCALE_FACTOR", &mut self.detection.scale_factor)?;
        env.parse("PRESENCE_MIN_NEIGHBORS", &mut self.detection.min_neighbors)?;
        env.parse("PRESENCE_MIN_SIZE", &mut self.detection.min_size)?;
        env.parse("PRESENCE_ACCEPTANCE_THRESHOLD", &mut self.debounce.acceptance_threshold)?;
        env.parse("PRESENCE_STABILIZATION_COUNT", &mut self.debounce.stabilization_count)?;
        env.parse("PRESENCE_COOLDOWN_FRAMES", &mut self.debounce.cooldown_frames)?;
        env.parse("PRESENCE_D_MAX", &mut self.d_max)?;
        env.parse("PRESENCE_VERIFY_THRESHOLD", &mut self.verify_threshold)?;
        env.parse("PRESENCE_LATE_AFTER", &mut self.late_after)?;
        env.parse("PRESENCE_JPEG_QUALITY", &mut self.jpeg_quality)?;
        env.parse_opt("PRESENCE_SITE_LATITUDE", &mut self.site_latitude)?;
        env.parse_opt("PRESENCE_SITE_LONGITUDE", &mut self.site_longitude)?;
        if let Some(v) = lookup("PRESENCE_BUS") {
            self.bus = BusKind::parse(&v)
                .ok_or_else(|| ConfigError::Invalid(format!("PRESENCE_BUS: expected session or system, got {v:?}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detection
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if !(self.d_max.is_finite() && self.d_max > 0.0) {
            return Err(ConfigError::Invalid(format!("d_max must be positive, got {}", self.d_max)));
        }
        if self.debounce.stabilization_count == 0 {
            return Err(ConfigError::Invalid("stabilization_count must be at least 1".into()));
        }
        if self.debounce.acceptance_threshold > 100 || self.verify_threshold > 100 {
            return Err(ConfigError::Invalid("thresholds are percentages (0-100)".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!("jpeg_quality must be 1-100, got {}", self.jpeg_quality)));
        }
        if self.site_latitude.is_some() != self.site_longitude.is_some() {
            return Err(ConfigError::Invalid("site_latitude and site_longitude must be set together".into()));
        }
        Ok(())
    }

    pub fn site_location(&self) -> Option<GeoPoint> {
        Some(GeoPoint {
            latitude: self.site_latitude?,
            longitude: self.site_longitude?,
        })
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(presence_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn classifier_model_path(&self) -> PathBuf {
        self.model_dir.join(presence_core::CLASSIFIER_MODEL_FILE)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(raw) = (self.0)(key) {
            *slot = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse {raw:?}")))?;
        }
        Ok(())
    }

    /// An empty value clears the field.
    fn parse_opt<T: std::str::FromStr>(&self, key: &str, slot: &mut Option<T>) -> Result<(), ConfigError> {
        if let Some(raw) = (self.0)(key) {
            *slot = match raw.trim() {
                "" => None,
                value => Some(
                    value
                        .parse()
                        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse {raw:?}")))?,
                ),
            };
        }
        Ok(())
    }
}
