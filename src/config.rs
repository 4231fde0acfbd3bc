//! Camera parameter set
//!
//! Loads, validates and saves the immutable-after-init configuration of the
//! coordinator: frame rate, control bounds, start-up targets and the
//! brightness search budget. Loading is layered (defaults, optional TOML file,
//! `CRABCONTROL_*` environment overrides). Invalid bounds are rejected, never
//! clamped.

use crate::errors::CameraError;
use crate::types::ImageEncoding;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "CRABCONTROL";

/// Slowest accepted publication rate, one frame every 1000 s
pub const MIN_FRAME_RATE: f64 = 0.001;

/// Closed interval `[min, max]` with `min < max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Error unless the interval is finite and non-degenerate
    pub fn validate(&self, name: &str) -> Result<(), CameraError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(CameraError::ConfigError(format!(
                "{name} bounds must be finite"
            )));
        }
        if self.min >= self.max {
            return Err(CameraError::ConfigError(format!(
                "{name} bounds are degenerate: min {} >= max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    fn validate_within(&self, name: &str, outer: Bounds) -> Result<(), CameraError> {
        self.validate(name)?;
        if self.min < outer.min || self.max > outer.max {
            return Err(CameraError::ConfigError(format!(
                "{name} bounds [{}, {}] must lie within [{}, {}]",
                self.min, self.max, outer.min, outer.max
            )));
        }
        Ok(())
    }
}

/// Budget for one brightness search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrightnessSearchConfig {
    /// Fixed iteration bound per searched parameter
    pub max_iterations: u32,
    /// Accepted distance between reached and target brightness
    pub tolerance: f64,
    /// Wall-clock bound on one whole search
    pub timeout_ms: u64,
    /// Band in which the device's native auto-brightness converges
    pub native_band: Bounds,
}

impl Default for BrightnessSearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1.0,
            timeout_ms: 15_000,
            native_band: Bounds::new(50.0, 205.0),
        }
    }
}

impl BrightnessSearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Targets applied once when the node starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialSettings {
    pub exposure: Option<f64>,
    pub gain: Option<f64>,
    pub gamma: Option<f64>,
    pub brightness: Option<f64>,
}

/// Validated camera configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParameterSet {
    /// Coordinate frame attached to published images
    pub camera_frame: String,
    /// Device to open; empty selects the first available device
    pub device_user_id: String,
    /// Publication rate in Hz
    pub frame_rate: f64,
    pub image_encoding: ImageEncoding,
    /// Exposure time in microseconds
    pub exposure: Bounds,
    /// Gain in percent of the device's native range
    pub gain: Bounds,
    pub gamma: Bounds,
    /// Mean intensity bounds
    pub brightness: Bounds,
    pub exposure_auto: bool,
    pub gain_auto: bool,
    pub initial: InitialSettings,
    pub grab_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub ready_poll_interval_ms: u64,
    pub brightness_search: BrightnessSearchConfig,
}

impl Default for CameraParameterSet {
    fn default() -> Self {
        Self {
            camera_frame: "camera".to_string(),
            device_user_id: String::new(),
            frame_rate: 5.0,
            image_encoding: ImageEncoding::Mono8,
            exposure: Bounds::new(10.0, 100_000.0),
            gain: Bounds::new(0.0, 100.0),
            gamma: Bounds::new(0.25, 4.0),
            brightness: Bounds::new(1.0, 255.0),
            exposure_auto: true,
            gain_auto: false,
            initial: InitialSettings::default(),
            grab_timeout_ms: 1_000,
            startup_timeout_ms: 5_000,
            ready_poll_interval_ms: 20,
            brightness_search: BrightnessSearchConfig::default(),
        }
    }
}

impl CameraParameterSet {
    /// Load defaults, then `path` (if given and present), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, CameraError> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_env_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, CameraError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if path.exists() {
                log::info!("Loading camera parameters from {:?}", path);
            } else {
                log::info!("Parameter file not found at {:?}, using defaults", path);
            }
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let params: CameraParameterSet = builder.build()?.try_deserialize()?;
        params.validate()?;
        Ok(params)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, CameraError> {
        let params: CameraParameterSet = toml::from_str(contents)
            .map_err(|e| CameraError::ConfigError(format!("Failed to parse parameters: {e}")))?;
        params.validate()?;
        Ok(params)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CameraError::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| CameraError::ConfigError(format!("Failed to serialize parameters: {e}")))?;

        fs::write(path, toml_string)
            .map_err(|e| CameraError::ConfigError(format!("Failed to write parameters: {e}")))?;

        log::info!("Saved camera parameters to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("crabcontrol.toml")
    }

    pub fn validate(&self) -> Result<(), CameraError> {
        if !self.frame_rate.is_finite() || self.frame_rate < MIN_FRAME_RATE {
            return Err(CameraError::ConfigError(format!(
                "frame_rate must be >= {MIN_FRAME_RATE}, got {}",
                self.frame_rate
            )));
        }

        self.exposure.validate("exposure")?;
        if self.exposure.min <= 0.0 {
            return Err(CameraError::ConfigError(
                "exposure min must be > 0".to_string(),
            ));
        }
        self.gain.validate_within("gain", Bounds::new(0.0, 100.0))?;
        self.gamma.validate("gamma")?;
        if self.gamma.min <= 0.0 {
            return Err(CameraError::ConfigError("gamma min must be > 0".to_string()));
        }
        self.brightness
            .validate_within("brightness", Bounds::new(1.0, 255.0))?;

        let search = &self.brightness_search;
        if search.max_iterations == 0 {
            return Err(CameraError::ConfigError(
                "brightness_search.max_iterations must be >= 1".to_string(),
            ));
        }
        if !search.tolerance.is_finite() || search.tolerance <= 0.0 {
            return Err(CameraError::ConfigError(
                "brightness_search.tolerance must be > 0".to_string(),
            ));
        }
        search
            .native_band
            .validate_within("brightness_search.native_band", Bounds::new(1.0, 255.0))?;

        if self.grab_timeout_ms == 0 || self.startup_timeout_ms == 0 || search.timeout_ms == 0 {
            return Err(CameraError::ConfigError("timeouts must be > 0".to_string()));
        }
        if self.ready_poll_interval_ms == 0 {
            return Err(CameraError::ConfigError(
                "ready_poll_interval_ms must be > 0".to_string(),
            ));
        }

        let initial = [
            ("initial.exposure", self.initial.exposure, self.exposure),
            ("initial.gain", self.initial.gain, self.gain),
            ("initial.gamma", self.initial.gamma, self.gamma),
            ("initial.brightness", self.initial.brightness, self.brightness),
        ];
        for (name, value, bounds) in initial {
            if let Some(v) = value {
                if !bounds.contains(v) {
                    return Err(CameraError::ConfigError(format!(
                        "{name} = {v} outside [{}, {}]",
                        bounds.min, bounds.max
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Period between two publications
    pub fn frame_period(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.frame_rate)
            .unwrap_or(Duration::from_secs_f64(1.0 / MIN_FRAME_RATE))
    }
}
