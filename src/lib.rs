//! CrabControl: camera-control coordinator
//!
//! Sits between external callers and a single camera device and provides:
//! - photometric control (exposure, gain, gamma) with reached-value reporting
//! - a bisection brightness search for targets the device's own auto mode
//!   cannot reach
//! - serialized hardware access through one re-entrant lock
//! - goal-based multi-frame capture with feedback, cancellation and
//!   single-active-goal preemption
//! - a sleep state that refuses hardware work without touching the device
//! - frame publication to observers, suppressed when nobody is listening
//!
//! # Usage
//! ```rust,no_run
//! use crabcontrol::{CameraNode, CameraParameterSet, SimulatedCamera, SimulatedCameraConfig};
//! use std::sync::Arc;
//!
//! let params = CameraParameterSet::load(None).unwrap();
//! let camera = Arc::new(SimulatedCamera::new(SimulatedCameraConfig::default()));
//! let node = CameraNode::new(params, camera).unwrap();
//! node.init().unwrap();
//! let outcome = node.photometry().set_brightness(30.0, true, false).unwrap();
//! println!("reached brightness {:.1}", outcome.reached);
//! ```
pub mod capture;
pub mod commands;
pub mod config;
pub mod device;
pub mod errors;
pub mod hardware;
pub mod node;
pub mod photometry;
pub mod publisher;
pub mod types;

// Testing utilities - synthetic frames and the sensor model behind the simulated camera
pub mod testing;

pub use capture::{
    CaptureCoordinator, CoordinatorState, FrameStatus, GoalHandle, GoalOutcome, GrabImagesGoal,
    GrabImagesResult,
};
pub use config::{Bounds, CameraParameterSet};
pub use device::{CameraDevice, Control, SimulatedCamera, SimulatedCameraConfig};
pub use errors::CameraError;
pub use hardware::Hardware;
pub use node::{CameraNode, NodeStatus};
pub use photometry::{Convergence, ParameterOutcome, PhotometricController, PhotometricState};
pub use publisher::{ImagePublisher, ImageSubscription, PublishedImage};
pub use types::{CameraInfo, DeviceInfo, Frame, ImageEncoding};

#[cfg(feature = "hardware")]
pub use device::nokhwa::NokhwaCamera;

/// Initialize logging; `RUST_LOG` wins when set
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabcontrol=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        hardware_backend: cfg!(feature = "hardware"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub hardware_backend: bool,
}
