//! Device facade
//!
//! Thin synchronous interface over the physical camera. Calls block up to the
//! device's own I/O bound and never retry; retry policy belongs to callers.
//! Implementations must be internally synchronized so that readiness can be
//! polled without holding the coordinator's hardware lock.

pub mod simulated;

#[cfg(feature = "hardware")]
pub mod nokhwa;

use crate::errors::CameraError;
use crate::types::{DeviceInfo, Frame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use simulated::{DeviceFault, SimulatedCamera, SimulatedCameraConfig};

/// A device parameter addressed by the photometric controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Control {
    Exposure,
    Gain,
    Gamma,
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Control::Exposure => "exposure",
            Control::Gain => "gain",
            Control::Gamma => "gamma",
        };
        f.write_str(name)
    }
}

pub trait CameraDevice: Send + Sync {
    fn open(&self) -> Result<(), CameraError>;

    fn close(&self) -> Result<(), CameraError>;

    fn is_ready(&self) -> bool;

    fn info(&self) -> DeviceInfo;

    /// Grab one frame. A successful grab advances the device frame counter,
    /// which is carried in [`Frame::sequence`].
    fn grab_frame(&self, timeout: Duration) -> Result<Frame, CameraError>;

    /// Exposure time in microseconds
    fn exposure(&self) -> Result<f64, CameraError>;

    /// Write an exposure time and return the value the device actually reached
    fn set_exposure(&self, value: f64) -> Result<f64, CameraError>;

    /// Gain in percent of the native range
    fn gain(&self) -> Result<f64, CameraError>;

    fn set_gain(&self, percent: f64) -> Result<f64, CameraError>;

    fn gamma(&self) -> Result<f64, CameraError>;

    fn set_gamma(&self, value: f64) -> Result<f64, CameraError>;

    /// Smallest distinguishable change of a control; a reached value within
    /// one step of its target counts as reached.
    fn control_step(&self, control: Control) -> f64 {
        match control {
            Control::Exposure => 1.0,
            Control::Gain => 0.5,
            Control::Gamma => 0.01,
        }
    }

    fn set_digital_output(&self, output_id: u32, value: bool) -> Result<(), CameraError> {
        let _ = value;
        Err(CameraError::UnsupportedOperation(format!(
            "digital output {output_id} not available on this device"
        )))
    }

    /// Run the device's native one-shot brightness routine.
    ///
    /// Only meaningful for targets inside the device's convergence band.
    fn auto_brightness_once(
        &self,
        target: f64,
        exposure_auto: bool,
        gain_auto: bool,
    ) -> Result<(), CameraError> {
        let _ = (target, exposure_auto, gain_auto);
        Err(CameraError::UnsupportedOperation(
            "native auto brightness not available".to_string(),
        ))
    }
}

/// Write `value` to `control`, returning the reached value
pub fn write_control(
    device: &dyn CameraDevice,
    control: Control,
    value: f64,
) -> Result<f64, CameraError> {
    match control {
        Control::Exposure => device.set_exposure(value),
        Control::Gain => device.set_gain(value),
        Control::Gamma => device.set_gamma(value),
    }
}
