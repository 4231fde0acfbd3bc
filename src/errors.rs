use std::time::Duration;
use thiserror::Error;

/// Errors produced by the camera coordinator and the devices behind it.
///
/// Device-level failures terminate only the in-flight operation; none of
/// these variants is fatal to the process.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Hardware or communication failure reported by the device.
    #[error("Device error: {0}")]
    DeviceError(String),
    /// A single grab or device call exceeded its bound.
    #[error("Timed out after {0:?}")]
    TimeoutError(Duration),
    /// The camera is in sleep state; the request was refused without touching hardware.
    #[error("Camera is sleeping")]
    SleepingError,
    /// Input outside the configured bounds, rejected before any device call.
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// The camera did not report ready within the allowed wait.
    #[error("Camera not ready: {0}")]
    NotReady(String),
    /// Refused because a multi-frame capture currently owns the camera.
    #[error("Capture in progress: {0}")]
    CaptureInProgress(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// The parameter set could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl CameraError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CameraError::TimeoutError(_))
    }

    pub fn is_sleeping(&self) -> bool {
        matches!(self, CameraError::SleepingError)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CameraError::ValidationError(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, CameraError::UnsupportedOperation(_))
    }
}

impl From<config::ConfigError> for CameraError {
    fn from(e: config::ConfigError) -> Self {
        CameraError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            CameraError::DeviceError("usb reset".to_string()).to_string(),
            "Device error: usb reset"
        );
        assert_eq!(CameraError::SleepingError.to_string(), "Camera is sleeping");
        assert!(CameraError::TimeoutError(Duration::from_millis(250))
            .to_string()
            .contains("250ms"));
    }

    #[test]
    fn test_predicates() {
        assert!(CameraError::TimeoutError(Duration::ZERO).is_timeout());
        assert!(CameraError::SleepingError.is_sleeping());
        assert!(CameraError::ValidationError("x".into()).is_validation());
        assert!(CameraError::UnsupportedOperation("x".into()).is_unsupported());
        assert!(!CameraError::DeviceError("x".into()).is_timeout());
    }
}
