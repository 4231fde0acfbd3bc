//! Camera node: owns the device, the hardware lock and every component
//! built on top of them.

use crate::capture::{CaptureCoordinator, CoordinatorState};
use crate::config::CameraParameterSet;
use crate::device::CameraDevice;
use crate::errors::CameraError;
use crate::hardware::Hardware;
use crate::photometry::{PhotometricController, PhotometricState};
use crate::publisher::{ImagePublisher, ImageSubscription};
use crate::types::DeviceInfo;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Snapshot for status queries
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub device: DeviceInfo,
    pub state: CoordinatorState,
    pub photometry: PhotometricState,
    pub subscribers: usize,
    pub published: u64,
}

pub struct CameraNode {
    params: Arc<CameraParameterSet>,
    hardware: Arc<Hardware>,
    photometry: Arc<PhotometricController>,
    coordinator: Arc<CaptureCoordinator>,
    publisher: ImagePublisher,
}

impl CameraNode {
    /// Wire the components together. Parameters are validated here, so a bad
    /// parameter set never reaches the device.
    pub fn new(
        params: CameraParameterSet,
        device: Arc<dyn CameraDevice>,
    ) -> Result<Self, CameraError> {
        params.validate()?;
        let params = Arc::new(params);
        let hardware = Arc::new(Hardware::new(device));
        let photometry = Arc::new(PhotometricController::new(
            Arc::clone(&hardware),
            Arc::clone(&params),
        ));
        let coordinator = Arc::new(CaptureCoordinator::new(
            Arc::clone(&hardware),
            Arc::clone(&photometry),
            Arc::clone(&params),
        ));
        let publisher = ImagePublisher::new(params.camera_frame.clone());

        Ok(Self {
            params,
            hardware,
            photometry,
            coordinator,
            publisher,
        })
    }

    /// Open the device, wait for it and apply the configured start-up targets
    pub fn init(&self) -> Result<(), CameraError> {
        let device = self.hardware.device();
        device.open()?;

        let timeout = self.params.startup_timeout();
        if !self.coordinator.wait_for_camera(timeout) {
            return Err(CameraError::NotReady(format!(
                "camera not ready within {:?}",
                timeout
            )));
        }

        let info = device.info();
        log::info!(
            "Camera {} ({}) ready: {}x{} {}",
            info.id,
            info.model,
            info.width,
            info.height,
            info.encoding
        );

        let initial = &self.params.initial;
        if let Some(exposure) = initial.exposure {
            log_outcome("exposure", self.photometry.set_exposure(exposure)?.reached);
        }
        if let Some(gain) = initial.gain {
            log_outcome("gain", self.photometry.set_gain(gain)?.reached);
        }
        if let Some(gamma) = initial.gamma {
            log_outcome("gamma", self.photometry.set_gamma(gamma)?.reached);
        }
        if let Some(brightness) = initial.brightness {
            let outcome = self.photometry.set_brightness(
                brightness,
                self.params.exposure_auto,
                self.params.gain_auto,
            )?;
            log_outcome("brightness", outcome.reached);
        }
        self.photometry.refresh()?;
        Ok(())
    }

    /// Grab and publish one frame if anyone is listening and the camera is awake.
    ///
    /// Returns whether a frame was published.
    pub fn spin_once(&self) -> Result<bool, CameraError> {
        if !self.publisher.has_subscribers() || self.coordinator.is_sleeping() {
            return Ok(false);
        }
        let frame = self.coordinator.grab_image()?;
        self.publisher.publish(&frame);
        Ok(true)
    }

    /// Publish at the configured frame rate until `stop` is set.
    ///
    /// Grab failures are logged and the loop keeps going.
    pub fn spin(&self, stop: &AtomicBool) {
        let period = self.params.frame_period();
        log::info!("Publishing at {} Hz", self.params.frame_rate);

        while !stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            match self.spin_once() {
                Ok(_) => {}
                Err(e) if e.is_sleeping() => {}
                Err(e) => log::warn!("Publication grab failed: {}", e),
            }
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        log::info!("Publication stopped");
    }

    /// Cancel any running goal and close the device
    pub fn shutdown(&self) -> Result<(), CameraError> {
        self.coordinator.shutdown();
        let _guard = self.hardware.lock();
        self.hardware.device().close()?;
        log::info!("Camera closed");
        Ok(())
    }

    pub fn subscribe(&self, capacity: usize) -> ImageSubscription {
        self.publisher.subscribe(capacity)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            device: self.hardware.device().info(),
            state: self.coordinator.state(),
            photometry: self.photometry.state(),
            subscribers: self.publisher.subscriber_count(),
            published: self.publisher.published_count(),
        }
    }

    pub fn params(&self) -> &CameraParameterSet {
        &self.params
    }

    pub fn photometry(&self) -> &PhotometricController {
        &self.photometry
    }

    pub fn coordinator(&self) -> &Arc<CaptureCoordinator> {
        &self.coordinator
    }

    pub fn publisher(&self) -> &ImagePublisher {
        &self.publisher
    }
}

fn log_outcome(name: &str, reached: f64) {
    log::info!("Initial {} applied: reached {}", name, reached);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Bounds;
    use crate::device::{SimulatedCamera, SimulatedCameraConfig};
    use std::time::Duration;

    fn node(params: CameraParameterSet) -> (Arc<SimulatedCamera>, CameraNode) {
        let camera = Arc::new(SimulatedCamera::new(SimulatedCameraConfig::default()));
        let node = CameraNode::new(params, camera.clone()).unwrap();
        (camera, node)
    }

    #[test]
    fn test_invalid_params_fail_construction() {
        let params = CameraParameterSet {
            gain: Bounds::new(50.0, 10.0),
            ..Default::default()
        };
        let camera = Arc::new(SimulatedCamera::new(SimulatedCameraConfig::default()));
        assert!(CameraNode::new(params, camera).is_err());
    }

    #[test]
    fn test_init_applies_initial_targets() {
        let mut params = CameraParameterSet::default();
        params.initial.exposure = Some(1234.0);
        params.initial.gain = Some(10.0);
        let (camera, node) = node(params);
        node.init().unwrap();
        assert_eq!(camera.exposure().unwrap(), 1234.0);
        let gain = node.status().photometry.gain.unwrap();
        assert!((gain - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_spin_once_needs_a_subscriber() {
        let (camera, node) = node(CameraParameterSet::default());
        node.init().unwrap();
        assert!(!node.spin_once().unwrap());
        assert_eq!(camera.grab_calls(), 0);

        let sub = node.subscribe(2);
        assert!(node.spin_once().unwrap());
        let image = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(image.info.frame_id, "camera");
    }

    #[test]
    fn test_spin_once_skips_while_sleeping() {
        let (camera, node) = node(CameraParameterSet::default());
        node.init().unwrap();
        let _sub = node.subscribe(2);
        node.coordinator().set_sleeping(true).unwrap();
        assert!(!node.spin_once().unwrap());
        assert_eq!(camera.grab_calls(), 0);
    }

    #[test]
    fn test_shutdown_closes_device() {
        let (camera, node) = node(CameraParameterSet::default());
        node.init().unwrap();
        node.shutdown().unwrap();
        assert!(!camera.is_ready());
    }
}
