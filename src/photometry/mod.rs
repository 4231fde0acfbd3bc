//! Photometric controller
//!
//! Converts high-level targets into device parameters: the single-parameter
//! setters with reached-value feedback, and the brightness search that
//! drives exposure and/or gain until the mean intensity of a fresh frame
//! matches a target.
//!
//! Every device-touching method takes the hardware lock for its whole
//! duration. The lock is re-entrant, so the capture coordinator can call in
//! here while it already holds it.

pub mod brightness;
pub mod search;

pub use brightness::calc_brightness;
pub use search::{narrow, BrightnessSearch, Probe, SearchInterval, SearchStatus};

use crate::config::{Bounds, CameraParameterSet};
use crate::device::{write_control, Control};
use crate::errors::CameraError;
use crate::hardware::{Hardware, HardwareGuard};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Whether a setter reached its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Convergence {
    Reached,
    /// Budget exhausted or device limits hit; `reached` is the best effort
    Partial,
}

/// Result of a successful setter call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterOutcome {
    pub target: f64,
    pub reached: f64,
    pub convergence: Convergence,
}

impl ParameterOutcome {
    pub fn is_reached(&self) -> bool {
        self.convergence == Convergence::Reached
    }
}

/// Last known device state as seen by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhotometricState {
    pub exposure: Option<f64>,
    pub gain: Option<f64>,
    pub gamma: Option<f64>,
    /// Mean intensity of the most recent frame
    pub brightness: Option<f64>,
    pub target_brightness: Option<f64>,
    pub search_in_progress: bool,
}

/// Clears the in-progress flag however the search ends.
struct SearchGuard<'a>(&'a Mutex<PhotometricState>);

impl Drop for SearchGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().search_in_progress = false;
    }
}

pub struct PhotometricController {
    hardware: Arc<Hardware>,
    params: Arc<CameraParameterSet>,
    state: Mutex<PhotometricState>,
}

impl PhotometricController {
    pub fn new(hardware: Arc<Hardware>, params: Arc<CameraParameterSet>) -> Self {
        Self {
            hardware,
            params,
            state: Mutex::new(PhotometricState::default()),
        }
    }

    pub fn state(&self) -> PhotometricState {
        self.state.lock().clone()
    }

    pub fn is_search_in_progress(&self) -> bool {
        self.state.lock().search_in_progress
    }

    /// Mean intensity of the most recently observed frame
    pub fn current_brightness(&self) -> Option<f64> {
        self.state.lock().brightness
    }

    /// Update the brightness estimate from a frame grabbed elsewhere
    pub fn observe_frame(&self, frame: &crate::types::Frame) {
        match calc_brightness(frame) {
            Ok(b) => self.state.lock().brightness = Some(b),
            Err(e) => log::debug!("Frame {} skipped for brightness: {}", frame.sequence, e),
        }
    }

    /// Read exposure, gain and gamma back from the device
    pub fn refresh(&self) -> Result<PhotometricState, CameraError> {
        let _guard = self.hardware.lock();
        let device = self.hardware.device();
        let (exposure, gain, gamma) = (device.exposure()?, device.gain()?, device.gamma()?);
        let mut state = self.state.lock();
        state.exposure = Some(exposure);
        state.gain = Some(gain);
        state.gamma = Some(gamma);
        Ok(state.clone())
    }

    pub fn set_exposure(&self, target: f64) -> Result<ParameterOutcome, CameraError> {
        self.set_control(Control::Exposure, target, self.params.exposure)
    }

    /// Gain in percent of the device's native range
    pub fn set_gain(&self, target_percent: f64) -> Result<ParameterOutcome, CameraError> {
        self.set_control(Control::Gain, target_percent, self.params.gain)
    }

    pub fn set_gamma(&self, target: f64) -> Result<ParameterOutcome, CameraError> {
        self.set_control(Control::Gamma, target, self.params.gamma)
    }

    fn set_control(
        &self,
        control: Control,
        target: f64,
        bounds: Bounds,
    ) -> Result<ParameterOutcome, CameraError> {
        if !target.is_finite() || !bounds.contains(target) {
            return Err(CameraError::ValidationError(format!(
                "{control} target {target} outside [{}, {}]",
                bounds.min, bounds.max
            )));
        }

        let guard = self.hardware.lock();
        self.hardware.ensure_awake(&guard)?;

        let device = self.hardware.device();
        let reached = write_control(device, control, target)?;
        self.record(control, reached);

        let tolerance = device.control_step(control) + f64::EPSILON;
        let convergence = if (reached - target).abs() <= tolerance {
            Convergence::Reached
        } else {
            log::warn!(
                "{} target {} not reached, device settled at {}",
                control,
                target,
                reached
            );
            Convergence::Partial
        };
        log::debug!("Set {} to {} (reached {})", control, target, reached);

        Ok(ParameterOutcome {
            target,
            reached,
            convergence,
        })
    }

    /// Drive exposure and/or gain until a fresh frame's mean intensity is
    /// within tolerance of `target`.
    ///
    /// Targets inside the device's native band use its one-shot auto routine
    /// when available; everything else, and any native attempt that misses,
    /// goes through the bisection search. Exposure is searched first, gain
    /// then trims any residual error. Running out of budget is a
    /// [`Convergence::Partial`] outcome, not an error.
    pub fn set_brightness(
        &self,
        target: f64,
        exposure_auto: bool,
        gain_auto: bool,
    ) -> Result<ParameterOutcome, CameraError> {
        let bounds = self.params.brightness;
        if !target.is_finite() || !bounds.contains(target) {
            return Err(CameraError::ValidationError(format!(
                "brightness target {target} outside [{}, {}]",
                bounds.min, bounds.max
            )));
        }
        if !exposure_auto && !gain_auto {
            return Err(CameraError::ValidationError(
                "brightness search needs exposure_auto or gain_auto".to_string(),
            ));
        }

        let guard = self.hardware.lock();
        self.hardware.ensure_awake(&guard)?;

        {
            let mut state = self.state.lock();
            state.search_in_progress = true;
            state.target_brightness = Some(target);
        }
        let _search = SearchGuard(&self.state);

        let config = &self.params.brightness_search;
        let deadline = Instant::now() + config.timeout();
        log::info!(
            "Brightness search: target {} (exposure_auto={}, gain_auto={})",
            target,
            exposure_auto,
            gain_auto
        );

        let current = self.measure(&guard)?;
        if (current - target).abs() <= config.tolerance {
            log::info!("Brightness {:.1} already within tolerance", current);
            return Ok(ParameterOutcome {
                target,
                reached: current,
                convergence: Convergence::Reached,
            });
        }

        if config.native_band.contains(target) {
            match self
                .hardware
                .device()
                .auto_brightness_once(target, exposure_auto, gain_auto)
            {
                Ok(()) => {
                    self.refresh()?;
                    let reached = self.measure(&guard)?;
                    if (reached - target).abs() <= config.tolerance {
                        log::info!("Native auto brightness reached {:.1}", reached);
                        return Ok(ParameterOutcome {
                            target,
                            reached,
                            convergence: Convergence::Reached,
                        });
                    }
                    log::info!(
                        "Native auto brightness settled at {:.1}, falling back to search",
                        reached
                    );
                }
                Err(CameraError::UnsupportedOperation(_)) => {
                    log::debug!("No native auto brightness, using extended search");
                }
                Err(e) => return Err(e),
            }
        }

        let mut outcome = None;
        if exposure_auto {
            let bounds = self.params.exposure;
            outcome = Some(self.search(&guard, Control::Exposure, bounds, target, deadline)?);
        }
        let needs_gain = outcome.map_or(true, |o: ParameterOutcome| !o.is_reached());
        if gain_auto && needs_gain {
            outcome = Some(self.search(&guard, Control::Gain, self.params.gain, target, deadline)?);
        }

        // At least one of the two searches ran
        let outcome = outcome.ok_or_else(|| {
            CameraError::ValidationError("no searchable parameter".to_string())
        })?;
        match outcome.convergence {
            Convergence::Reached => log::info!("Brightness {:.1} reached", outcome.reached),
            Convergence::Partial => log::warn!(
                "Brightness search exhausted: target {}, best {:.1}",
                target,
                outcome.reached
            ),
        }
        Ok(outcome)
    }

    fn search(
        &self,
        guard: &HardwareGuard<'_>,
        control: Control,
        bounds: Bounds,
        target: f64,
        deadline: Instant,
    ) -> Result<ParameterOutcome, CameraError> {
        let config = &self.params.brightness_search;
        let device = self.hardware.device();
        let mut search = BrightnessSearch::new(
            bounds,
            target,
            config.tolerance,
            config.max_iterations,
            device.control_step(control),
        );

        while let Some(value) = search.next_probe() {
            if Instant::now() >= deadline {
                log::warn!("Brightness search over {} hit its time limit", control);
                break;
            }
            let reached = write_control(device, control, value)?;
            self.record(control, reached);
            let brightness = self.measure(guard)?;
            let status = search.observe(reached, brightness);
            log::debug!(
                "Search {} iteration {}: {} -> {:.1} ({:?})",
                control,
                search.iterations(),
                reached,
                brightness,
                status
            );
        }

        if search.status() == SearchStatus::Converged {
            let last = search.last().map_or(0.0, |p| p.brightness);
            return Ok(ParameterOutcome {
                target,
                reached: last,
                convergence: Convergence::Reached,
            });
        }

        let Some(best) = search.best() else {
            return Ok(ParameterOutcome {
                target,
                reached: self.current_brightness().unwrap_or(0.0),
                convergence: Convergence::Partial,
            });
        };
        if search.last().map(|p| p.value) != Some(best.value) {
            let reached = write_control(device, control, best.value)?;
            self.record(control, reached);
        }
        self.state.lock().brightness = Some(best.brightness);
        Ok(ParameterOutcome {
            target,
            reached: best.brightness,
            convergence: Convergence::Partial,
        })
    }

    /// Grab a frame under the held lock and return its mean intensity
    fn measure(&self, guard: &HardwareGuard<'_>) -> Result<f64, CameraError> {
        self.hardware.ensure_awake(guard)?;
        let frame = self
            .hardware
            .device()
            .grab_frame(self.params.grab_timeout())?;
        let brightness = calc_brightness(&frame)?;
        self.state.lock().brightness = Some(brightness);
        Ok(brightness)
    }

    fn record(&self, control: Control, reached: f64) {
        let mut state = self.state.lock();
        match control {
            Control::Exposure => state.exposure = Some(reached),
            Control::Gain => state.gain = Some(reached),
            Control::Gamma => state.gamma = Some(reached),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CameraDevice, SimulatedCamera, SimulatedCameraConfig};
    use std::time::Duration;

    fn controller(config: SimulatedCameraConfig) -> (Arc<SimulatedCamera>, PhotometricController) {
        let camera = Arc::new(SimulatedCamera::new(config));
        camera.open().unwrap();
        let hardware = Arc::new(Hardware::new(camera.clone()));
        let params = Arc::new(CameraParameterSet::default());
        (camera, PhotometricController::new(hardware, params))
    }

    #[test]
    fn test_set_exposure_reports_reached_value() {
        let (_, ctl) = controller(SimulatedCameraConfig::default());
        let outcome = ctl.set_exposure(2500.0).unwrap();
        assert!(outcome.is_reached());
        assert_eq!(outcome.reached, 2500.0);
        assert_eq!(ctl.state().exposure, Some(2500.0));
    }

    #[test]
    fn test_reached_within_one_device_step() {
        let (_, ctl) = controller(SimulatedCameraConfig {
            gamma_step: 0.5,
            ..Default::default()
        });
        let outcome = ctl.set_gamma(1.2).unwrap();
        assert_eq!(outcome.reached, 1.0);
        assert!(outcome.is_reached());
    }

    #[test]
    fn test_device_limit_is_partial_not_error() {
        let (_, ctl) = controller(SimulatedCameraConfig {
            exposure_range: Bounds::new(10.0, 50_000.0),
            ..Default::default()
        });
        let outcome = ctl.set_exposure(80_000.0).unwrap();
        assert_eq!(outcome.convergence, Convergence::Partial);
        assert_eq!(outcome.reached, 50_000.0);
    }

    #[test]
    fn test_gain_out_of_bounds_rejected_before_device() {
        let (camera, ctl) = controller(SimulatedCameraConfig::default());
        let err = ctl.set_gain(150.0).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(camera.device_calls(), 0);
    }

    #[test]
    fn test_brightness_in_native_band_uses_device_routine() {
        let (camera, ctl) = controller(SimulatedCameraConfig {
            native_auto_brightness: true,
            ..Default::default()
        });
        let outcome = ctl.set_brightness(120.0, true, false).unwrap();
        assert!(outcome.is_reached());
        assert!((outcome.reached - 120.0).abs() <= 1.0);
        // one measurement before, one after the native routine
        assert_eq!(camera.grab_calls(), 2);
    }

    #[test]
    fn test_extended_search_for_dark_target() {
        let (_, ctl) = controller(SimulatedCameraConfig::default());
        let outcome = ctl.set_brightness(20.0, true, false).unwrap();
        assert!(outcome.is_reached(), "{outcome:?}");
        assert!((outcome.reached - 20.0).abs() <= 1.0);
        assert!(!ctl.is_search_in_progress());
        assert_eq!(ctl.state().target_brightness, Some(20.0));
    }

    #[test]
    fn test_gain_trims_when_exposure_cannot_reach() {
        let (_, ctl) = controller(SimulatedCameraConfig {
            sensor: crate::testing::SyntheticSensor {
                radiance: 0.001,
                ..Default::default()
            },
            ..Default::default()
        });
        // Max exposure 100 ms gives ~100 at unit gain; 250 needs gain.
        let outcome = ctl.set_brightness(250.0, true, true).unwrap();
        assert!(outcome.is_reached(), "{outcome:?}");
        assert!(ctl.state().gain.unwrap() > 0.0);
    }

    #[test]
    fn test_unreachable_target_is_partial() {
        let (_, ctl) = controller(SimulatedCameraConfig {
            sensor: crate::testing::SyntheticSensor {
                radiance: 0.0005,
                ..Default::default()
            },
            ..Default::default()
        });
        let outcome = ctl.set_brightness(250.0, true, false).unwrap();
        assert_eq!(outcome.convergence, Convergence::Partial);
        assert!(outcome.reached < 250.0);
        assert!(ctl.state().exposure.unwrap() > 99_000.0);
    }

    #[test]
    fn test_brightness_requires_a_search_parameter() {
        let (camera, ctl) = controller(SimulatedCameraConfig::default());
        assert!(ctl.set_brightness(100.0, false, false).unwrap_err().is_validation());
        assert!(ctl.set_brightness(0.0, true, false).unwrap_err().is_validation());
        assert_eq!(camera.device_calls(), 0);
    }

    #[test]
    fn test_grab_timeout_aborts_search() {
        let (camera, ctl) = controller(SimulatedCameraConfig {
            frame_interval: Duration::from_secs(5),
            ..Default::default()
        });
        let mut params = CameraParameterSet::default();
        params.grab_timeout_ms = 10;
        let ctl = PhotometricController::new(ctl.hardware.clone(), Arc::new(params));
        let err = ctl.set_brightness(20.0, true, false).unwrap_err();
        assert!(err.is_timeout());
        assert!(!ctl.is_search_in_progress());
        assert_eq!(camera.frame_counter(), 0);
    }
}
