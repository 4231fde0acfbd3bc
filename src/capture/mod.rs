//! Capture coordination: single grabs, multi-frame goals and the sleep flag.
//!
//! Every hardware-touching path goes through the re-entrant hardware lock.
//! A multi-frame goal runs on its own worker thread and holds the lock for
//! its whole duration, so single grabs, parameter changes and brightness
//! searches queue behind it. At most one goal is active; a newer goal
//! cancels the older one and waits for it to finish before starting.

pub mod goal;

pub use goal::{
    CancelToken, FrameRecord, FrameStatus, GoalHandle, GoalOutcome, GrabImagesFeedback,
    GrabImagesGoal, GrabImagesResult, MAX_GOAL_FRAMES,
};

use crate::config::CameraParameterSet;
use crate::errors::CameraError;
use crate::hardware::{Hardware, HardwareGuard};
use crate::photometry::PhotometricController;
use crate::types::Frame;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    SingleGrabInProgress,
    MultiGrabInProgress,
    Sleeping,
}

struct ActiveGoal {
    id: Uuid,
    cancel: CancelToken,
    /// Disconnects when the worker exits
    finished: Receiver<()>,
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct CaptureCoordinator {
    hardware: Arc<Hardware>,
    photometry: Arc<PhotometricController>,
    params: Arc<CameraParameterSet>,
    single_grabs: AtomicUsize,
    capture_active: AtomicBool,
    active_goal: Mutex<Option<ActiveGoal>>,
    /// Serializes goal submission and preemption
    submit: Mutex<()>,
}

impl CaptureCoordinator {
    pub fn new(
        hardware: Arc<Hardware>,
        photometry: Arc<PhotometricController>,
        params: Arc<CameraParameterSet>,
    ) -> Self {
        Self {
            hardware,
            photometry,
            params,
            single_grabs: AtomicUsize::new(0),
            capture_active: AtomicBool::new(false),
            active_goal: Mutex::new(None),
            submit: Mutex::new(()),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        if self.hardware.is_sleeping() {
            CoordinatorState::Sleeping
        } else if self.capture_active.load(Ordering::SeqCst) {
            CoordinatorState::MultiGrabInProgress
        } else if self.single_grabs.load(Ordering::SeqCst) > 0 {
            CoordinatorState::SingleGrabInProgress
        } else {
            CoordinatorState::Idle
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.hardware.is_sleeping()
    }

    pub fn is_capture_in_progress(&self) -> bool {
        self.capture_active.load(Ordering::SeqCst)
    }

    /// Id of the goal currently running, if any
    pub fn active_goal(&self) -> Option<Uuid> {
        self.active_goal.lock().as_ref().map(|g| g.id)
    }

    /// Grab one frame with the configured timeout.
    ///
    /// Queues behind any running goal or search. The frame also refreshes
    /// the brightness estimate.
    pub fn grab_image(&self) -> Result<Frame, CameraError> {
        let _grab = CountGuard::enter(&self.single_grabs);
        let guard = self.hardware.lock();
        self.hardware.ensure_awake(&guard)?;

        let frame = self
            .hardware
            .device()
            .grab_frame(self.params.grab_timeout())?;
        self.photometry.observe_frame(&frame);
        log::debug!("Grabbed frame {} ({} bytes)", frame.sequence, frame.size_bytes());
        Ok(frame)
    }

    /// Set or clear the sleep flag.
    ///
    /// Refused while a multi-frame capture is active, including one that
    /// starts while this call is waiting. Otherwise waits for any single
    /// grab or search to release the hardware.
    pub fn set_sleeping(&self, sleeping: bool) -> Result<(), CameraError> {
        let poll = self.params.ready_poll_interval();
        loop {
            if self.capture_active.load(Ordering::SeqCst) {
                return Err(CameraError::CaptureInProgress(
                    "cannot change sleep state during a capture".to_string(),
                ));
            }
            let Some(guard) = self.hardware.try_lock_for(poll) else {
                continue;
            };
            // Still false under the lock: no goal owns the hardware
            if self.capture_active.load(Ordering::SeqCst) {
                return Err(CameraError::CaptureInProgress(
                    "cannot change sleep state during a capture".to_string(),
                ));
            }
            self.hardware.store_sleeping(&guard, sleeping);
            log::info!("Camera {}", if sleeping { "sleeping" } else { "awake" });
            return Ok(());
        }
    }

    /// Poll readiness at the configured interval without taking the hardware lock
    pub fn wait_for_camera(&self, timeout: Duration) -> bool {
        self.hardware
            .wait_for_camera(timeout, self.params.ready_poll_interval())
    }

    pub fn set_digital_output(&self, output_id: u32, value: bool) -> Result<(), CameraError> {
        let _guard = self.hardware.lock();
        self.hardware.device().set_digital_output(output_id, value)?;
        log::info!("Digital output {} set to {}", output_id, value);
        Ok(())
    }

    /// Start a multi-frame goal on a worker thread.
    ///
    /// Any goal still running is cancelled first; this call returns once it
    /// has finished and released the hardware.
    pub fn grab_images(self: &Arc<Self>, goal: GrabImagesGoal) -> GoalHandle {
        let _submit = self.submit.lock();
        self.preempt_active();

        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let (feedback_tx, feedback_rx) = unbounded();
        let (result_tx, result_rx) = bounded(1);
        let (finished_tx, finished_rx) = bounded::<()>(0);

        *self.active_goal.lock() = Some(ActiveGoal {
            id,
            cancel: cancel.clone(),
            finished: finished_rx,
        });

        let coordinator = Arc::clone(self);
        let worker_cancel = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name("crabcontrol-grab-images".to_string())
            .spawn(move || {
                let _finished = finished_tx;
                let result = coordinator.run_goal(id, &goal, &worker_cancel, &feedback_tx);
                coordinator.clear_active(id);
                log::info!(
                    "Goal {} finished: {:?}, {} frame(s)",
                    id,
                    result.outcome,
                    result.frames.len()
                );
                let _ = result_tx.send(result);
            });

        match spawned {
            Ok(worker) => GoalHandle::new(id, cancel, feedback_rx, result_rx, Some(worker)),
            Err(e) => {
                log::error!("Failed to spawn goal worker: {}", e);
                self.clear_active(id);
                let (tx, rx) = bounded(1);
                let _ = tx.send(GrabImagesResult::aborted(id, e.to_string()));
                GoalHandle::new(id, cancel, feedback_rx, rx, None)
            }
        }
    }

    /// Cancel the running goal, if any, and wait for it to finish
    pub fn cancel_active(&self) -> bool {
        let _submit = self.submit.lock();
        self.preempt_active()
    }

    pub fn shutdown(&self) {
        if self.cancel_active() {
            log::info!("Active capture cancelled on shutdown");
        }
    }

    fn preempt_active(&self) -> bool {
        let active = self.active_goal.lock().take();
        match active {
            Some(active) => {
                log::info!("Preempting goal {}", active.id);
                active.cancel.cancel();
                // Disconnects once the worker has dropped its sender
                let _ = active.finished.recv();
                true
            }
            None => false,
        }
    }

    fn clear_active(&self, id: Uuid) {
        let mut active = self.active_goal.lock();
        if active.as_ref().is_some_and(|g| g.id == id) {
            *active = None;
        }
    }

    /// Check override values against the configured bounds
    fn validate_goal(&self, goal: &GrabImagesGoal) -> Result<(), CameraError> {
        goal.validate()?;
        let params = &self.params;
        let lists = [
            ("exposure", &goal.exposure_times, params.exposure),
            ("gain", &goal.gain_values, params.gain),
            ("gamma", &goal.gamma_values, params.gamma),
            ("brightness", &goal.brightness_values, params.brightness),
        ];
        for (name, list, bounds) in lists {
            let Some(values) = list else { continue };
            if let Some(bad) = values.iter().find(|v| !v.is_finite() || !bounds.contains(**v)) {
                return Err(CameraError::ValidationError(format!(
                    "{name} {bad} outside [{}, {}]",
                    bounds.min, bounds.max
                )));
            }
        }
        Ok(())
    }

    fn run_goal(
        &self,
        id: Uuid,
        goal: &GrabImagesGoal,
        cancel: &CancelToken,
        feedback: &Sender<GrabImagesFeedback>,
    ) -> GrabImagesResult {
        if let Err(e) = self.validate_goal(goal) {
            log::warn!("Goal {} rejected: {}", id, e);
            return GrabImagesResult::rejected(id, e.to_string());
        }
        if self.hardware.is_sleeping() {
            return GrabImagesResult::rejected(id, CameraError::SleepingError.to_string());
        }
        if !self.wait_for_camera(self.params.startup_timeout()) {
            let e = CameraError::NotReady(format!(
                "not ready within {:?}",
                self.params.startup_timeout()
            ));
            log::warn!("Goal {} rejected: {}", id, e);
            return GrabImagesResult::rejected(id, e.to_string());
        }

        let guard = self.hardware.lock();
        if let Err(e) = self.hardware.ensure_awake(&guard) {
            return GrabImagesResult::rejected(id, e.to_string());
        }
        self.capture_active.store(true, Ordering::SeqCst);
        let _active = FlagGuard(&self.capture_active);

        let timeout = goal.frame_timeout(self.params.grab_timeout());
        log::info!("Goal {}: capturing {} frame(s)", id, goal.count);

        let mut frames = Vec::new();
        for index in 0..goal.count {
            if cancel.is_cancelled() {
                log::info!("Goal {} preempted after {} frame(s)", id, frames.len());
                return GrabImagesResult {
                    goal_id: id,
                    outcome: GoalOutcome::Preempted,
                    frames,
                    message: Some("cancelled".to_string()),
                };
            }

            frames.push(self.capture_frame(&guard, goal, index, timeout));
            let _ = feedback.send(GrabImagesFeedback {
                goal_id: id,
                frames_completed: index + 1,
                total: goal.count,
            });
        }

        let failed = frames.iter().filter(|r| !r.succeeded()).count();
        let (outcome, message) = if failed == 0 {
            (GoalOutcome::Succeeded, None)
        } else {
            (
                GoalOutcome::SucceededWithErrors,
                Some(format!("{failed} of {} frame(s) failed", goal.count)),
            )
        };
        GrabImagesResult {
            goal_id: id,
            outcome,
            frames,
            message,
        }
    }

    /// Apply this frame's overrides and grab it. Failures land in the record.
    fn capture_frame(
        &self,
        _guard: &HardwareGuard<'_>,
        goal: &GrabImagesGoal,
        index: u32,
        timeout: Duration,
    ) -> FrameRecord {
        let mut record = FrameRecord::new(index);
        let i = index as usize;

        if let Err(e) = self.apply_overrides(goal, i, &mut record) {
            log::warn!("Frame {}: parameter override failed: {}", index, e);
            record.status = FrameStatus::Failed(e.to_string());
            return record;
        }

        match self.hardware.device().grab_frame(timeout) {
            Ok(frame) => {
                self.photometry.observe_frame(&frame);
                record.frame = Some(frame);
            }
            Err(e) if e.is_timeout() => {
                log::warn!("Frame {} timed out after {:?}", index, timeout);
                record.status = FrameStatus::TimedOut;
            }
            Err(e) => {
                log::warn!("Frame {} failed: {}", index, e);
                record.status = FrameStatus::Failed(e.to_string());
            }
        }
        record
    }

    fn apply_overrides(
        &self,
        goal: &GrabImagesGoal,
        i: usize,
        record: &mut FrameRecord,
    ) -> Result<(), CameraError> {
        let value_at = |list: &Option<Vec<f64>>| list.as_ref().and_then(|v| v.get(i).copied());

        if let Some(exposure) = value_at(&goal.exposure_times) {
            record.reached_exposure = Some(self.photometry.set_exposure(exposure)?.reached);
        }
        if let Some(gain) = value_at(&goal.gain_values) {
            record.reached_gain = Some(self.photometry.set_gain(gain)?.reached);
        }
        if let Some(gamma) = value_at(&goal.gamma_values) {
            record.reached_gamma = Some(self.photometry.set_gamma(gamma)?.reached);
        }
        if let Some(brightness) = value_at(&goal.brightness_values) {
            let outcome =
                self.photometry
                    .set_brightness(brightness, goal.exposure_auto, goal.gain_auto)?;
            record.reached_brightness = Some(outcome.reached);
            let state = self.photometry.state();
            record.reached_exposure = state.exposure;
            record.reached_gain = state.gain;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CameraDevice, DeviceFault, SimulatedCamera, SimulatedCameraConfig};

    fn coordinator(
        config: SimulatedCameraConfig,
    ) -> (Arc<SimulatedCamera>, Arc<CaptureCoordinator>) {
        let camera = Arc::new(SimulatedCamera::new(config));
        camera.open().unwrap();
        let hardware = Arc::new(Hardware::new(camera.clone()));
        let params = Arc::new(CameraParameterSet::default());
        let photometry = Arc::new(PhotometricController::new(hardware.clone(), params.clone()));
        (camera, Arc::new(CaptureCoordinator::new(hardware, photometry, params)))
    }

    #[test]
    fn test_single_grab_updates_brightness() {
        let (_, coord) = coordinator(SimulatedCameraConfig::default());
        let frame = coord.grab_image().unwrap();
        assert_eq!(frame.sequence, 1);
        assert!(coord.photometry.current_brightness().is_some());
        assert_eq!(coord.state(), CoordinatorState::Idle);
    }

    #[test]
    fn test_sleeping_refuses_grab_without_device_call() {
        let (camera, coord) = coordinator(SimulatedCameraConfig::default());
        coord.set_sleeping(true).unwrap();
        assert_eq!(coord.state(), CoordinatorState::Sleeping);
        assert!(coord.grab_image().unwrap_err().is_sleeping());
        assert_eq!(camera.grab_calls(), 0);

        coord.set_sleeping(false).unwrap();
        assert!(coord.grab_image().is_ok());
    }

    #[test]
    fn test_goal_with_exposures_records_reached_values() {
        let (_, coord) = coordinator(SimulatedCameraConfig::default());
        let goal =
            GrabImagesGoal::with_exposures(vec![100.0, 200.0, 300.0], Duration::from_secs(1));
        let result = coord.grab_images(goal).wait();
        assert_eq!(result.outcome, GoalOutcome::Succeeded);
        let reached: Vec<_> = result.frames.iter().map(|r| r.reached_exposure).collect();
        assert_eq!(reached, vec![Some(100.0), Some(200.0), Some(300.0)]);
    }

    #[test]
    fn test_mismatched_override_list_rejected() {
        let (camera, coord) = coordinator(SimulatedCameraConfig::default());
        let goal = GrabImagesGoal::new(3, Duration::from_secs(1)).gains(vec![1.0, 2.0]);
        let result = coord.grab_images(goal).wait();
        assert_eq!(result.outcome, GoalOutcome::Rejected);
        assert!(result.frames.is_empty());
        assert_eq!(camera.device_calls(), 0);
    }

    #[test]
    fn test_oversized_goal_rejected_before_capture() {
        let (camera, coord) = coordinator(SimulatedCameraConfig::default());
        let result = coord
            .grab_images(GrabImagesGoal::new(u32::MAX, Duration::from_millis(100)))
            .wait();
        assert_eq!(result.outcome, GoalOutcome::Rejected);
        assert!(result.frames.is_empty());
        assert_eq!(camera.grab_calls(), 0);

        let result = coord
            .grab_images(GrabImagesGoal::new(MAX_GOAL_FRAMES + 1, Duration::from_millis(100)))
            .wait();
        assert_eq!(result.outcome, GoalOutcome::Rejected);
        assert_eq!(coord.state(), CoordinatorState::Idle);
    }

    #[test]
    fn test_sleep_request_racing_a_goal_for_the_lock() {
        let (_, coord) = coordinator(SimulatedCameraConfig::default().with_frame_rate(30.0));
        let held = coord.hardware.lock();
        let handle = coord.grab_images(GrabImagesGoal::new(5, Duration::from_secs(1)));
        let sleeper = {
            let coord = Arc::clone(&coord);
            std::thread::spawn(move || coord.set_sleeping(true))
        };
        // Both the goal worker and the sleep request now wait on the lock
        std::thread::sleep(Duration::from_millis(50));
        drop(held);

        let slept = sleeper.join().unwrap();
        let result = handle.wait();
        match slept {
            Ok(()) => assert_eq!(result.outcome, GoalOutcome::Rejected),
            Err(e) => {
                assert!(matches!(e, CameraError::CaptureInProgress(_)), "{e}");
                assert_eq!(result.outcome, GoalOutcome::Succeeded);
                assert!(!coord.is_sleeping());
            }
        }
    }

    #[test]
    fn test_out_of_bounds_override_rejected() {
        let (_, coord) = coordinator(SimulatedCameraConfig::default());
        let goal = GrabImagesGoal::new(2, Duration::from_secs(1)).gains(vec![10.0, 150.0]);
        assert_eq!(coord.grab_images(goal).wait().outcome, GoalOutcome::Rejected);
    }

    #[test]
    fn test_goal_rejected_while_sleeping() {
        let (_, coord) = coordinator(SimulatedCameraConfig::default());
        coord.set_sleeping(true).unwrap();
        let result = coord
            .grab_images(GrabImagesGoal::new(2, Duration::from_secs(1)))
            .wait();
        assert_eq!(result.outcome, GoalOutcome::Rejected);
    }

    #[test]
    fn test_device_error_recorded_per_frame() {
        let (camera, coord) = coordinator(SimulatedCameraConfig::default());
        camera.inject_fault(1, DeviceFault::Device("crc".into()));
        let result = coord
            .grab_images(GrabImagesGoal::new(3, Duration::from_secs(1)))
            .wait();
        assert_eq!(result.outcome, GoalOutcome::SucceededWithErrors);
        assert_eq!(result.success_flags(), vec![true, false, true]);
        assert_eq!(result.frames[1].status, FrameStatus::Failed("Device error: crc".into()));
    }

    #[test]
    fn test_digital_output_goes_to_device() {
        let (camera, coord) = coordinator(SimulatedCameraConfig::default());
        coord.set_digital_output(1, true).unwrap();
        assert_eq!(camera.digital_output(1), Some(true));
        assert!(coord.set_digital_output(7, true).is_err());
    }
}
