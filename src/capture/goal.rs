//! Grab-images goal, its feedback and terminal result.

use crate::errors::CameraError;
use crate::types::Frame;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

/// Largest frame count a single goal may request
pub const MAX_GOAL_FRAMES: u32 = 10_000;

/// Request for `count` frames, optionally with per-frame parameter overrides.
///
/// Every given override list must have exactly `count` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrabImagesGoal {
    pub count: u32,
    pub exposure_times: Option<Vec<f64>>,
    pub gain_values: Option<Vec<f64>>,
    pub gamma_values: Option<Vec<f64>>,
    pub brightness_values: Option<Vec<f64>>,
    /// Used with `brightness_values`
    pub exposure_auto: bool,
    pub gain_auto: bool,
    /// Per-frame grab timeout; 0 selects the configured default
    pub frame_timeout_ms: u64,
}

impl GrabImagesGoal {
    pub fn new(count: u32, frame_timeout: Duration) -> Self {
        Self {
            count,
            frame_timeout_ms: frame_timeout.as_millis() as u64,
            exposure_auto: true,
            ..Default::default()
        }
    }

    /// One frame per exposure time
    pub fn with_exposures(exposures: Vec<f64>, frame_timeout: Duration) -> Self {
        let mut goal = Self::new(exposures.len() as u32, frame_timeout);
        goal.exposure_times = Some(exposures);
        goal
    }

    pub fn gains(mut self, gains: Vec<f64>) -> Self {
        self.gain_values = Some(gains);
        self
    }

    pub fn gammas(mut self, gammas: Vec<f64>) -> Self {
        self.gamma_values = Some(gammas);
        self
    }

    pub fn brightnesses(mut self, values: Vec<f64>, exposure_auto: bool, gain_auto: bool) -> Self {
        self.brightness_values = Some(values);
        self.exposure_auto = exposure_auto;
        self.gain_auto = gain_auto;
        self
    }

    pub fn frame_timeout(&self, default: Duration) -> Duration {
        if self.frame_timeout_ms == 0 {
            default
        } else {
            Duration::from_millis(self.frame_timeout_ms)
        }
    }

    /// Structural checks: non-zero count and override list lengths
    pub fn validate(&self) -> Result<(), CameraError> {
        if self.count == 0 {
            return Err(CameraError::ValidationError(
                "goal requests zero frames".to_string(),
            ));
        }
        if self.count > MAX_GOAL_FRAMES {
            return Err(CameraError::ValidationError(format!(
                "goal requests {} frames, at most {MAX_GOAL_FRAMES} allowed",
                self.count
            )));
        }
        let lists = [
            ("exposure_times", &self.exposure_times),
            ("gain_values", &self.gain_values),
            ("gamma_values", &self.gamma_values),
            ("brightness_values", &self.brightness_values),
        ];
        for (name, list) in lists {
            if let Some(values) = list {
                if values.len() != self.count as usize {
                    return Err(CameraError::ValidationError(format!(
                        "{name} has {} entries for {} frames",
                        values.len(),
                        self.count
                    )));
                }
            }
        }
        if self.brightness_values.is_some() && !self.exposure_auto && !self.gain_auto {
            return Err(CameraError::ValidationError(
                "brightness_values need exposure_auto or gain_auto".to_string(),
            ));
        }
        Ok(())
    }
}

/// Progress report sent after every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GrabImagesFeedback {
    pub goal_id: Uuid,
    pub frames_completed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FrameStatus {
    Ok,
    TimedOut,
    Failed(String),
}

/// Outcome of one requested frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub index: u32,
    pub frame: Option<Frame>,
    pub status: FrameStatus,
    pub reached_exposure: Option<f64>,
    pub reached_gain: Option<f64>,
    pub reached_gamma: Option<f64>,
    pub reached_brightness: Option<f64>,
}

impl FrameRecord {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            frame: None,
            status: FrameStatus::Ok,
            reached_exposure: None,
            reached_gain: None,
            reached_gamma: None,
            reached_brightness: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == FrameStatus::Ok && self.frame.is_some()
    }
}

/// Terminal state of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GoalOutcome {
    Succeeded,
    /// Ran to completion, but some frames failed
    SucceededWithErrors,
    /// Cancelled, explicitly or by a newer goal
    Preempted,
    /// Refused before any frame was taken
    Rejected,
    /// The goal worker was lost
    Aborted,
}

impl GoalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GoalOutcome::Succeeded | GoalOutcome::SucceededWithErrors)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GrabImagesResult {
    pub goal_id: Uuid,
    pub outcome: GoalOutcome,
    pub frames: Vec<FrameRecord>,
    pub message: Option<String>,
}

impl GrabImagesResult {
    pub fn rejected(goal_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            goal_id,
            outcome: GoalOutcome::Rejected,
            frames: Vec::new(),
            message: Some(reason.into()),
        }
    }

    pub fn aborted(goal_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            goal_id,
            outcome: GoalOutcome::Aborted,
            frames: Vec::new(),
            message: Some(reason.into()),
        }
    }

    /// Successfully grabbed frames, in request order
    pub fn images(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().filter_map(|r| r.frame.as_ref())
    }

    pub fn success_flags(&self) -> Vec<bool> {
        self.frames.iter().map(FrameRecord::succeeded).collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.frames.iter().all(FrameRecord::succeeded)
    }
}

/// Cooperative cancellation flag, checked at frame boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller's side of a running goal.
pub struct GoalHandle {
    id: Uuid,
    cancel: CancelToken,
    feedback: Receiver<GrabImagesFeedback>,
    result: Receiver<GrabImagesResult>,
    worker: Option<JoinHandle<()>>,
}

impl GoalHandle {
    pub(crate) fn new(
        id: Uuid,
        cancel: CancelToken,
        feedback: Receiver<GrabImagesFeedback>,
        result: Receiver<GrabImagesResult>,
        worker: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            cancel,
            feedback,
            result,
            worker,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation; the capture stops before its next frame
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn feedback(&self) -> &Receiver<GrabImagesFeedback> {
        &self.feedback
    }

    /// Block until the terminal result is available
    pub fn wait(mut self) -> GrabImagesResult {
        let result = self
            .result
            .recv()
            .unwrap_or_else(|_| GrabImagesResult::aborted(self.id, "goal worker exited"));
        self.join_worker();
        result
    }

    /// Terminal result if it arrives within `timeout`
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<GrabImagesResult> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => {
                self.join_worker();
                Some(result)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.join_worker();
                Some(GrabImagesResult::aborted(self.id, "goal worker exited"))
            }
        }
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Goal worker {} panicked", self.id);
            }
        }
    }
}
