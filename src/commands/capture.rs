use crate::capture::{FrameRecord, GoalHandle, GoalOutcome, GrabImagesGoal, GrabImagesResult};
use crate::node::CameraNode;
use crate::types::Frame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Plain success/failure reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Multi-frame capture request; each override list needs one entry per frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrabImagesRequest {
    pub count: u32,
    #[serde(default)]
    pub exposure_times: Option<Vec<f64>>,
    #[serde(default)]
    pub gain_values: Option<Vec<f64>>,
    #[serde(default)]
    pub gamma_values: Option<Vec<f64>>,
    #[serde(default)]
    pub brightness_values: Option<Vec<f64>>,
    /// Search parameters for `brightness_values`
    #[serde(default = "default_true")]
    pub exposure_auto: bool,
    #[serde(default)]
    pub gain_auto: bool,
    /// Per-frame timeout; 0 or absent uses the configured default
    #[serde(default)]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

impl GrabImagesRequest {
    /// `count` frames with no overrides
    pub fn frames(count: u32) -> Self {
        Self {
            count,
            exposure_times: None,
            gain_values: None,
            gamma_values: None,
            brightness_values: None,
            exposure_auto: true,
            gain_auto: false,
            timeout_ms: 0,
        }
    }
}

impl From<GrabImagesRequest> for GrabImagesGoal {
    fn from(request: GrabImagesRequest) -> Self {
        GrabImagesGoal {
            count: request.count,
            exposure_times: request.exposure_times,
            gain_values: request.gain_values,
            gamma_values: request.gamma_values,
            brightness_values: request.brightness_values,
            exposure_auto: request.exposure_auto,
            gain_auto: request.gain_auto,
            frame_timeout_ms: request.timeout_ms,
        }
    }
}

/// Parameter values the camera reported for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReachedValues {
    pub exposure: Option<f64>,
    pub gain: Option<f64>,
    pub gamma: Option<f64>,
    pub brightness: Option<f64>,
}

impl From<&FrameRecord> for ReachedValues {
    fn from(record: &FrameRecord) -> Self {
        Self {
            exposure: record.reached_exposure,
            gain: record.reached_gain,
            gamma: record.reached_gamma,
            brightness: record.reached_brightness,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GrabImagesResponse {
    pub goal_id: String,
    pub outcome: GoalOutcome,
    pub success: bool,
    pub images: Vec<Frame>,
    /// One flag per attempted frame
    pub frame_success: Vec<bool>,
    /// One entry per attempted frame
    pub reached: Vec<ReachedValues>,
    pub message: Option<String>,
}

impl From<GrabImagesResult> for GrabImagesResponse {
    fn from(result: GrabImagesResult) -> Self {
        Self {
            goal_id: result.goal_id.to_string(),
            outcome: result.outcome,
            success: result.outcome.is_success(),
            frame_success: result.success_flags(),
            reached: result.frames.iter().map(ReachedValues::from).collect(),
            images: result.images().cloned().collect(),
            message: result.message,
        }
    }
}

/// Grab one frame with the configured timeout
pub async fn grab_image(node: Arc<CameraNode>) -> Result<Frame, String> {
    tokio::task::spawn_blocking(move || node.coordinator().grab_image())
        .await
        .map_err(|e| format!("Task join error: {}", e))?
        .map_err(|e| {
            log::error!("Failed to grab frame: {}", e);
            format!("Failed to grab frame: {}", e)
        })
}

/// Submit a multi-frame goal, preempting any goal still running.
///
/// Returns once the goal has started; progress and the result come
/// through the handle.
pub async fn grab_images(
    node: Arc<CameraNode>,
    request: GrabImagesRequest,
) -> Result<GoalHandle, String> {
    log::info!("grab_images({} frame(s))", request.count);
    let goal = GrabImagesGoal::from(request);
    tokio::task::spawn_blocking(move || node.coordinator().grab_images(goal))
        .await
        .map_err(|e| format!("Task join error: {}", e))
}

/// Wait for a submitted goal to finish
pub async fn wait_for_result(handle: GoalHandle) -> Result<GrabImagesResponse, String> {
    let result = tokio::task::spawn_blocking(move || handle.wait())
        .await
        .map_err(|e| format!("Task join error: {}", e))?;
    Ok(result.into())
}

pub async fn set_sleeping(
    node: Arc<CameraNode>,
    sleeping: bool,
) -> Result<CommandResponse, String> {
    log::info!("set_sleeping({})", sleeping);
    let result = tokio::task::spawn_blocking(move || node.coordinator().set_sleeping(sleeping))
        .await
        .map_err(|e| format!("Task join error: {}", e))?;
    Ok(match result {
        Ok(()) => CommandResponse::ok(),
        Err(e) => CommandResponse::failed(e.to_string()),
    })
}

pub async fn set_digital_output(
    node: Arc<CameraNode>,
    output_id: u32,
    value: bool,
) -> Result<CommandResponse, String> {
    log::info!("set_digital_output({}, {})", output_id, value);
    if output_id == 0 {
        return Ok(CommandResponse::failed("digital outputs are numbered from 1"));
    }
    let result = tokio::task::spawn_blocking(move || {
        node.coordinator().set_digital_output(output_id, value)
    })
    .await
    .map_err(|e| format!("Task join error: {}", e))?;
    Ok(match result {
        Ok(()) => CommandResponse::ok(),
        Err(e) => CommandResponse::failed(e.to_string()),
    })
}
