use crate::errors::CameraError;
use crate::node::CameraNode;
use crate::photometry::ParameterOutcome;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of a set-exposure / set-gain / set-gamma call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetParameterResponse {
    /// True when the reached value is within one device step of the target
    pub success: bool,
    pub target: f64,
    pub reached: Option<f64>,
    pub message: Option<String>,
}

impl SetParameterResponse {
    fn from_result(target: f64, result: Result<ParameterOutcome, CameraError>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: outcome.is_reached(),
                target,
                reached: Some(outcome.reached),
                message: (!outcome.is_reached())
                    .then(|| format!("target {} not reached, got {}", target, outcome.reached)),
            },
            Err(e) => Self::refused(target, e.to_string()),
        }
    }

    fn refused(target: f64, message: String) -> Self {
        Self {
            success: false,
            target,
            reached: None,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetBrightnessRequest {
    pub target: f64,
    #[serde(default = "default_true")]
    pub exposure_auto: bool,
    #[serde(default)]
    pub gain_auto: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetBrightnessResponse {
    pub success: bool,
    pub target: f64,
    pub reached_brightness: Option<f64>,
    pub reached_exposure: Option<f64>,
    pub reached_gain: Option<f64>,
    pub message: Option<String>,
}

/// Set the exposure time in microseconds
pub async fn set_exposure(
    node: Arc<CameraNode>,
    target: f64,
) -> Result<SetParameterResponse, String> {
    log::info!("set_exposure({})", target);
    if !target.is_finite() || target <= 0.0 {
        return Ok(SetParameterResponse::refused(
            target,
            format!("exposure {target} must be positive"),
        ));
    }

    let result = tokio::task::spawn_blocking(move || node.photometry().set_exposure(target))
        .await
        .map_err(|e| format!("Task join error: {}", e))?;
    Ok(SetParameterResponse::from_result(target, result))
}

/// Set the gain in percent of the device range
pub async fn set_gain(node: Arc<CameraNode>, target: f64) -> Result<SetParameterResponse, String> {
    log::info!("set_gain({})", target);
    if !(0.0..=100.0).contains(&target) {
        return Ok(SetParameterResponse::refused(
            target,
            format!("gain {target} outside [0, 100]"),
        ));
    }

    let result = tokio::task::spawn_blocking(move || node.photometry().set_gain(target))
        .await
        .map_err(|e| format!("Task join error: {}", e))?;
    Ok(SetParameterResponse::from_result(target, result))
}

pub async fn set_gamma(node: Arc<CameraNode>, target: f64) -> Result<SetParameterResponse, String> {
    log::info!("set_gamma({})", target);
    if !target.is_finite() || target <= 0.0 {
        return Ok(SetParameterResponse::refused(
            target,
            format!("gamma {target} must be positive"),
        ));
    }

    let result = tokio::task::spawn_blocking(move || node.photometry().set_gamma(target))
        .await
        .map_err(|e| format!("Task join error: {}", e))?;
    Ok(SetParameterResponse::from_result(target, result))
}

/// Drive mean frame intensity to the requested target.
///
/// Blocks until the search finishes; concurrent calls queue behind it.
pub async fn set_brightness(
    node: Arc<CameraNode>,
    request: SetBrightnessRequest,
) -> Result<SetBrightnessResponse, String> {
    log::info!("set_brightness({:?})", request);
    let target = request.target;
    let refused = |message: String| SetBrightnessResponse {
        success: false,
        target,
        reached_brightness: None,
        reached_exposure: None,
        reached_gain: None,
        message: Some(message),
    };

    if !(1.0..=255.0).contains(&target) {
        return Ok(refused(format!("brightness {target} outside [1, 255]")));
    }

    let (result, state) = tokio::task::spawn_blocking(move || {
        let photometry = node.photometry();
        let result =
            photometry.set_brightness(request.target, request.exposure_auto, request.gain_auto);
        (result, photometry.state())
    })
    .await
    .map_err(|e| format!("Task join error: {}", e))?;

    Ok(match result {
        Ok(outcome) => SetBrightnessResponse {
            success: outcome.is_reached(),
            target,
            reached_brightness: Some(outcome.reached),
            reached_exposure: state.exposure,
            reached_gain: state.gain,
            message: (!outcome.is_reached())
                .then(|| format!("search exhausted at brightness {:.1}", outcome.reached)),
        },
        Err(e) => {
            log::warn!("set_brightness failed: {}", e);
            refused(e.to_string())
        }
    })
}
