//! nokhwa-backed camera
//!
//! Maps the facade onto the UVC controls exposed by nokhwa: absolute exposure
//! (100 us units), gain (scaled to percent of the reported range) and gamma
//! (hundredths). Digital outputs and native auto brightness are not available.

use super::{CameraDevice, Control};
use crate::errors::CameraError;
use crate::types::{DeviceInfo, Frame, ImageEncoding};
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{
        CameraIndex, ControlValueDescription, ControlValueSetter, KnownCameraControl,
        RequestedFormat, RequestedFormatType,
    },
    CallbackCamera,
};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const EXPOSURE_UNIT_US: f64 = 100.0;
const GAMMA_UNIT: f64 = 100.0;

pub struct NokhwaCamera {
    camera: Mutex<CallbackCamera>,
    device_id: String,
    frame_counter: Mutex<u64>,
    resolution: Mutex<(u32, u32)>,
}

impl NokhwaCamera {
    /// Create a camera for the device index in `device_id` ("" selects 0)
    pub fn new(device_id: &str) -> Result<Self, CameraError> {
        let index = if device_id.is_empty() {
            0
        } else {
            device_id
                .parse::<u32>()
                .map_err(|_| CameraError::ConfigError(format!("invalid device id: {device_id}")))?
        };

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let camera = CallbackCamera::new(CameraIndex::Index(index), requested, |_| {})
            .map_err(|e| CameraError::DeviceError(format!("Failed to initialize camera: {e}")))?;

        Ok(Self {
            camera: Mutex::new(camera),
            device_id: index.to_string(),
            frame_counter: Mutex::new(0),
            resolution: Mutex::new((0, 0)),
        })
    }

    fn range(&self, control: KnownCameraControl) -> Result<(i64, i64, i64), CameraError> {
        let camera = self.camera.lock();
        let described = camera
            .camera_control(control)
            .map_err(|e| CameraError::DeviceError(format!("Failed to query {control:?}: {e}")))?;
        match described.value() {
            ControlValueDescription::IntegerRange {
                min, max, value, ..
            } => Ok((min, max, value)),
            ControlValueDescription::Integer { value, .. } => Ok((i64::MIN, i64::MAX, value)),
            other => Err(CameraError::UnsupportedOperation(format!(
                "{control:?} has unsupported value kind {other:?}"
            ))),
        }
    }

    fn write(&self, control: KnownCameraControl, raw: i64) -> Result<i64, CameraError> {
        let (min, max, _) = self.range(control)?;
        let raw = raw.clamp(min, max);
        self.camera
            .lock()
            .set_camera_control(control, ControlValueSetter::Integer(raw))
            .map_err(|e| CameraError::DeviceError(format!("Failed to set {control:?}: {e}")))?;
        let (_, _, reached) = self.range(control)?;
        Ok(reached)
    }
}

impl CameraDevice for NokhwaCamera {
    fn open(&self) -> Result<(), CameraError> {
        self.camera
            .lock()
            .open_stream()
            .map_err(|e| CameraError::DeviceError(format!("Failed to start stream: {e}")))?;
        log::info!("Camera {} stream opened", self.device_id);
        Ok(())
    }

    fn close(&self) -> Result<(), CameraError> {
        self.camera
            .lock()
            .stop_stream()
            .map_err(|e| CameraError::DeviceError(format!("Failed to stop stream: {e}")))?;
        log::info!("Camera {} stream closed", self.device_id);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.camera.lock().is_stream_open()
    }

    fn info(&self) -> DeviceInfo {
        // Geometry is known once the first frame has been decoded
        let (width, height) = *self.resolution.lock();
        DeviceInfo {
            id: self.device_id.clone(),
            model: "UVC camera".to_string(),
            width,
            height,
            encoding: ImageEncoding::Rgb8,
            digital_outputs: 0,
        }
    }

    fn grab_frame(&self, timeout: Duration) -> Result<Frame, CameraError> {
        let started = Instant::now();
        let buffer = self
            .camera
            .lock()
            .poll_frame()
            .map_err(|e| CameraError::DeviceError(format!("Failed to capture frame: {e}")))?;
        // The backend blocks internally; a late frame is still reported as a timeout.
        if started.elapsed() > timeout {
            return Err(CameraError::TimeoutError(timeout));
        }

        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| CameraError::DeviceError(format!("Failed to decode frame: {e}")))?;
        let (width, height) = (image.width(), image.height());
        *self.resolution.lock() = (width, height);

        let sequence = {
            let mut counter = self.frame_counter.lock();
            *counter += 1;
            *counter
        };

        Ok(Frame::new(image.into_raw(), width, height, self.device_id.clone())
            .with_encoding(ImageEncoding::Rgb8)
            .with_sequence(sequence))
    }

    fn exposure(&self) -> Result<f64, CameraError> {
        let (_, _, value) = self.range(KnownCameraControl::Exposure)?;
        Ok(value as f64 * EXPOSURE_UNIT_US)
    }

    fn set_exposure(&self, value: f64) -> Result<f64, CameraError> {
        let raw = (value / EXPOSURE_UNIT_US).round() as i64;
        let reached = self.write(KnownCameraControl::Exposure, raw)?;
        Ok(reached as f64 * EXPOSURE_UNIT_US)
    }

    fn gain(&self) -> Result<f64, CameraError> {
        let (min, max, value) = self.range(KnownCameraControl::Gain)?;
        Ok(to_percent(value, min, max))
    }

    fn set_gain(&self, percent: f64) -> Result<f64, CameraError> {
        let (min, max, _) = self.range(KnownCameraControl::Gain)?;
        let span = max as f64 - min as f64;
        let raw = (min as f64 + span * percent.clamp(0.0, 100.0) / 100.0).round() as i64;
        let reached = self.write(KnownCameraControl::Gain, raw)?;
        Ok(to_percent(reached, min, max))
    }

    fn gamma(&self) -> Result<f64, CameraError> {
        let (_, _, value) = self.range(KnownCameraControl::Gamma)?;
        Ok(value as f64 / GAMMA_UNIT)
    }

    fn set_gamma(&self, value: f64) -> Result<f64, CameraError> {
        let reached = self.write(KnownCameraControl::Gamma, (value * GAMMA_UNIT).round() as i64)?;
        Ok(reached as f64 / GAMMA_UNIT)
    }

    fn control_step(&self, control: Control) -> f64 {
        match control {
            Control::Exposure => EXPOSURE_UNIT_US,
            Control::Gain => 1.0,
            Control::Gamma => 1.0 / GAMMA_UNIT,
        }
    }
}

fn to_percent(value: i64, min: i64, max: i64) -> f64 {
    if max <= min {
        return 0.0;
    }
    (value as f64 - min as f64) / (max as f64 - min as f64) * 100.0
}
