//! Simulated camera
//!
//! A deterministic device with a monotone photometric response, quantized
//! controls, a configurable frame interval and injectable faults. Used for
//! offline runs of the CLI and for tests.

use super::{CameraDevice, Control};
use crate::config::Bounds;
use crate::errors::CameraError;
use crate::testing::{synthetic_frame, SyntheticSensor};
use crate::types::{DeviceInfo, Frame, ImageEncoding};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Fault injected into a specific grab call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFault {
    Timeout,
    Device(String),
}

#[derive(Debug, Clone)]
pub struct SimulatedCameraConfig {
    pub device_id: String,
    pub encoding: ImageEncoding,
    pub sensor: SyntheticSensor,
    /// Native exposure range in microseconds
    pub exposure_range: Bounds,
    pub gamma_range: Bounds,
    pub exposure_step: f64,
    pub gain_step: f64,
    pub gamma_step: f64,
    /// Time the sensor needs to deliver one frame
    pub frame_interval: Duration,
    /// Delay between `open` and the device reporting ready
    pub ready_after: Duration,
    pub digital_outputs: u32,
    pub native_auto_brightness: bool,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        Self {
            device_id: "sim0".to_string(),
            encoding: ImageEncoding::Mono8,
            sensor: SyntheticSensor::default(),
            exposure_range: Bounds::new(10.0, 1_000_000.0),
            gamma_range: Bounds::new(0.25, 4.0),
            exposure_step: 1.0,
            gain_step: 0.1,
            gamma_step: 0.01,
            frame_interval: Duration::ZERO,
            ready_after: Duration::ZERO,
            digital_outputs: 1,
            native_auto_brightness: false,
        }
    }
}

impl SimulatedCameraConfig {
    /// Sensor delivering frames at `fps`
    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.frame_interval = Duration::from_secs_f64(1.0 / fps);
        self
    }
}

struct SimState {
    opened_at: Option<Instant>,
    exposure: f64,
    gain: f64,
    gamma: f64,
    frame_counter: u64,
    outputs: Vec<bool>,
    faults: HashMap<u64, DeviceFault>,
    persistent_fault: Option<DeviceFault>,
}

pub struct SimulatedCamera {
    config: SimulatedCameraConfig,
    state: Mutex<SimState>,
    grab_calls: AtomicU64,
    write_calls: AtomicU64,
}

impl SimulatedCamera {
    pub fn new(config: SimulatedCameraConfig) -> Self {
        let outputs = vec![false; config.digital_outputs as usize];
        Self {
            state: Mutex::new(SimState {
                opened_at: None,
                exposure: 5_000.0,
                gain: 0.0,
                gamma: 1.0,
                frame_counter: 0,
                outputs,
                faults: HashMap::new(),
                persistent_fault: None,
            }),
            config,
            grab_calls: AtomicU64::new(0),
            write_calls: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SimulatedCameraConfig {
        &self.config
    }

    /// Fail the grab call with the given zero-based index
    pub fn inject_fault(&self, grab_call: u64, fault: DeviceFault) {
        self.state.lock().faults.insert(grab_call, fault);
    }

    /// Fail every grab until cleared with `None`
    pub fn set_persistent_fault(&self, fault: Option<DeviceFault>) {
        self.state.lock().persistent_fault = fault;
    }

    /// Number of `grab_frame` calls so far, failed ones included
    pub fn grab_calls(&self) -> u64 {
        self.grab_calls.load(Ordering::SeqCst)
    }

    /// Number of exposure/gain/gamma/output writes so far
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn device_calls(&self) -> u64 {
        self.grab_calls() + self.write_calls()
    }

    pub fn frame_counter(&self) -> u64 {
        self.state.lock().frame_counter
    }

    pub fn digital_output(&self, output_id: u32) -> Option<bool> {
        let state = self.state.lock();
        output_index(output_id).and_then(|i| state.outputs.get(i).copied())
    }

    /// Mean intensity the sensor would produce right now
    pub fn expected_brightness(&self) -> f64 {
        let state = self.state.lock();
        self.config
            .sensor
            .mean_level(state.exposure, state.gain, state.gamma)
    }

    fn quantize(value: f64, step: f64) -> f64 {
        if step > 0.0 {
            (value / step).round() * step
        } else {
            value
        }
    }

    fn ensure_open(state: &SimState) -> Result<(), CameraError> {
        if state.opened_at.is_none() {
            return Err(CameraError::DeviceError("device is not open".to_string()));
        }
        Ok(())
    }
}

fn output_index(output_id: u32) -> Option<usize> {
    // Outputs are numbered from 1
    output_id.checked_sub(1).map(|i| i as usize)
}

impl CameraDevice for SimulatedCamera {
    fn open(&self) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        if state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            log::info!("Simulated camera {} opened", self.config.device_id);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        if state.opened_at.take().is_some() {
            log::info!("Simulated camera {} closed", self.config.device_id);
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state
            .lock()
            .opened_at
            .is_some_and(|t| t.elapsed() >= self.config.ready_after)
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.config.device_id.clone(),
            model: "crabcontrol simulated sensor".to_string(),
            width: self.config.sensor.width,
            height: self.config.sensor.height,
            encoding: self.config.encoding,
            digital_outputs: self.config.digital_outputs,
        }
    }

    fn grab_frame(&self, timeout: Duration) -> Result<Frame, CameraError> {
        let call = self.grab_calls.fetch_add(1, Ordering::SeqCst);

        let (fault, level) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            let fault = state
                .faults
                .remove(&call)
                .or_else(|| state.persistent_fault.clone());
            let level = self
                .config
                .sensor
                .mean_level(state.exposure, state.gain, state.gamma);
            (fault, level)
        };

        match fault {
            Some(DeviceFault::Timeout) => {
                std::thread::sleep(timeout);
                return Err(CameraError::TimeoutError(timeout));
            }
            Some(DeviceFault::Device(msg)) => return Err(CameraError::DeviceError(msg)),
            None => {}
        }

        if self.config.frame_interval > timeout {
            std::thread::sleep(timeout);
            return Err(CameraError::TimeoutError(timeout));
        }
        if !self.config.frame_interval.is_zero() {
            std::thread::sleep(self.config.frame_interval);
        }

        let sequence = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.frame_counter += 1;
            state.frame_counter
        };

        let mut frame = synthetic_frame(
            sequence,
            self.config.sensor.width,
            self.config.sensor.height,
            self.config.encoding,
            level,
        );
        frame.device_id = self.config.device_id.clone();
        Ok(frame)
    }

    fn exposure(&self) -> Result<f64, CameraError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(state.exposure)
    }

    fn set_exposure(&self, value: f64) -> Result<f64, CameraError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let range = self.config.exposure_range;
        let reached = Self::quantize(value.clamp(range.min, range.max), self.config.exposure_step);
        state.exposure = reached;
        Ok(reached)
    }

    fn gain(&self) -> Result<f64, CameraError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(state.gain)
    }

    fn set_gain(&self, percent: f64) -> Result<f64, CameraError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let reached = Self::quantize(percent.clamp(0.0, 100.0), self.config.gain_step);
        state.gain = reached;
        Ok(reached)
    }

    fn gamma(&self) -> Result<f64, CameraError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(state.gamma)
    }

    fn set_gamma(&self, value: f64) -> Result<f64, CameraError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let range = self.config.gamma_range;
        let reached = Self::quantize(value.clamp(range.min, range.max), self.config.gamma_step);
        state.gamma = reached;
        Ok(reached)
    }

    fn control_step(&self, control: Control) -> f64 {
        match control {
            Control::Exposure => self.config.exposure_step,
            Control::Gain => self.config.gain_step,
            Control::Gamma => self.config.gamma_step,
        }
    }

    fn set_digital_output(&self, output_id: u32, value: bool) -> Result<(), CameraError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let slot = output_index(output_id)
            .and_then(|i| state.outputs.get_mut(i))
            .ok_or_else(|| {
                CameraError::ValidationError(format!("no digital output with id {output_id}"))
            })?;
        *slot = value;
        Ok(())
    }

    fn auto_brightness_once(
        &self,
        target: f64,
        exposure_auto: bool,
        gain_auto: bool,
    ) -> Result<(), CameraError> {
        if !self.config.native_auto_brightness {
            return Err(CameraError::UnsupportedOperation(
                "native auto brightness disabled on simulated camera".to_string(),
            ));
        }
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let sensor = &self.config.sensor;
        if exposure_auto {
            let range = self.config.exposure_range;
            let wanted = sensor.exposure_for_level(target, state.gain, state.gamma);
            state.exposure =
                Self::quantize(wanted.clamp(range.min, range.max), self.config.exposure_step);
        } else if gain_auto {
            let wanted = sensor.gain_for_level(target, state.exposure, state.gamma);
            state.gain = Self::quantize(wanted, self.config.gain_step);
        }
        Ok(())
    }
}
