//! Synthetic frames with a known mean intensity
//!
//! The generator dithers between two adjacent intensity levels so the mean of
//! a frame tracks a fractional target level closely, while frames still
//! differ from one another through the sequence-dependent dither phase.

use crate::types::{Frame, ImageEncoding};

const DITHER_STEPS: usize = 16;

/// Create a frame whose mean 8-bit intensity is approximately `level`.
///
/// `level` is clamped to [0, 255]. For `Mono16` the 8-bit level is scaled by
/// 257 so that the high byte carries the same intensity.
pub fn synthetic_frame(
    sequence: u64,
    width: u32,
    height: u32,
    encoding: ImageEncoding,
    level: f64,
) -> Frame {
    let level = if level.is_finite() { level.clamp(0.0, 255.0) } else { 0.0 };
    let samples = width as usize * height as usize * encoding.channels();
    let phase = (sequence % DITHER_STEPS as u64) as usize;

    let data = match encoding {
        ImageEncoding::Mono16 => {
            let mut data = Vec::with_capacity(samples * 2);
            for i in 0..samples {
                let v = dithered(level, i + phase) as u16 * 257;
                data.extend_from_slice(&v.to_le_bytes());
            }
            data
        }
        _ => (0..samples).map(|i| dithered(level, i + phase)).collect(),
    };

    Frame::new(data, width, height, "synthetic".to_string())
        .with_encoding(encoding)
        .with_sequence(sequence)
}

/// A frame where every sample equals `value`
pub fn uniform_frame(width: u32, height: u32, value: u8) -> Frame {
    Frame::new(
        vec![value; width as usize * height as usize],
        width,
        height,
        "synthetic".to_string(),
    )
}

fn dithered(level: f64, index: usize) -> u8 {
    let offset = (index % DITHER_STEPS) as f64 / DITHER_STEPS as f64;
    (level + offset).floor().min(255.0) as u8
}

/// Photometric characteristics of the simulated sensor.
///
/// Mean intensity is `radiance * exposure_us * gain_factor`, saturating at
/// 255, followed by a gamma curve. Increasing exposure or gain never lowers
/// the mean.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSensor {
    pub width: u32,
    pub height: u32,
    /// Intensity units gathered per microsecond of exposure at unit gain
    pub radiance: f64,
    /// Gain factor reached at 100 % gain
    pub max_gain_factor: f64,
}

impl Default for SyntheticSensor {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            radiance: 0.01,
            max_gain_factor: 4.0,
        }
    }
}

impl SyntheticSensor {
    pub fn gain_factor(&self, gain_percent: f64) -> f64 {
        1.0 + (self.max_gain_factor - 1.0) * gain_percent.clamp(0.0, 100.0) / 100.0
    }

    /// Linear response before gamma, saturated at full scale
    pub fn linear_level(&self, exposure_us: f64, gain_percent: f64) -> f64 {
        (self.radiance * exposure_us * self.gain_factor(gain_percent)).clamp(0.0, 255.0)
    }

    /// Mean 8-bit intensity for the given settings
    pub fn mean_level(&self, exposure_us: f64, gain_percent: f64, gamma: f64) -> f64 {
        let linear = self.linear_level(exposure_us, gain_percent) / 255.0;
        let gamma = if gamma > 0.0 { gamma } else { 1.0 };
        255.0 * linear.powf(1.0 / gamma)
    }

    /// Exposure that yields `level` at the given gain and gamma
    pub fn exposure_for_level(&self, level: f64, gain_percent: f64, gamma: f64) -> f64 {
        let linear = 255.0 * (level.clamp(0.0, 255.0) / 255.0).powf(gamma);
        linear / (self.radiance * self.gain_factor(gain_percent))
    }

    /// Gain in percent that yields `level` at the given exposure and gamma
    pub fn gain_for_level(&self, level: f64, exposure_us: f64, gamma: f64) -> f64 {
        let linear = 255.0 * (level.clamp(0.0, 255.0) / 255.0).powf(gamma);
        let factor = linear / (self.radiance * exposure_us);
        ((factor - 1.0) / (self.max_gain_factor - 1.0) * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photometry::calc_brightness;

    #[test]
    fn test_synthetic_frame_correct_size() {
        let frame = synthetic_frame(0, 64, 48, ImageEncoding::Rgb8, 100.0);
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
        assert!(frame.is_consistent());
    }

    #[test]
    fn test_synthetic_frame_mean_tracks_level() {
        for level in [1.0, 37.5, 128.25, 254.0] {
            let frame = synthetic_frame(3, 64, 48, ImageEncoding::Mono8, level);
            let mean = calc_brightness(&frame).unwrap();
            assert!((mean - level).abs() < 0.1, "level {level} mean {mean}");
        }
    }

    #[test]
    fn test_mono16_mean_matches_8bit_level() {
        let frame = synthetic_frame(0, 32, 32, ImageEncoding::Mono16, 80.0);
        assert_eq!(frame.data.len(), 32 * 32 * 2);
        let mean = calc_brightness(&frame).unwrap();
        assert!((mean - 80.0).abs() < 0.6, "mean {mean}");
    }

    #[test]
    fn test_frames_differ_between_sequences() {
        let a = synthetic_frame(0, 16, 16, ImageEncoding::Mono8, 10.5);
        let b = synthetic_frame(1, 16, 16, ImageEncoding::Mono8, 10.5);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_sensor_response_is_monotone() {
        let sensor = SyntheticSensor::default();
        let mut last = -1.0;
        for exposure in (0..40).map(|i| i as f64 * 1000.0) {
            let level = sensor.mean_level(exposure, 0.0, 1.0);
            assert!(level >= last);
            last = level;
        }
        assert!(sensor.mean_level(1e9, 0.0, 1.0) <= 255.0);
    }

    #[test]
    fn test_sensor_inverse_models() {
        let sensor = SyntheticSensor::default();
        let exposure = sensor.exposure_for_level(120.0, 0.0, 1.0);
        assert!((sensor.mean_level(exposure, 0.0, 1.0) - 120.0).abs() < 1e-6);
        let gain = sensor.gain_for_level(120.0, 6000.0, 1.0);
        assert!((sensor.mean_level(6000.0, gain, 1.0) - 120.0).abs() < 1e-6);
    }
}
