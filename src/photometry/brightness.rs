use crate::errors::CameraError;
use crate::types::{Frame, ImageEncoding};

/// Mean sample intensity of a frame on the 8-bit scale.
///
/// Every sample of every channel contributes equally. 16-bit samples are
/// scaled down by 257 so the result stays in [0, 255].
pub fn calc_brightness(frame: &Frame) -> Result<f64, CameraError> {
    if frame.data.is_empty() {
        return Err(CameraError::ValidationError("frame has no pixel data".to_string()));
    }

    match frame.encoding {
        ImageEncoding::Mono16 => {
            if frame.data.len() % 2 != 0 {
                return Err(CameraError::ValidationError(
                    "mono16 buffer has odd length".to_string(),
                ));
            }
            let samples = frame.data.len() / 2;
            let sum: u64 = frame
                .data
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as u64)
                .sum();
            Ok(sum as f64 / samples as f64 / 257.0)
        }
        _ => {
            let sum: u64 = frame.data.iter().map(|&b| b as u64).sum();
            Ok(sum as f64 / frame.data.len() as f64)
        }
    }
}
