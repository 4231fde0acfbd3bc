//! Core data types shared by the device facade, the controllers and the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    Mono8,
    Rgb8,
    Bgr8,
    /// 16-bit little-endian samples
    Mono16,
}

impl ImageEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageEncoding::Mono8 => "mono8",
            ImageEncoding::Rgb8 => "rgb8",
            ImageEncoding::Bgr8 => "bgr8",
            ImageEncoding::Mono16 => "mono16",
        }
    }

    /// Number of samples per pixel
    pub fn channels(&self) -> usize {
        match self {
            ImageEncoding::Mono8 | ImageEncoding::Mono16 => 1,
            ImageEncoding::Rgb8 | ImageEncoding::Bgr8 => 3,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            ImageEncoding::Mono16 => 2,
            _ => 1,
        }
    }

    /// Bytes needed for a `width` x `height` image in this encoding
    pub fn buffer_len(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.channels() * self.bytes_per_sample()
    }
}

impl fmt::Display for ImageEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mono8" => Ok(ImageEncoding::Mono8),
            "rgb8" => Ok(ImageEncoding::Rgb8),
            "bgr8" => Ok(ImageEncoding::Bgr8),
            "mono16" => Ok(ImageEncoding::Mono16),
            other => Err(format!("unknown image encoding: {other}")),
        }
    }
}

/// One frame grabbed from the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Device frame counter at the time of the grab
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    pub device_id: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, device_id: String) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            width,
            height,
            encoding: ImageEncoding::Mono8,
            device_id,
            data,
        }
    }

    pub fn with_encoding(mut self, encoding: ImageEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// True when the buffer length matches the declared geometry and encoding
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.encoding.buffer_len(self.width, self.height)
    }
}

/// Static description of an opened device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    pub digital_outputs: u32,
}

/// Metadata published alongside every image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub width: u32,
    pub height: u32,
    pub frame_id: String,
    pub encoding: ImageEncoding,
    pub timestamp: DateTime<Utc>,
}

impl CameraInfo {
    pub fn for_frame(frame: &Frame, frame_id: &str) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            frame_id: frame_id.to_string(),
            encoding: frame.encoding,
            timestamp: frame.timestamp,
        }
    }
}
