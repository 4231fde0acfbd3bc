//! Testing utilities for crabcontrol
//!
//! Synthetic frames with a prescribed mean intensity, used by the simulated
//! camera and by offline tests that need frames without hardware.

pub mod synthetic_data;

pub use synthetic_data::{synthetic_frame, uniform_frame, SyntheticSensor};
