//! Async request/response surface over a [`CameraNode`](crate::node::CameraNode).
//!
//! Each call validates its input, runs the blocking work on the tokio
//! blocking pool and folds domain errors into a `success: false` reply.
//! `Err` is reserved for failures of the surface itself.

pub mod capture;
pub mod photometry;

pub use capture::*;
pub use photometry::*;
