//! Serialized access to the single camera device
//!
//! Every operation that touches the device goes through [`Hardware::lock`],
//! a re-entrant lock: a brightness search running inside a capture
//! re-acquires it on the same thread without deadlocking. The sleep flag is
//! written only under the lock; its read path is lock-free and callers that
//! act on it re-check under the lock.

use crate::device::CameraDevice;
use crate::errors::CameraError;
use crate::types::Frame;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Proof that the current thread holds the hardware lock.
pub type HardwareGuard<'a> = ReentrantMutexGuard<'a, ()>;

pub struct Hardware {
    device: Arc<dyn CameraDevice>,
    lock: ReentrantMutex<()>,
    sleeping: AtomicBool,
}

impl Hardware {
    pub fn new(device: Arc<dyn CameraDevice>) -> Self {
        Self {
            device,
            lock: ReentrantMutex::new(()),
            sleeping: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &dyn CameraDevice {
        self.device.as_ref()
    }

    /// Acquire the hardware lock, blocking behind any current owner
    pub fn lock(&self) -> HardwareGuard<'_> {
        self.lock.lock()
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<HardwareGuard<'_>> {
        self.lock.try_lock_for(timeout)
    }

    /// True while some thread owns the hardware lock
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Lock-free read; may be momentarily stale
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    /// Write the sleep flag; requires the hardware lock
    pub(crate) fn store_sleeping(&self, _guard: &HardwareGuard<'_>, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::SeqCst);
    }

    /// Refuse with `SleepingError` when the flag is set; call under the lock
    pub fn ensure_awake(&self, _guard: &HardwareGuard<'_>) -> Result<(), CameraError> {
        if self.is_sleeping() {
            return Err(CameraError::SleepingError);
        }
        Ok(())
    }

    /// Lock, check the sleep flag and grab one frame
    pub fn grab_frame(&self, timeout: Duration) -> Result<Frame, CameraError> {
        let guard = self.lock();
        self.ensure_awake(&guard)?;
        self.device.grab_frame(timeout)
    }

    /// Poll readiness at `interval` until ready or `timeout` elapses.
    ///
    /// Does not take the hardware lock.
    pub fn wait_for_camera(&self, timeout: Duration, interval: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.device.is_ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("Camera not ready after {:?}", timeout);
                return false;
            }
            std::thread::sleep(interval.min(deadline - now));
        }
    }
}
