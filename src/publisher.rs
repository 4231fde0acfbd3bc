//! Fan-out of grabbed frames to observers.
//!
//! Each subscriber gets its own bounded queue. A full queue drops the new
//! frame for that subscriber only; a slow observer never blocks capture.

use crate::types::{CameraInfo, Frame};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A frame together with its camera metadata.
#[derive(Debug, Clone)]
pub struct PublishedImage {
    pub frame: Frame,
    pub info: CameraInfo,
}

pub struct ImagePublisher {
    frame_id: String,
    subscribers: Mutex<Vec<Sender<PublishedImage>>>,
    live: Arc<AtomicUsize>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl ImagePublisher {
    /// `frame_id` is stamped into every [`CameraInfo`]
    pub fn new(frame_id: impl Into<String>) -> Self {
        Self {
            frame_id: frame_id.into(),
            subscribers: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, capacity: usize) -> ImageSubscription {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.lock().push(tx);
        self.live.fetch_add(1, Ordering::SeqCst);
        ImageSubscription {
            receiver: rx,
            live: Arc::clone(&self.live),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Deliver `frame` to every live subscriber; returns how many received it
    pub fn publish(&self, frame: &Frame) -> usize {
        let image = PublishedImage {
            info: CameraInfo::for_frame(frame, &self.frame_id),
            frame: frame.clone(),
        };

        let mut delivered = 0;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(image.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Subscriber queue full, frame {} dropped", frame.sequence);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        self.published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames dropped on full subscriber queues, summed over subscribers
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of a subscription; unsubscribes on drop.
pub struct ImageSubscription {
    receiver: Receiver<PublishedImage>,
    live: Arc<AtomicUsize>,
}

impl ImageSubscription {
    pub fn try_recv(&self) -> Option<PublishedImage> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PublishedImage> {
        match self.receiver.recv_timeout(timeout) {
            Ok(image) => Some(image),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Drop for ImageSubscription {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
