//! Fan-out hub: the publisher's only outbound channel.
//!
//! Frames are encoded once and shared (`Bytes` is reference counted) by every
//! session. `publish` never waits: a session whose queue is full loses its
//! oldest frames and is told how many on its next receive.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

pub struct FanoutHub {
    tx: broadcast::Sender<Bytes>,
    published: AtomicU64,
    unheard: AtomicU64,
}

impl FanoutHub {
    /// `capacity` is the per-subscriber queue depth.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
            unheard: AtomicU64::new(0),
        }
    }

    /// Attach a receiver. It sees every frame published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Publish a frame; returns how many sessions it was queued for.
    pub fn publish(&self, frame: Bytes) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(frame) {
            Ok(receivers) => receivers,
            Err(_) => {
                self.unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames published while no subscriber was attached.
    pub fn unheard(&self) -> u64 {
        self.unheard.load(Ordering::Relaxed)
    }
}
