//! Bounded multi-producer input bus with lossy-newest backpressure.
//!
//! Every observation in the system funnels through one bus instance:
//! external adapters publish into it, the router consumes from it, and
//! everything the engine emits (agent replies, pain alerts, control acks)
//! is re-published onto it so downstream observers see a single stream.
//!
//! Producers never block and never see an error from a full queue: the
//! incoming (newest) observation is dropped and counted. The nociception
//! subsystem turns sustained drop growth into adaptive backpressure
//! instead.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_channel::Receiver;
use async_channel::Sender;
use async_channel::TrySendError;
use cortex_protocol::Observation;
use tracing::debug;

/// Outcome of a `publish_nowait` call. A full or closed bus is reported
/// here, never as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    /// Queue was at capacity; the incoming observation was discarded.
    DroppedFull,
    /// Bus already closed; the observation was discarded.
    DroppedClosed,
}

impl PublishOutcome {
    pub fn accepted(self) -> bool {
        matches!(self, PublishOutcome::Accepted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published_total: u64,
    pub dropped_total: u64,
    pub depth: usize,
}

pub struct InputBus {
    tx: Sender<Observation>,
    rx: Receiver<Observation>,
    published_total: AtomicU64,
    dropped_total: AtomicU64,
}

impl InputBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            published_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Publish without blocking. On a full queue the incoming observation
    /// is dropped and counted; accepted observations are yielded to the
    /// consumer in publish order.
    pub fn publish_nowait(&self, obs: Observation) -> PublishOutcome {
        match self.tx.try_send(obs) {
            Ok(()) => {
                self.published_total.fetch_add(1, Ordering::Relaxed);
                PublishOutcome::Accepted
            }
            Err(TrySendError::Full(obs)) => {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                debug!(obs_id = %obs.obs_id, source = %obs.source_name, "bus full, dropping newest");
                PublishOutcome::DroppedFull
            }
            Err(TrySendError::Closed(obs)) => {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                debug!(obs_id = %obs.obs_id, "bus closed, dropping publish");
                PublishOutcome::DroppedClosed
            }
        }
    }

    /// Yield the next observation in publish order. Returns `None` once the
    /// bus is closed and fully drained.
    pub async fn recv(&self) -> Option<Observation> {
        self.rx.recv().await.ok()
    }

    /// Signal end-of-stream. Observations already accepted are still
    /// drained by the consumer.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published_total: self.published_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            depth: self.rx.len(),
        }
    }
}
