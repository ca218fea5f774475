// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::gate::types::GateAction;
use crate::gate::types::Scene;

/// Counters maintained by the finalize stage. `processed_total` always
/// equals the sum of the three action counters.
#[derive(Default)]
pub struct GateMetrics {
    processed_total: AtomicU64,
    dropped_total: AtomicU64,
    sunk_total: AtomicU64,
    delivered_total: AtomicU64,
    by_scene: Mutex<HashMap<String, u64>>,
    by_action: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateMetricsSnapshot {
    pub processed_total: u64,
    pub dropped_total: u64,
    pub sunk_total: u64,
    pub delivered_total: u64,
    pub by_scene: HashMap<String, u64>,
    pub by_action: HashMap<String, u64>,
}

impl GateMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, scene: Scene, action: GateAction) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        match action {
            GateAction::Drop => self.dropped_total.fetch_add(1, Ordering::Relaxed),
            GateAction::Sink => self.sunk_total.fetch_add(1, Ordering::Relaxed),
            GateAction::Deliver => self.delivered_total.fetch_add(1, Ordering::Relaxed),
        };
        *self
            .by_scene
            .lock()
            .unwrap()
            .entry(scene.to_string())
            .or_insert(0) += 1;
        *self
            .by_action
            .lock()
            .unwrap()
            .entry(action.to_string())
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> GateMetricsSnapshot {
        GateMetricsSnapshot {
            processed_total: self.processed_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            sunk_total: self.sunk_total.load(Ordering::Relaxed),
            delivered_total: self.delivered_total.load(Ordering::Relaxed),
            by_scene: self.by_scene.lock().unwrap().clone(),
            by_action: self.by_action.lock().unwrap().clone(),
        }
    }
}
