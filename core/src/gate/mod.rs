// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The admission gate: a staged classifier that maps each observation to
//! DROP, SINK or DELIVER plus a resource-budget hint.
//!
//! `handle` is synchronous and bounded; the pipeline keeps no
//! cross-observation state except the dedup window and the drop-burst
//! monitor, both private to the gate instance and locked only for the
//! duration of their stage. There are no await points to hold a lock
//! across.

pub mod config;
pub mod dedup;
pub mod feature;
pub mod finalize;
pub mod hard_bypass;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod scene;
pub mod scoring;
pub mod types;

use std::sync::Mutex;

use cortex_protocol::Observation;

use self::dedup::DedupState;
use self::hard_bypass::DropMonitor;
use self::metrics::GateMetrics;
use self::pool::ObservationPool;
use self::types::GateAction;
use self::types::GateContext;
use self::types::GateDecision;
use self::types::GateOutcome;
use self::types::GateWip;
use self::types::Scene;

/// Capacity of each audit pool.
const POOL_CAPACITY: usize = 200;

pub struct Gate {
    metrics: GateMetrics,
    dedup: Mutex<DedupState>,
    monitor: Mutex<Option<DropMonitor>>,
    drop_pool: ObservationPool,
    sink_pool: ObservationPool,
    tool_pool: ObservationPool,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            metrics: GateMetrics::new(),
            dedup: Mutex::new(DedupState::default()),
            monitor: Mutex::new(None),
            drop_pool: ObservationPool::new(POOL_CAPACITY),
            sink_pool: ObservationPool::new(POOL_CAPACITY),
            tool_pool: ObservationPool::new(POOL_CAPACITY),
        }
    }

    /// Run the full pipeline for one observation. Never fails: every path
    /// converges on a valid [`GateOutcome`].
    pub fn handle(&self, obs: &Observation, ctx: &GateContext) -> GateOutcome {
        let mut wip = GateWip::default();

        scene::infer(obs, &mut wip);

        let bypassed = {
            let mut monitor = self.monitor.lock().unwrap();
            let monitor =
                monitor.get_or_insert_with(|| DropMonitor::new(&ctx.config.drop_escalation));
            hard_bypass::apply(monitor, obs, ctx, &mut wip)
        };
        if bypassed {
            return finalize::finalize(obs, ctx, wip, &self.metrics);
        }

        feature::extract(obs, &mut wip);
        scoring::apply(obs, ctx, &mut wip);
        {
            let mut dedup = self.dedup.lock().unwrap();
            dedup::apply(&mut dedup, obs, ctx, &mut wip);
        }
        policy::apply(obs, ctx, &mut wip);
        finalize::finalize(obs, ctx, wip, &self.metrics)
    }

    /// File an observation into the audit pool matching its decision.
    pub fn ingest(&self, obs: Observation, decision: &GateDecision) {
        match decision.action {
            GateAction::Drop => self.drop_pool.ingest(obs),
            GateAction::Sink => {
                if decision.scene == Scene::ToolResult {
                    self.tool_pool.ingest(obs);
                } else {
                    self.sink_pool.ingest(obs);
                }
            }
            GateAction::Deliver => {}
        }
    }

    pub fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }

    pub fn drop_pool(&self) -> &ObservationPool {
        &self.drop_pool
    }

    pub fn sink_pool(&self) -> &ObservationPool {
        &self.sink_pool
    }

    pub fn tool_pool(&self) -> &ObservationPool {
        &self.tool_pool
    }
}
