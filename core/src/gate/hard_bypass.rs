//! Hard gate: overload protection and drop-burst escalation.
//!
//! The only stage allowed to short-circuit the pipeline. Under overload the
//! observation is marked for DROP, a high-severity pain alert is emitted to
//! the system session, and the remaining stages are skipped entirely.

use std::collections::VecDeque;

use cortex_protocol::Observation;
use cortex_protocol::ObservationType;
use cortex_protocol::Payload;

use crate::gate::config::DropEscalationConfig;
use crate::gate::types::GateAction;
use crate::gate::types::GateContext;
use crate::gate::types::GateWip;
use crate::nociception::PainAlert;

/// Tracks drop pressure across observations: a sliding time window of drop
/// timestamps plus a consecutive-drop counter that resets whenever a
/// non-dropped observation passes through.
#[derive(Debug)]
pub struct DropMonitor {
    window_seconds: f64,
    burst_threshold: usize,
    consecutive_threshold: usize,
    timestamps: VecDeque<f64>,
    consecutive: usize,
}

impl DropMonitor {
    pub fn new(cfg: &DropEscalationConfig) -> Self {
        Self {
            window_seconds: cfg.burst_window_sec,
            burst_threshold: cfg.burst_count_threshold,
            consecutive_threshold: cfg.consecutive_threshold,
            timestamps: VecDeque::new(),
            consecutive: 0,
        }
    }

    /// Record a drop at `now_ts` (unix seconds) and report whether either
    /// escalation condition is met.
    pub fn record_drop(&mut self, now_ts: f64) -> bool {
        self.timestamps.push_back(now_ts);
        self.consecutive += 1;
        let cutoff = now_ts - self.window_seconds;
        while self
            .timestamps
            .front()
            .is_some_and(|&first| first < cutoff)
        {
            self.timestamps.pop_front();
        }
        self.timestamps.len() >= self.burst_threshold
            || self.consecutive >= self.consecutive_threshold
    }

    pub fn reset_consecutive(&mut self) {
        self.consecutive = 0;
    }
}

/// Returns `true` when the pipeline must short-circuit to finalize
/// (overload bypass).
pub fn apply(
    monitor: &mut DropMonitor,
    obs: &Observation,
    ctx: &GateContext,
    wip: &mut GateWip,
) -> bool {
    let cfg = &ctx.config.drop_escalation;

    if ctx.system_health.overload {
        wip.action_hint = Some(GateAction::Drop);
        wip.reasons.push("system_overload".to_string());
        wip.emit.push(
            PainAlert::high("system", "gate_overload")
                .message("gate overload detected")
                .data("cooldown_seconds", cfg.cooldown_suggest_sec.into())
                .build(&ctx.system_session_key),
        );
        return true;
    }

    // Alerts are never drop-tracked; they also clear the consecutive run.
    if obs.obs_type == ObservationType::Alert {
        monitor.reset_consecutive();
        return false;
    }

    if let Payload::Message(m) = &obs.payload
        && m.is_empty_content()
    {
        wip.action_hint = Some(GateAction::Drop);
        wip.reasons.push("empty_content".to_string());
    }

    if wip.action_hint == Some(GateAction::Drop) {
        let escalate = monitor.record_drop(ctx.now.timestamp_millis() as f64 / 1000.0);
        if escalate {
            wip.tags.insert("drop_burst".to_string(), "true".to_string());
            wip.emit.push(
                PainAlert::medium("gate", "drop_burst")
                    .message("drop burst detected")
                    .data("burst_window_sec", cfg.burst_window_sec.into())
                    .data(
                        "burst_count_threshold",
                        (cfg.burst_count_threshold as u64).into(),
                    )
                    .data(
                        "consecutive_threshold",
                        (cfg.consecutive_threshold as u64).into(),
                    )
                    .data("cooldown_seconds", cfg.cooldown_suggest_sec.into())
                    .build(&ctx.system_session_key),
            );
        }
    } else {
        monitor.reset_consecutive();
    }

    false
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn cfg() -> DropEscalationConfig {
        DropEscalationConfig {
            burst_window_sec: 10.0,
            burst_count_threshold: 3,
            consecutive_threshold: 5,
            cooldown_suggest_sec: 60.0,
        }
    }

    #[test]
    fn window_prunes_old_drops() {
        let mut monitor = DropMonitor::new(&cfg());
        assert!(!monitor.record_drop(0.0));
        assert!(!monitor.record_drop(1.0));
        // Outside the window relative to t=20; only one live entry remains.
        monitor.reset_consecutive();
        assert!(!monitor.record_drop(20.0));
    }

    #[test]
    fn burst_threshold_triggers_within_window() {
        let mut monitor = DropMonitor::new(&cfg());
        assert!(!monitor.record_drop(0.0));
        assert!(!monitor.record_drop(1.0));
        assert!(monitor.record_drop(2.0));
    }

    #[test]
    fn consecutive_threshold_survives_window_pruning() {
        let mut monitor = DropMonitor::new(&cfg());
        // Spread far apart so the window never accumulates, relying on the
        // consecutive counter alone.
        for i in 0..4 {
            assert!(!monitor.record_drop(i as f64 * 100.0));
        }
        assert!(monitor.record_drop(400.0));
    }

    #[test]
    fn reset_clears_consecutive_run() {
        let mut monitor = DropMonitor::new(&cfg());
        monitor.record_drop(0.0);
        monitor.record_drop(100.0);
        monitor.reset_consecutive();
        assert_eq!(monitor.consecutive, 0);
    }
}
