//! Last pipeline stage: converge the working object into an immutable
//! [`GateDecision`] and record metrics. Always produces a valid decision.

use cortex_protocol::Observation;

use crate::gate::metrics::GateMetrics;
use crate::gate::types::GateAction;
use crate::gate::types::GateContext;
use crate::gate::types::GateDecision;
use crate::gate::types::GateHint;
use crate::gate::types::GateOutcome;
use crate::gate::types::GateWip;
use crate::gate::types::Scene;

pub fn finalize(
    obs: &Observation,
    ctx: &GateContext,
    mut wip: GateWip,
    metrics: &GateMetrics,
) -> GateOutcome {
    let scene = wip.scene();
    let action = wip.action_hint.unwrap_or(GateAction::Sink);
    let hint = wip.gate_hint.take().unwrap_or_else(GateHint::default);

    let max_reasons = ctx.config.scene_policy(scene).max_reasons;
    wip.reasons.truncate(max_reasons);

    let decision = GateDecision {
        action,
        scene,
        session_key: ctx.session_key.clone(),
        target_worker: (scene == Scene::System).then(|| ctx.system_session_key.clone()),
        score: wip.score,
        reasons: wip.reasons,
        tags: wip.tags,
        fingerprint: wip.fingerprint,
        hint,
    };

    let mut ingest = wip.ingest;
    if ingest.is_empty()
        && matches!(action, GateAction::Drop | GateAction::Sink)
    {
        ingest.push(obs.clone());
    }

    metrics.record(scene, action);

    GateOutcome {
        decision,
        emit: wip.emit,
        ingest,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use cortex_protocol::Actor;
    use cortex_protocol::MessagePayload;
    use cortex_protocol::Payload;
    use cortex_protocol::SourceKind;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::gate::config::GateConfig;
    use crate::gate::types::SystemHealth;

    fn ctx() -> GateContext {
        GateContext {
            now: Utc::now(),
            config: Arc::new(GateConfig::default()),
            session_key: "system".to_string(),
            system_session_key: "system".to_string(),
            system_health: SystemHealth::default(),
        }
    }

    fn obs() -> Observation {
        Observation::new(
            "t",
            SourceKind::External,
            Actor::user("u"),
            Payload::Message(MessagePayload::text("x")),
        )
    }

    #[test]
    fn empty_wip_still_yields_valid_sink_decision() {
        let metrics = GateMetrics::new();
        let outcome = finalize(&obs(), &ctx(), GateWip::default(), &metrics);
        assert_eq!(outcome.decision.action, GateAction::Sink);
        assert_eq!(outcome.decision.scene, Scene::Unknown);
        assert_eq!(outcome.ingest.len(), 1);
        assert_eq!(metrics.snapshot().sunk_total, 1);
    }

    #[test]
    fn reasons_are_truncated_to_policy_limit() {
        let metrics = GateMetrics::new();
        let wip = GateWip {
            scene: Some(Scene::Dialogue),
            reasons: (0..10).map(|i| format!("r{i}")).collect(),
            ..Default::default()
        };
        let outcome = finalize(&obs(), &ctx(), wip, &metrics);
        assert_eq!(outcome.decision.reasons.len(), 6);
    }

    #[test]
    fn system_scene_sets_target_worker() {
        let metrics = GateMetrics::new();
        let wip = GateWip {
            scene: Some(Scene::System),
            ..Default::default()
        };
        let outcome = finalize(&obs(), &ctx(), wip, &metrics);
        assert_eq!(outcome.decision.target_worker, Some("system".to_string()));
    }

    #[test]
    fn deliver_does_not_ingest() {
        let metrics = GateMetrics::new();
        let wip = GateWip {
            scene: Some(Scene::Dialogue),
            action_hint: Some(GateAction::Deliver),
            ..Default::default()
        };
        let outcome = finalize(&obs(), &ctx(), wip, &metrics);
        assert!(outcome.ingest.is_empty());
    }
}
