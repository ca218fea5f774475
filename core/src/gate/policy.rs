//! Policy mapping: turn score, scene policy and runtime overrides into the
//! final action and resource hint.
//!
//! Checks run in strict priority order; the first match terminates the
//! stage. Emergency mode outranks everything, including the user-dialogue
//! safety valve, so a flooded system can still shed user traffic to SINK.
//! Below that, the safety valve guarantees a user-visible dialogue message
//! is never silently sunk by a low score.

use cortex_protocol::ActorType;
use cortex_protocol::Observation;
use cortex_protocol::ObservationType;

use crate::gate::config::GateConfig;
use crate::gate::types::BudgetLevel;
use crate::gate::types::BudgetSpec;
use crate::gate::types::GateAction;
use crate::gate::types::GateContext;
use crate::gate::types::GateHint;
use crate::gate::types::GateWip;
use crate::gate::types::ModelTier;
use crate::gate::types::ResponsePolicy;
use crate::gate::types::Scene;

pub fn apply(obs: &Observation, ctx: &GateContext, wip: &mut GateWip) {
    let scene = wip.scene();
    let policy = ctx.config.scene_policy(scene);
    let overrides = &ctx.config.overrides;

    // 1. Emergency mode: everything still standing gets sunk on a shoestring.
    if overrides.emergency_mode {
        wip.action_hint = Some(GateAction::Sink);
        wip.model_tier = Some(ModelTier::Low);
        wip.response_policy = Some(policy.default_response_policy);
        wip.reasons.push("override=emergency".to_string());
        wip.gate_hint = Some(GateHint {
            model_tier: ModelTier::Low,
            response_policy: ResponsePolicy::Ack,
            budget: BudgetSpec {
                budget_level: BudgetLevel::Tiny,
                time_ms: 300,
                max_tokens: 128,
                max_parallel: 1,
                evidence_allowed: false,
                max_tool_calls: 0,
                can_search_kb: false,
                can_call_tools: false,
                auto_clarify: false,
            },
            reason_tags: vec!["emergency_mode".to_string()],
        });
        return;
    }

    // 2. User-dialogue safety valve: a user-visible message must never be
    // silently sunk by a low score. A pending hard DROP (empty content,
    // dedup) still wins.
    if scene == Scene::Dialogue
        && obs.obs_type == ObservationType::Message
        && obs.actor.actor_type == ActorType::User
        && wip.action_hint != Some(GateAction::Drop)
    {
        wip.action_hint = Some(GateAction::Deliver);
        wip.reasons.push("user_dialogue_safe_valve".to_string());
        wip.gate_hint = Some(GateHint {
            model_tier: policy.default_model_tier,
            response_policy: policy.default_response_policy,
            budget: select_budget(wip.score, scene, &ctx.config),
            reason_tags: vec!["user_dialogue_safe_valve".to_string()],
        });
        return;
    }

    // 3. Forced drops by session or actor.
    if overrides.drop_sessions.contains(&ctx.session_key) {
        wip.action_hint = Some(GateAction::Drop);
        wip.reasons.push("override=drop_session".to_string());
        return;
    }
    if !obs.actor.actor_id.is_empty() && overrides.drop_actors.contains(&obs.actor.actor_id) {
        wip.action_hint = Some(GateAction::Drop);
        wip.reasons.push("override=drop_actor".to_string());
        return;
    }

    // 4. Forced delivers by session or actor. Suppressed for agent-emitted
    // observations so a deliver override can never close a feedback loop.
    let mut deliver_override = false;
    if !obs.is_agent_sourced() {
        if overrides.deliver_sessions.contains(&ctx.session_key) {
            wip.action_hint = Some(GateAction::Deliver);
            wip.model_tier = Some(policy.default_model_tier);
            wip.response_policy = Some(policy.default_response_policy);
            wip.reasons.push("override=deliver_session".to_string());
            deliver_override = true;
        } else if !obs.actor.actor_id.is_empty()
            && overrides.deliver_actors.contains(&obs.actor.actor_id)
        {
            wip.action_hint = Some(GateAction::Deliver);
            wip.model_tier = Some(policy.default_model_tier);
            wip.response_policy = Some(policy.default_response_policy);
            wip.reasons.push("override=deliver_actor".to_string());
            deliver_override = true;
        }
    }

    if !deliver_override {
        if wip.action_hint.is_some() {
            // An earlier stage already decided (hard bypass or dedup).
            wip.reasons.push("action_hint".to_string());
            if wip.gate_hint.is_none() {
                wip.gate_hint = Some(GateHint {
                    model_tier: wip.model_tier.unwrap_or(ModelTier::Low),
                    response_policy: wip.response_policy.unwrap_or_default(),
                    budget: select_budget(wip.score, scene, &ctx.config),
                    reason_tags: wip.reasons.clone(),
                });
            }
            return;
        }

        wip.action_hint = Some(if wip.score >= policy.deliver_threshold {
            GateAction::Deliver
        } else if wip.score >= policy.sink_threshold {
            GateAction::Sink
        } else {
            policy.default_action
        });
        wip.model_tier = Some(policy.default_model_tier);
        wip.response_policy = Some(policy.default_response_policy);
    }

    // 5. Low-model demotion applies only to deliveries.
    if overrides.force_low_model && wip.action_hint == Some(GateAction::Deliver) {
        wip.model_tier = Some(ModelTier::Low);
        wip.reasons.push("override=force_low_model".to_string());
    }

    if wip.gate_hint.is_none() {
        wip.gate_hint = Some(GateHint {
            model_tier: wip.model_tier.unwrap_or(ModelTier::Low),
            response_policy: wip.response_policy.unwrap_or_default(),
            budget: select_budget(wip.score, scene, &ctx.config),
            reason_tags: wip.reasons.clone(),
        });
    }
}

/// Budget selection from `(scene, score)` against the configured profiles.
pub fn select_budget(score: f64, scene: Scene, config: &GateConfig) -> BudgetSpec {
    let profiles = &config.budget_profiles;
    let thresholds = &config.budget_thresholds;

    match scene {
        // Alerts always get the deep envelope.
        Scene::Alert => profiles.deep.clone(),
        Scene::ToolCall => profiles.normal.clone(),
        // Tool results only ever warrant an ack; these caps are enforced
        // irrespective of the configured tiny profile.
        Scene::ToolResult => BudgetSpec {
            time_ms: 300,
            evidence_allowed: false,
            max_tool_calls: 0,
            can_search_kb: false,
            can_call_tools: false,
            auto_clarify: false,
            ..profiles.tiny.clone()
        },
        Scene::Group => {
            if score >= thresholds.high_score {
                BudgetSpec {
                    time_ms: 2500,
                    max_parallel: 3,
                    max_tool_calls: 2,
                    ..profiles.deep.clone()
                }
            } else if score >= thresholds.medium_score {
                BudgetSpec {
                    time_ms: 1000,
                    max_parallel: 1,
                    max_tool_calls: 0,
                    ..profiles.normal.clone()
                }
            } else {
                BudgetSpec {
                    time_ms: 500,
                    ..profiles.tiny.clone()
                }
            }
        }
        Scene::Dialogue | Scene::System | Scene::Unknown => {
            if score >= thresholds.high_score {
                profiles.deep.clone()
            } else if score >= thresholds.medium_score {
                profiles.normal.clone()
            } else {
                BudgetSpec {
                    auto_clarify: true,
                    ..profiles.tiny.clone()
                }
            }
        }
    }
}
