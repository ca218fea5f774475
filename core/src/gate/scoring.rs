//! Per-scene weighted scoring into `[0, 1]`.

use cortex_protocol::Observation;
use cortex_protocol::Payload;

use crate::gate::types::GateContext;
use crate::gate::types::GateWip;
use crate::gate::types::Scene;

pub fn apply(obs: &Observation, ctx: &GateContext, wip: &mut GateWip) {
    let rules = &ctx.config.rules;
    let mut score: f64 = 0.0;

    match wip.scene() {
        Scene::Dialogue => {
            let w = &rules.dialogue.weights;
            score += w.base;
            if wip.features.has_mention {
                score += w.mention;
            }
            if wip.features.has_question {
                score += w.question_mark;
            }
            let text_len = wip.features.text_len.unwrap_or(0);
            if text_len >= rules.dialogue.long_text_len {
                score += w.long_text;
            }
            if let Payload::Message(m) = &obs.payload {
                let text = m.text.to_lowercase();
                for (keyword, weight) in &rules.dialogue.keywords {
                    if text.contains(keyword.as_str()) {
                        score += weight;
                    }
                }
            }
        }
        Scene::Group => {
            let w = &rules.group.weights;
            score += w.base;
            // In group scenes only a direct bot mention counts.
            if wip.features.has_bot_mention {
                score += w.mention;
            }
            if !wip.features.actor_id.is_empty()
                && rules
                    .group
                    .whitelist_actors
                    .contains(&wip.features.actor_id)
            {
                score += w.whitelist_actor;
            }
        }
        Scene::Alert => score += 0.6,
        Scene::System => score += rules.system.weights.base,
        Scene::ToolCall => score += 0.7,
        Scene::ToolResult => score += 0.5,
        Scene::Unknown => {}
    }

    // Universal text-length nudge, capped so walls of text cannot dominate.
    let text_len = wip.features.text_len.unwrap_or(0);
    if text_len > 0 {
        score += (text_len as f64 / 200.0).min(0.2);
    }

    wip.score = score.clamp(0.0, 1.0);
}
