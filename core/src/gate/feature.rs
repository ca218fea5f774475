use cortex_protocol::Observation;
use cortex_protocol::Payload;

use crate::gate::types::GateWip;

/// Populate the minimal feature set scoring needs. Infallible by
/// construction; a missing payload field simply leaves its feature unset.
pub fn extract(obs: &Observation, wip: &mut GateWip) {
    wip.features.obs_type = Some(obs.obs_type);
    wip.features.source_name = obs.source_name.clone();
    wip.features.actor_id = obs.actor.actor_id.clone();

    match &obs.payload {
        Payload::Message(m) => {
            let text = m.text.trim();
            wip.features.text_len = Some(text.len());
            wip.features.has_mention = text.contains('@');
            wip.features.has_bot_mention = text.contains("@bot");
            wip.features.has_question = text.contains('?');
        }
        Payload::Alert(a) => {
            wip.features.alert_severity = Some(a.severity);
        }
        _ => {}
    }
}
