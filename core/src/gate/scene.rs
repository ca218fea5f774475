use cortex_protocol::Observation;
use cortex_protocol::ObservationType;
use cortex_protocol::Payload;

use crate::gate::types::GateWip;
use crate::gate::types::Scene;

/// First pipeline stage: map the observation onto a scene.
///
/// MESSAGEs split on a lightweight group heuristic (a mention anywhere in
/// the text); WORLD_DATA is treated as a tool result re-entering the
/// stream.
pub fn infer(obs: &Observation, wip: &mut GateWip) {
    wip.scene = Some(match obs.obs_type {
        ObservationType::Alert => Scene::Alert,
        ObservationType::Schedule | ObservationType::System | ObservationType::Control => {
            Scene::System
        }
        ObservationType::Message => match &obs.payload {
            Payload::Message(m) if m.text.contains('@') => Scene::Group,
            _ => Scene::Dialogue,
        },
        ObservationType::WorldData => Scene::ToolResult,
    });
}

#[cfg(test)]
mod tests {
    use cortex_protocol::Actor;
    use cortex_protocol::AlertPayload;
    use cortex_protocol::ControlPayload;
    use cortex_protocol::MessagePayload;
    use cortex_protocol::SchedulePayload;
    use cortex_protocol::SourceKind;
    use cortex_protocol::WorldDataPayload;
    use pretty_assertions::assert_eq;

    use super::*;

    fn scene_of(payload: Payload) -> Scene {
        let obs = Observation::new("t", SourceKind::External, Actor::user("u"), payload);
        let mut wip = GateWip::default();
        infer(&obs, &mut wip);
        wip.scene()
    }

    #[test]
    fn scenes_follow_obs_type() {
        assert_eq!(
            scene_of(Payload::Alert(AlertPayload::default())),
            Scene::Alert
        );
        assert_eq!(
            scene_of(Payload::Schedule(SchedulePayload::default())),
            Scene::System
        );
        assert_eq!(
            scene_of(Payload::Control(ControlPayload::default())),
            Scene::System
        );
        assert_eq!(
            scene_of(Payload::WorldData(WorldDataPayload {
                schema_id: "weather.v1".to_string(),
                data: serde_json::json!({}),
            })),
            Scene::ToolResult
        );
    }

    #[test]
    fn message_with_mention_is_group() {
        assert_eq!(
            scene_of(Payload::Message(MessagePayload::text("hey @bot"))),
            Scene::Group
        );
        assert_eq!(
            scene_of(Payload::Message(MessagePayload::text("plain talk"))),
            Scene::Dialogue
        );
    }
}
