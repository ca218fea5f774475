//! Fingerprint deduplication over a sliding per-scene window.
//!
//! The fingerprint covers scene, actor and the normalized payload shape, so
//! repeated identical messages from one actor collapse to a single non-DROP
//! decision per window. Alerts are exempt: losing one is worse than seeing
//! it twice.

use std::collections::HashMap;
use std::fmt::Write as _;

use cortex_protocol::Observation;
use cortex_protocol::Payload;
use sha1::Digest;
use sha1::Sha1;

use crate::gate::types::GateAction;
use crate::gate::types::GateContext;
use crate::gate::types::GateWip;
use crate::gate::types::Scene;

/// Upper bound on retained fingerprints. Eviction is lazy: stale entries go
/// first, then the oldest live entry.
const MAX_ENTRIES: usize = 4096;

#[derive(Debug, Default)]
pub struct DedupState {
    last_seen: HashMap<String, f64>,
}

impl DedupState {
    fn insert(&mut self, fingerprint: String, now_ts: f64, window_sec: f64) {
        if self.last_seen.len() >= MAX_ENTRIES && !self.last_seen.contains_key(&fingerprint) {
            let cutoff = now_ts - window_sec;
            self.last_seen.retain(|_, &mut ts| ts >= cutoff);
            if self.last_seen.len() >= MAX_ENTRIES {
                // Still saturated with live entries; evict the oldest one.
                if let Some(oldest) = self
                    .last_seen
                    .iter()
                    .min_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(k, _)| k.clone())
                {
                    self.last_seen.remove(&oldest);
                }
            }
        }
        self.last_seen.insert(fingerprint, now_ts);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_seen.len()
    }
}

fn fingerprint(obs: &Observation, scene: Scene) -> String {
    let shape = match &obs.payload {
        Payload::Message(m) => m.text.trim().to_lowercase(),
        Payload::Schedule(s) => format!("schedule:{}", s.schedule_id),
        Payload::Alert(a) => format!("alert:{}", a.alert_type),
        Payload::Control(c) => format!("control:{}", c.kind),
        Payload::System(_) => "system".to_string(),
        Payload::WorldData(w) => format!("world_data:{}", w.schema_id),
        _ => "unknown".to_string(),
    };
    let actor_id = if obs.actor.actor_id.is_empty() {
        "unknown"
    } else {
        obs.actor.actor_id.as_str()
    };

    let mut hasher = Sha1::new();
    hasher.update(format!("{scene}|{actor_id}|{shape}").as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn apply(state: &mut DedupState, obs: &Observation, ctx: &GateContext, wip: &mut GateWip) {
    let scene = wip.scene();
    if scene == Scene::Alert {
        return;
    }
    let policy = ctx.config.scene_policy(scene);
    let fp = fingerprint(obs, scene);
    wip.fingerprint = Some(fp.clone());

    let now_ts = ctx.now.timestamp_millis() as f64 / 1000.0;
    if let Some(&last) = state.last_seen.get(&fp)
        && now_ts - last <= policy.dedup_window_sec
    {
        wip.tags.insert("dedup".to_string(), "hit".to_string());
        wip.action_hint = Some(GateAction::Drop);
        wip.reasons.push("dedup_hit".to_string());
    }
    state.insert(fp, now_ts, policy.dedup_window_sec);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use chrono::Utc;
    use cortex_protocol::Actor;
    use cortex_protocol::AlertPayload;
    use cortex_protocol::MessagePayload;
    use cortex_protocol::SourceKind;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::gate::config::GateConfig;
    use crate::gate::types::SystemHealth;

    fn ctx_at(now: chrono::DateTime<Utc>) -> GateContext {
        GateContext {
            now,
            config: Arc::new(GateConfig::default()),
            session_key: "user:u1".to_string(),
            system_session_key: "system".to_string(),
            system_health: SystemHealth::default(),
        }
    }

    fn msg(text: &str) -> Observation {
        Observation::new(
            "text_input",
            SourceKind::External,
            Actor::user("u1"),
            Payload::Message(MessagePayload::text(text)),
        )
    }

    fn wip_for(scene: Scene) -> GateWip {
        GateWip {
            scene: Some(scene),
            ..Default::default()
        }
    }

    #[test]
    fn repeat_within_window_is_dropped() {
        let mut state = DedupState::default();
        let t0 = Utc::now();

        let mut wip = wip_for(Scene::Dialogue);
        apply(&mut state, &msg("hello dedup"), &ctx_at(t0), &mut wip);
        assert!(wip.action_hint.is_none());

        let mut wip = wip_for(Scene::Dialogue);
        apply(
            &mut state,
            &msg("hello dedup"),
            &ctx_at(t0 + Duration::seconds(1)),
            &mut wip,
        );
        assert_eq!(wip.action_hint, Some(GateAction::Drop));
        assert!(wip.reasons.contains(&"dedup_hit".to_string()));
        assert_eq!(wip.tags.get("dedup"), Some(&"hit".to_string()));
    }

    #[test]
    fn repeat_after_window_passes() {
        let mut state = DedupState::default();
        let t0 = Utc::now();

        let mut wip = wip_for(Scene::Dialogue);
        apply(&mut state, &msg("hello"), &ctx_at(t0), &mut wip);

        let mut wip = wip_for(Scene::Dialogue);
        apply(
            &mut state,
            &msg("hello"),
            &ctx_at(t0 + Duration::seconds(31)),
            &mut wip,
        );
        assert!(wip.action_hint.is_none());
    }

    #[test]
    fn alerts_are_exempt() {
        let mut state = DedupState::default();
        let t0 = Utc::now();
        let alert = Observation::new(
            "monitor",
            SourceKind::Internal,
            Actor::system("monitor"),
            Payload::Alert(AlertPayload {
                alert_type: "disk_full".to_string(),
                ..Default::default()
            }),
        );

        for _ in 0..2 {
            let mut wip = wip_for(Scene::Alert);
            apply(&mut state, &alert, &ctx_at(t0), &mut wip);
            assert!(wip.action_hint.is_none());
            assert!(wip.fingerprint.is_none());
        }
    }

    #[test]
    fn map_stays_bounded() {
        let mut state = DedupState::default();
        let t0 = Utc::now();
        for i in 0..(MAX_ENTRIES + 64) {
            let mut wip = wip_for(Scene::Dialogue);
            apply(&mut state, &msg(&format!("unique {i}")), &ctx_at(t0), &mut wip);
        }
        assert!(state.len() <= MAX_ENTRIES);
    }
}
