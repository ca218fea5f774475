//! Reflex controller: bounded, whitelisted runtime tuning.
//!
//! Accepts `tuning_suggestion` control observations on the system session
//! and applies the whitelisted override fields to the gate config snapshot
//! for a limited TTL. Suggestions outside the whitelist are silently
//! discarded; every acceptance or rejection is acknowledged with a
//! `tuning_applied` control emit, and actual mode changes additionally
//! announce `system_mode_changed`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use cortex_protocol::Actor;
use cortex_protocol::ControlPayload;
use cortex_protocol::Observation;
use cortex_protocol::Payload;
use cortex_protocol::SourceKind;
use tracing::info;

use crate::config_provider::GateConfigProvider;
use crate::gate::config::OverridePatch;

pub const TUNING_SUGGESTION_KIND: &str = "tuning_suggestion";
pub const TUNING_APPLIED_KIND: &str = "tuning_applied";
pub const SYSTEM_MODE_CHANGED_KIND: &str = "system_mode_changed";

const REFLEX_SOURCE: &str = "system_reflex";
const TTL_MIN_SEC: u64 = 1;
const TTL_MAX_SEC: u64 = 3600;

#[derive(Debug, Clone)]
pub struct ReflexConfig {
    pub allow_agent_suggestions: bool,
    pub suggestion_ttl_default_sec: u64,
    pub suggestion_cooldown_sec: u64,
    pub agent_override_whitelist: Vec<String>,
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            allow_agent_suggestions: true,
            suggestion_ttl_default_sec: 60,
            suggestion_cooldown_sec: 5,
            agent_override_whitelist: vec!["force_low_model".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SuggestionState {
    active_until_ts: Option<f64>,
    last_applied_ts: Option<f64>,
    active_overrides: HashMap<String, bool>,
}

pub struct ReflexController {
    config_provider: Arc<GateConfigProvider>,
    config: ReflexConfig,
    system_session_key: String,
    state: SuggestionState,
}

impl ReflexController {
    pub fn new(
        config_provider: Arc<GateConfigProvider>,
        config: ReflexConfig,
        system_session_key: impl Into<String>,
    ) -> Self {
        Self {
            config_provider,
            config,
            system_session_key: system_session_key.into(),
            state: SuggestionState::default(),
        }
    }

    /// Called for every observation passing a worker. Tuning suggestions
    /// are applied here; any observation can trigger the TTL revert.
    pub fn handle_observation(
        &mut self,
        obs: &Observation,
        now: DateTime<Utc>,
    ) -> Vec<Observation> {
        let mut emits = Vec::new();
        if let Some(control) = obs.control()
            && control.kind == TUNING_SUGGESTION_KIND
        {
            emits.extend(self.handle_tuning_suggestion(control, now));
        }
        emits.extend(self.evaluate_ttl(now));
        emits
    }

    fn handle_tuning_suggestion(
        &mut self,
        control: &ControlPayload,
        now: DateTime<Utc>,
    ) -> Vec<Observation> {
        let now_ts = control
            .data
            .get("ts")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or_else(|| to_ts(now));

        if !self.config.allow_agent_suggestions {
            return vec![self.emit_tuning_applied(false, &HashMap::new(), "agent_suggestion_disabled", now_ts)];
        }

        let allowed = self.whitelisted_overrides(control);
        if allowed.is_empty() {
            return vec![self.emit_tuning_applied(false, &HashMap::new(), "no_allowed_overrides", now_ts)];
        }

        if let Some(last) = self.state.last_applied_ts
            && now_ts - last < self.config.suggestion_cooldown_sec as f64
        {
            return vec![self.emit_tuning_applied(false, &HashMap::new(), "cooldown", now_ts)];
        }

        let ttl = control
            .data
            .get("ttl_sec")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(self.config.suggestion_ttl_default_sec)
            .clamp(TTL_MIN_SEC, TTL_MAX_SEC);

        let changed = self.config_provider.update_overrides(patch_from(&allowed));
        if changed {
            info!(ttl, ?allowed, "tuning suggestion applied");
            self.state.active_until_ts = Some(now_ts + ttl as f64);
            self.state.last_applied_ts = Some(now_ts);
            self.state.active_overrides = allowed.clone();
        }

        let none = HashMap::new();
        let applied = if changed { &allowed } else { &none };
        let mut emits = vec![self.emit_tuning_applied(changed, applied, "agent_suggestion", now_ts)];
        if changed {
            emits.push(self.emit_system_mode_changed("agent_suggestion", now_ts));
        }
        emits
    }

    fn evaluate_ttl(&mut self, now: DateTime<Utc>) -> Vec<Observation> {
        let Some(active_until) = self.state.active_until_ts else {
            return Vec::new();
        };
        let now_ts = to_ts(now);
        if now_ts <= active_until {
            return Vec::new();
        }

        // TTL expired: whitelisted overrides revert to their safe values.
        let revert: HashMap<String, bool> = self
            .state
            .active_overrides
            .keys()
            .map(|k| (k.clone(), false))
            .collect();
        let changed = self.config_provider.update_overrides(patch_from(&revert));
        self.state.active_until_ts = None;
        self.state.active_overrides.clear();

        let none = HashMap::new();
        let applied = if changed { &revert } else { &none };
        let mut emits = vec![self.emit_tuning_applied(changed, applied, "ttl_expired", now_ts)];
        if changed {
            info!("tuning overrides reverted after ttl");
            emits.push(self.emit_system_mode_changed("ttl_expired", now_ts));
        }
        emits
    }

    fn whitelisted_overrides(&self, control: &ControlPayload) -> HashMap<String, bool> {
        let Some(serde_json::Value::Object(suggested)) = control.data.get("suggested_overrides")
        else {
            return HashMap::new();
        };
        suggested
            .iter()
            .filter(|(key, _)| self.config.agent_override_whitelist.contains(key))
            .filter_map(|(key, value)| value.as_bool().map(|v| (key.clone(), v)))
            .collect()
    }

    fn emit_tuning_applied(
        &self,
        accepted: bool,
        applied_overrides: &HashMap<String, bool>,
        reason: &str,
        ts: f64,
    ) -> Observation {
        let mut data = HashMap::new();
        data.insert("scope".to_string(), serde_json::json!("global"));
        data.insert("accepted".to_string(), serde_json::json!(accepted));
        data.insert(
            "applied_overrides".to_string(),
            serde_json::json!(applied_overrides),
        );
        data.insert("reason".to_string(), serde_json::json!(reason));
        data.insert("ts".to_string(), serde_json::json!(ts));
        self.make_control(TUNING_APPLIED_KIND, data)
    }

    fn emit_system_mode_changed(&self, reason: &str, ts: f64) -> Observation {
        let snapshot = self.config_provider.snapshot();
        let overrides = &snapshot.overrides;
        let mut data = HashMap::new();
        data.insert("scope".to_string(), serde_json::json!("global"));
        data.insert(
            "mode".to_string(),
            serde_json::json!({
                "emergency_mode": overrides.emergency_mode,
                "force_low_model": overrides.force_low_model,
            }),
        );
        data.insert("reason".to_string(), serde_json::json!(reason));
        data.insert("ts".to_string(), serde_json::json!(ts));
        self.make_control(SYSTEM_MODE_CHANGED_KIND, data)
    }

    fn make_control(
        &self,
        kind: &str,
        data: HashMap<String, serde_json::Value>,
    ) -> Observation {
        Observation::new(
            REFLEX_SOURCE,
            SourceKind::Internal,
            Actor::system("system"),
            Payload::Control(ControlPayload {
                kind: kind.to_string(),
                data,
            }),
        )
        .with_session_key(&self.system_session_key)
    }
}

fn patch_from(overrides: &HashMap<String, bool>) -> OverridePatch {
    let mut patch = OverridePatch::default();
    for (key, value) in overrides {
        match key.as_str() {
            "force_low_model" => patch.force_low_model = Some(*value),
            "emergency_mode" => patch.emergency_mode = Some(*value),
            _ => {}
        }
    }
    patch
}

fn to_ts(now: DateTime<Utc>) -> f64 {
    now.timestamp_millis() as f64 / 1000.0
}
