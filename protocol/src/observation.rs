//! Defines the Observation record, the universal typed event unit.
//!
//! Adapters construct Observations and publish them onto the input bus; the
//! engine treats them as immutable apart from `metadata`, which downstream
//! stages may stamp with correlation ids.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Discriminant of the payload union carried by an [`Observation`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObservationType {
    Message,
    Schedule,
    Alert,
    Control,
    System,
    WorldData,
}

/// Whether the producing adapter sits outside the process boundary or is an
/// internal component (the agent, the gate, the reflex controller).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceKind {
    #[default]
    External,
    Internal,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActorType {
    #[default]
    User,
    System,
    Service,
}

/// The party an Observation is attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub actor_type: ActorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Actor {
    pub fn user(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_type: ActorType::User,
            display_name: None,
        }
    }

    pub fn system(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_type: ActorType::System,
            display_name: None,
        }
    }
}

/// Alert severity ladder used by [`AlertPayload`].
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertSeverity {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// True when there is nothing to act on: no non-whitespace text and no
    /// attachments.
    pub fn is_empty_content(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulePayload {
    pub schedule_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_type: String,
    pub severity: AlertSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub kind: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

/// Engine-internal lifecycle signal (startup, shutdown, diagnostics).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldDataPayload {
    pub schema_id: String,
    pub data: serde_json::Value,
}

/// Payload union. The variant always matches the enclosing Observation's
/// `obs_type`; [`Observation::new`] enforces this by deriving the type from
/// the payload.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Message(MessagePayload),
    Schedule(SchedulePayload),
    Alert(AlertPayload),
    Control(ControlPayload),
    System(SystemPayload),
    WorldData(WorldDataPayload),
}

impl Payload {
    pub fn obs_type(&self) -> ObservationType {
        match self {
            Payload::Message(_) => ObservationType::Message,
            Payload::Schedule(_) => ObservationType::Schedule,
            Payload::Alert(_) => ObservationType::Alert,
            Payload::Control(_) => ObservationType::Control,
            Payload::System(_) => ObservationType::System,
            Payload::WorldData(_) => ObservationType::WorldData,
        }
    }
}

/// Pointer back to the raw upstream event, for audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_event_uri: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The universal event record.
///
/// `obs_id` is unique within a process lifetime. `timestamp` is when the
/// upstream event happened; `received_at` is when the record was constructed
/// here, so `timestamp <= received_at` at every observation boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub obs_id: String,
    pub obs_type: ObservationType,
    pub source_name: String,
    pub source_kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Prefix that marks agent-originated observations. The engine uses it to
/// break feedback loops: anything emitted under `agent:*` never re-enters
/// the agent path.
pub const AGENT_SOURCE_PREFIX: &str = "agent:";

impl Observation {
    /// Construct a new Observation. `obs_type` is derived from the payload
    /// variant so the two can never disagree, and both instants are stamped
    /// with the current UTC time.
    pub fn new(
        source_name: impl Into<String>,
        source_kind: SourceKind,
        actor: Actor,
        payload: Payload,
    ) -> Self {
        let now = Utc::now();
        Self {
            obs_id: Uuid::new_v4().to_string(),
            obs_type: payload.obs_type(),
            source_name: source_name.into(),
            source_kind,
            session_key: None,
            actor,
            timestamp: now,
            received_at: now,
            payload,
            evidence: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True for observations produced by the agent itself (speaker emits,
    /// orchestrator fallbacks).
    pub fn is_agent_sourced(&self) -> bool {
        self.source_name.starts_with(AGENT_SOURCE_PREFIX)
    }

    pub fn message(&self) -> Option<&MessagePayload> {
        match &self.payload {
            Payload::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn alert(&self) -> Option<&AlertPayload> {
        match &self.payload {
            Payload::Alert(a) => Some(a),
            _ => None,
        }
    }

    pub fn control(&self) -> Option<&ControlPayload> {
        match &self.payload {
            Payload::Control(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn obs_type_tracks_payload_variant() {
        let obs = Observation::new(
            "text_input",
            SourceKind::External,
            Actor::user("u1"),
            Payload::Message(MessagePayload::text("hello")),
        );
        assert_eq!(obs.obs_type, ObservationType::Message);
        assert!(obs.timestamp <= obs.received_at);
        assert!(!obs.is_agent_sourced());
    }

    #[test]
    fn agent_source_prefix_is_detected() {
        let obs = Observation::new(
            "agent:speaker",
            SourceKind::Internal,
            Actor::system("agent"),
            Payload::Message(MessagePayload::text("reply")),
        );
        assert!(obs.is_agent_sourced());
    }

    #[test]
    fn obs_ids_are_unique() {
        let a = Observation::new(
            "t",
            SourceKind::External,
            Actor::user("u"),
            Payload::Message(MessagePayload::text("x")),
        );
        let b = Observation::new(
            "t",
            SourceKind::External,
            Actor::user("u"),
            Payload::Message(MessagePayload::text("x")),
        );
        assert_ne!(a.obs_id, b.obs_id);
    }

    #[test]
    fn payload_union_serializes_with_type_tag() {
        let obs = Observation::new(
            "alerts",
            SourceKind::Internal,
            Actor::system("gate"),
            Payload::Alert(AlertPayload {
                alert_type: "drop_burst".to_string(),
                severity: AlertSeverity::Medium,
                message: None,
                data: HashMap::new(),
            }),
        );
        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["obs_type"], "alert");
        assert_eq!(json["payload"]["type"], "alert");
        assert_eq!(json["payload"]["alert_type"], "drop_burst");
        assert_eq!(json["payload"]["severity"], "medium");

        let back: Observation = serde_json::from_value(json).unwrap();
        assert_eq!(back, obs);
    }

    #[test]
    fn empty_content_detects_whitespace_only_text() {
        assert!(MessagePayload::text("   ").is_empty_content());
        assert!(!MessagePayload::text("hi").is_empty_content());
        let with_attachment = MessagePayload {
            text: String::new(),
            attachments: vec![serde_json::json!({"uri": "file:///x.png"})],
            extra: None,
        };
        assert!(!with_attachment.is_empty_content());
    }
}
