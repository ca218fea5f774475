//! Shared types for the admission gate: decisions, hints, budgets and the
//! per-observation working object the pipeline stages mutate.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use cortex_protocol::AlertSeverity;
use cortex_protocol::Observation;
use cortex_protocol::ObservationType;
use serde::Deserialize;
use serde::Serialize;

use crate::gate::config::GateConfig;

/// Terminal gate actions: discard, keep for introspection only, or forward
/// to the agent.
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
pub enum GateAction {
    Drop,
    #[default]
    Sink,
    Deliver,
}

/// Coarse classification used to select scene policy.
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
pub enum Scene {
    Dialogue,
    Group,
    System,
    ToolCall,
    ToolResult,
    Alert,
    #[default]
    Unknown,
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
pub enum ModelTier {
    #[default]
    Low,
    Normal,
    High,
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
pub enum ResponsePolicy {
    Ack,
    #[default]
    RespondNow,
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
pub enum BudgetLevel {
    #[default]
    Tiny,
    Normal,
    Deep,
}

/// Resource envelope attached to a gate decision. The worker enforces
/// `time_ms` as the agent-call deadline; the orchestrator is expected to
/// honor the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSpec {
    pub budget_level: BudgetLevel,
    pub time_ms: u64,
    pub max_tokens: u32,
    pub max_parallel: u32,
    pub evidence_allowed: bool,
    pub max_tool_calls: u32,
    pub can_search_kb: bool,
    pub can_call_tools: bool,
    pub auto_clarify: bool,
}

impl Default for BudgetSpec {
    fn default() -> Self {
        Self {
            budget_level: BudgetLevel::Tiny,
            time_ms: 800,
            max_tokens: 256,
            max_parallel: 1,
            evidence_allowed: false,
            max_tool_calls: 0,
            can_search_kb: false,
            can_call_tools: false,
            auto_clarify: false,
        }
    }
}

/// Policy and resource annotations that travel with a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateHint {
    pub model_tier: ModelTier,
    pub response_policy: ResponsePolicy,
    pub budget: BudgetSpec,
    pub reason_tags: Vec<String>,
}

/// The immutable outcome of one gate pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub action: GateAction,
    pub scene: Scene,
    pub session_key: String,
    /// Reserved for multi-worker routing; currently populated only for
    /// SYSTEM-scene observations.
    pub target_worker: Option<String>,
    pub score: f64,
    pub reasons: Vec<String>,
    pub tags: HashMap<String, String>,
    pub fingerprint: Option<String>,
    pub hint: GateHint,
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub decision: GateDecision,
    /// Observations to re-publish on the bus (pain alerts and the like).
    pub emit: Vec<Observation>,
    /// Observations to file into the audit pools.
    pub ingest: Vec<Observation>,
}

/// Health signal supplied by the assembly; `overload` short-circuits the
/// pipeline at the hard-bypass stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemHealth {
    pub overload: bool,
}

/// Everything a gate pass needs besides the observation itself.
pub struct GateContext {
    pub now: DateTime<Utc>,
    pub config: Arc<GateConfig>,
    /// The session the observation was routed to.
    pub session_key: String,
    pub system_session_key: String,
    pub system_health: SystemHealth,
}

/// Features extracted once and consumed by scoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateFeatures {
    pub obs_type: Option<ObservationType>,
    pub source_name: String,
    pub actor_id: String,
    pub text_len: Option<usize>,
    pub has_mention: bool,
    pub has_bot_mention: bool,
    pub has_question: bool,
    pub alert_severity: Option<AlertSeverity>,
}

/// Mutable working object threaded through the pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct GateWip {
    pub scene: Option<Scene>,
    pub features: GateFeatures,
    pub score: f64,
    pub reasons: Vec<String>,
    pub tags: HashMap<String, String>,
    pub action_hint: Option<GateAction>,
    pub model_tier: Option<ModelTier>,
    pub response_policy: Option<ResponsePolicy>,
    pub gate_hint: Option<GateHint>,
    pub fingerprint: Option<String>,
    pub emit: Vec<Observation>,
    pub ingest: Vec<Observation>,
}

impl GateWip {
    pub fn scene(&self) -> Scene {
        self.scene.unwrap_or(Scene::Unknown)
    }
}
