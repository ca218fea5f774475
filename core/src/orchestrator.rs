//! Agent orchestrator: the contract boundary between the engine and
//! whatever actually produces replies.
//!
//! The engine only depends on [`AgentOrchestrator::handle`], which must
//! always return an [`AgentOutcome`]: errors surface in the `error` field
//! with a best-effort fallback emit, never as a propagated failure. The
//! default implementation composes five pluggable stages (planner, context
//! builder, pool router + pools, aggregator, speaker); swap any of them to
//! change strategy without touching the worker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use cortex_protocol::Actor;
use cortex_protocol::ActorType;
use cortex_protocol::MessagePayload;
use cortex_protocol::Observation;
use cortex_protocol::Payload;
use cortex_protocol::SourceKind;

use crate::error::Result;
use crate::gate::types::GateDecision;
use crate::gate::types::GateHint;
use crate::gate::types::Scene;
use crate::session_state::SessionState;

/// Request assembled by the worker for each DELIVER decision.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub obs: Observation,
    pub gate_decision: GateDecision,
    /// Read-only snapshot of the session at dispatch time.
    pub session_state: SessionState,
    pub now: DateTime<Utc>,
    pub gate_hint: GateHint,
}

impl AgentRequest {
    pub fn session_key(&self) -> &str {
        &self.gate_decision.session_key
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub emit: Vec<Observation>,
    pub trace: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
}

#[async_trait]
pub trait AgentOrchestrator: Send + Sync {
    /// Must not fail: all internal errors are converted into an outcome
    /// with `error` set and a fallback emit.
    async fn handle(&self, req: AgentRequest) -> AgentOutcome;
}

/// What the planner decided the turn needs.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub task_type: String,
    pub pool_id: String,
    pub required_context: Vec<String>,
}

impl Default for TaskPlan {
    fn default() -> Self {
        Self {
            task_type: "chat".to_string(),
            pool_id: "chat".to_string(),
            required_context: vec!["recent_obs".to_string()],
        }
    }
}

/// Context handed to the pool.
#[derive(Debug, Clone, Default)]
pub struct ContextPack {
    pub recent_obs: Vec<Observation>,
}

/// Raw pool product; the aggregator turns it into final text.
#[derive(Debug, Clone, Default)]
pub struct PoolResult {
    pub raw: HashMap<String, serde_json::Value>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, req: &AgentRequest) -> Result<TaskPlan>;
}

#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build(&self, req: &AgentRequest, plan: &TaskPlan) -> Result<ContextPack>;
}

#[async_trait]
pub trait AgentPool: Send + Sync {
    fn pool_id(&self) -> &str;
    async fn run(
        &self,
        req: &AgentRequest,
        plan: &TaskPlan,
        ctx: &ContextPack,
    ) -> Result<PoolResult>;
}

pub trait PoolRouter: Send + Sync {
    fn pick(&self, req: &AgentRequest, plan: &TaskPlan) -> Arc<dyn AgentPool>;
}

#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn postprocess(
        &self,
        req: &AgentRequest,
        plan: &TaskPlan,
        ctx: &ContextPack,
        raw: &PoolResult,
    ) -> Result<String>;
}

pub trait Speaker: Send + Sync {
    fn speak(&self, req: &AgentRequest, final_text: &str) -> Observation;
}

/// Rule planner: picks a pool from the gate scene, no model involved.
#[derive(Default)]
pub struct RulePlanner;

#[async_trait]
impl Planner for RulePlanner {
    async fn plan(&self, req: &AgentRequest) -> Result<TaskPlan> {
        let task_type = match req.gate_decision.scene {
            Scene::Alert => "alert_triage",
            Scene::ToolResult => "tool_followup",
            _ => "chat",
        };
        Ok(TaskPlan {
            task_type: task_type.to_string(),
            ..Default::default()
        })
    }
}

/// Packs the session's recent observations plus the triggering one.
#[derive(Default)]
pub struct RecentObsContextBuilder;

#[async_trait]
impl ContextBuilder for RecentObsContextBuilder {
    async fn build(&self, req: &AgentRequest, _plan: &TaskPlan) -> Result<ContextPack> {
        let mut recent_obs = req.session_state.recent_obs_snapshot();
        if recent_obs.last().map(|o| &o.obs_id) != Some(&req.obs.obs_id) {
            recent_obs.push(req.obs.clone());
        }
        Ok(ContextPack { recent_obs })
    }
}

/// Deterministic chat pool. There is no model transport in the core; this
/// produces the acknowledgement draft downstream sinks render.
pub struct ChatPool {
    pool_id: String,
}

impl Default for ChatPool {
    fn default() -> Self {
        Self {
            pool_id: "chat".to_string(),
        }
    }
}

#[async_trait]
impl AgentPool for ChatPool {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    async fn run(
        &self,
        req: &AgentRequest,
        _plan: &TaskPlan,
        _ctx: &ContextPack,
    ) -> Result<PoolResult> {
        let draft = match &req.obs.payload {
            Payload::Message(m) if m.text.trim().ends_with('?') => {
                "Let me look into that.".to_string()
            }
            Payload::Message(_) => "Acknowledged.".to_string(),
            Payload::Alert(a) => format!("Alert `{}` received.", a.alert_type),
            _ => "Noted.".to_string(),
        };
        let mut raw = HashMap::new();
        raw.insert("draft".to_string(), serde_json::Value::String(draft));
        Ok(PoolResult { raw })
    }
}

pub struct SinglePoolRouter {
    pool: Arc<dyn AgentPool>,
}

impl Default for SinglePoolRouter {
    fn default() -> Self {
        Self {
            pool: Arc::new(ChatPool::default()),
        }
    }
}

impl PoolRouter for SinglePoolRouter {
    fn pick(&self, _req: &AgentRequest, _plan: &TaskPlan) -> Arc<dyn AgentPool> {
        self.pool.clone()
    }
}

#[derive(Default)]
pub struct DraftAggregator;

#[async_trait]
impl Aggregator for DraftAggregator {
    async fn postprocess(
        &self,
        _req: &AgentRequest,
        _plan: &TaskPlan,
        _ctx: &ContextPack,
        raw: &PoolResult,
    ) -> Result<String> {
        Ok(raw
            .raw
            .get("draft")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// Renders final text as a MESSAGE observation attributed to the agent.
#[derive(Default)]
pub struct AgentSpeaker;

pub const SPEAKER_SOURCE: &str = "agent:speaker";
pub const FALLBACK_SOURCE: &str = "agent:fallback";

impl Speaker for AgentSpeaker {
    fn speak(&self, req: &AgentRequest, final_text: &str) -> Observation {
        let mut obs = Observation::new(
            SPEAKER_SOURCE,
            SourceKind::Internal,
            Actor {
                actor_id: "agent".to_string(),
                actor_type: ActorType::System,
                display_name: Some("Agent".to_string()),
            },
            Payload::Message(MessagePayload::text(final_text)),
        )
        .with_session_key(req.session_key());
        obs.metadata.insert(
            "reply_to".to_string(),
            serde_json::Value::String(req.obs.obs_id.clone()),
        );
        obs
    }
}

/// Build the fallback emit used when a stage fails or the worker hits the
/// budget deadline.
pub fn fallback_observation(session_key: &str, reply_to: &str, error: &str) -> Observation {
    let text: String = format!("(agent_error) {error}").chars().take(120).collect();
    Observation::new(
        FALLBACK_SOURCE,
        SourceKind::Internal,
        Actor {
            actor_id: "agent".to_string(),
            actor_type: ActorType::System,
            display_name: Some("Agent".to_string()),
        },
        Payload::Message(MessagePayload::text(text)),
    )
    .with_session_key(session_key)
    .with_metadata("fallback", serde_json::Value::Bool(true))
    .with_metadata(
        "reply_to",
        serde_json::Value::String(reply_to.to_string()),
    )
}

pub struct DefaultAgentOrchestrator {
    planner: Arc<dyn Planner>,
    context_builder: Arc<dyn ContextBuilder>,
    pool_router: Arc<dyn PoolRouter>,
    aggregator: Arc<dyn Aggregator>,
    speaker: Arc<dyn Speaker>,
}

impl Default for DefaultAgentOrchestrator {
    fn default() -> Self {
        Self {
            planner: Arc::new(RulePlanner),
            context_builder: Arc::new(RecentObsContextBuilder),
            pool_router: Arc::new(SinglePoolRouter::default()),
            aggregator: Arc::new(DraftAggregator),
            speaker: Arc::new(AgentSpeaker),
        }
    }
}

impl DefaultAgentOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_context_builder(mut self, context_builder: Arc<dyn ContextBuilder>) -> Self {
        self.context_builder = context_builder;
        self
    }

    pub fn with_pool_router(mut self, pool_router: Arc<dyn PoolRouter>) -> Self {
        self.pool_router = pool_router;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_speaker(mut self, speaker: Arc<dyn Speaker>) -> Self {
        self.speaker = speaker;
        self
    }

    fn fallback(
        &self,
        req: &AgentRequest,
        mut trace: HashMap<String, serde_json::Value>,
        error: String,
    ) -> AgentOutcome {
        trace.insert("fallback".to_string(), serde_json::Value::Bool(true));
        let emit = fallback_observation(req.session_key(), &req.obs.obs_id, &error);
        AgentOutcome {
            emit: vec![emit],
            trace,
            error: Some(error),
        }
    }
}

#[async_trait]
impl AgentOrchestrator for DefaultAgentOrchestrator {
    async fn handle(&self, req: AgentRequest) -> AgentOutcome {
        let started = Utc::now();
        let mut trace: HashMap<String, serde_json::Value> = HashMap::new();
        trace.insert(
            "start_ts".to_string(),
            serde_json::json!(started.timestamp_millis()),
        );

        let plan = match self.planner.plan(&req).await {
            Ok(plan) => plan,
            Err(e) => return self.fallback(&req, trace, format!("planning failed: {e}")),
        };
        trace.insert(
            "plan".to_string(),
            serde_json::json!({ "task_type": plan.task_type, "pool_id": plan.pool_id }),
        );

        let ctx = match self.context_builder.build(&req, &plan).await {
            Ok(ctx) => ctx,
            Err(e) => return self.fallback(&req, trace, format!("context build failed: {e}")),
        };
        trace.insert(
            "context".to_string(),
            serde_json::json!({ "recent_obs": ctx.recent_obs.len() }),
        );

        let pool = self.pool_router.pick(&req, &plan);
        trace.insert(
            "pool".to_string(),
            serde_json::Value::String(pool.pool_id().to_string()),
        );

        let raw = match pool.run(&req, &plan, &ctx).await {
            Ok(raw) => raw,
            Err(e) => return self.fallback(&req, trace, format!("pool run failed: {e}")),
        };

        let final_text = match self.aggregator.postprocess(&req, &plan, &ctx, &raw).await {
            Ok(text) => text,
            Err(e) => return self.fallback(&req, trace, format!("aggregation failed: {e}")),
        };

        let out = self.speaker.speak(&req, &final_text);
        let elapsed = Utc::now().signed_duration_since(started);
        trace.insert(
            "elapsed_ms".to_string(),
            serde_json::json!(elapsed.num_milliseconds()),
        );

        AgentOutcome {
            emit: vec![out],
            trace,
            error: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::CoreErr;
    use crate::gate::types::GateAction;

    fn request(text: &str) -> AgentRequest {
        let now = Utc::now();
        let obs = Observation::new(
            "text_input",
            SourceKind::External,
            Actor::user("u1"),
            Payload::Message(MessagePayload::text(text)),
        )
        .with_session_key("user:u1");
        AgentRequest {
            gate_decision: GateDecision {
                action: GateAction::Deliver,
                scene: Scene::Dialogue,
                session_key: "user:u1".to_string(),
                target_worker: None,
                score: 0.5,
                reasons: vec![],
                tags: HashMap::new(),
                fingerprint: None,
                hint: GateHint::default(),
            },
            session_state: SessionState::new("user:u1", now),
            now,
            gate_hint: GateHint::default(),
            obs,
        }
    }

    #[tokio::test]
    async fn default_chain_emits_one_agent_message() {
        let orchestrator = DefaultAgentOrchestrator::new();
        let outcome = orchestrator.handle(request("hello")).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.emit.len(), 1);
        let emit = &outcome.emit[0];
        assert_eq!(emit.source_name, SPEAKER_SOURCE);
        assert!(emit.is_agent_sourced());
        assert_eq!(emit.session_key.as_deref(), Some("user:u1"));
        assert!(outcome.trace.contains_key("elapsed_ms"));
    }

    struct ExplodingPool;

    #[async_trait]
    impl AgentPool for ExplodingPool {
        fn pool_id(&self) -> &str {
            "exploding"
        }

        async fn run(
            &self,
            _req: &AgentRequest,
            _plan: &TaskPlan,
            _ctx: &ContextPack,
        ) -> Result<PoolResult> {
            Err(CoreErr::Config("pool blew up".to_string()))
        }
    }

    struct ExplodingRouter;

    impl PoolRouter for ExplodingRouter {
        fn pick(&self, _req: &AgentRequest, _plan: &TaskPlan) -> Arc<dyn AgentPool> {
            Arc::new(ExplodingPool)
        }
    }

    #[tokio::test]
    async fn stage_failure_yields_fallback_outcome() {
        let orchestrator =
            DefaultAgentOrchestrator::new().with_pool_router(Arc::new(ExplodingRouter));
        let outcome = orchestrator.handle(request("hello")).await;
        assert!(outcome.error.as_deref().unwrap().contains("pool blew up"));
        assert_eq!(outcome.emit.len(), 1);
        let emit = &outcome.emit[0];
        assert_eq!(emit.source_name, FALLBACK_SOURCE);
        assert_eq!(emit.metadata["fallback"], serde_json::Value::Bool(true));
        assert!(emit.message().unwrap().text.starts_with("(agent_error)"));
    }
}
