// Each scenario file compiles this module independently and uses a
// different slice of it.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use cortex_core::core::CoreOptions;
use cortex_core::orchestrator::AgentOrchestrator;
use cortex_core::orchestrator::AgentOutcome;
use cortex_core::orchestrator::AgentRequest;
use cortex_protocol::Actor;
use cortex_protocol::ActorType;
use cortex_protocol::MessagePayload;
use cortex_protocol::Observation;
use cortex_protocol::Payload;
use cortex_protocol::SourceKind;

/// Poll until `predicate` holds; panic after `timeout_ms`.
pub async fn wait_until<F>(what: &str, timeout_ms: u64, predicate: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give in-flight workers a beat to settle before asserting a negative.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

pub fn fast_options() -> CoreOptions {
    CoreOptions {
        bus_capacity: 256,
        inbox_capacity: 64,
        enable_session_gc: false,
        ..Default::default()
    }
}

pub fn user_msg(actor_id: &str, text: &str) -> Observation {
    Observation::new(
        "test_input",
        SourceKind::External,
        Actor::user(actor_id),
        Payload::Message(MessagePayload::text(text)),
    )
}

pub fn agent_msg(session_key: &str, text: &str) -> Observation {
    Observation::new(
        "agent:speaker",
        SourceKind::Internal,
        Actor {
            actor_id: "agent".to_string(),
            actor_type: ActorType::System,
            display_name: None,
        },
        Payload::Message(MessagePayload::text(text)),
    )
    .with_session_key(session_key)
}

/// Orchestrator stub that counts invocations per scene, remembers the
/// last hint and replies like the speaker would.
pub struct CountingOrchestrator {
    pub calls: AtomicUsize,
    pub scenes: std::sync::Mutex<Vec<cortex_core::Scene>>,
    pub last_hint: std::sync::Mutex<Option<cortex_core::GateHint>>,
}

impl CountingOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            scenes: std::sync::Mutex::new(Vec::new()),
            last_hint: std::sync::Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn calls_for_scene(&self, scene: cortex_core::Scene) -> usize {
        self.scenes
            .lock()
            .unwrap()
            .iter()
            .filter(|&&s| s == scene)
            .count()
    }

    pub fn last_model_tier(&self) -> Option<cortex_core::ModelTier> {
        self.last_hint
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.model_tier)
    }
}

#[async_trait]
impl AgentOrchestrator for CountingOrchestrator {
    async fn handle(&self, req: AgentRequest) -> AgentOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.scenes.lock().unwrap().push(req.gate_decision.scene);
        *self.last_hint.lock().unwrap() = Some(req.gate_hint.clone());
        AgentOutcome {
            emit: vec![agent_msg(req.session_key(), "stub reply")],
            trace: Default::default(),
            error: None,
        }
    }
}

/// Orchestrator stub that always overruns the budget deadline.
pub struct StalledOrchestrator;

#[async_trait]
impl AgentOrchestrator for StalledOrchestrator {
    async fn handle(&self, _req: AgentRequest) -> AgentOutcome {
        tokio::time::sleep(Duration::from_secs(30)).await;
        AgentOutcome::default()
    }
}
