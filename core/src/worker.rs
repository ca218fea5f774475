// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Per-session worker task.
//!
//! Exactly one worker consumes each inbox, so observations within a
//! session are processed strictly in publish order. The worker appends to
//! its own session state, runs the gate, re-publishes emits, and invokes
//! the orchestrator under the budget deadline, but only for DELIVER
//! decisions on non-agent-sourced observations.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use cortex_protocol::Observation;
use cortex_protocol::ObservationType;
use cortex_protocol::Payload;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use uuid::Uuid;

use crate::bus::InputBus;
use crate::config_provider::GateConfigProvider;
use crate::core::CoreMetrics;
use crate::core::CoreOptions;
use crate::core::SystemHealthFlag;
use crate::egress::EgressHub;
use crate::error::CoreErr;
use crate::gate::Gate;
use crate::gate::types::GateAction;
use crate::gate::types::GateContext;
use crate::gate::types::GateDecision;
use crate::memory::FailOpenMemory;
use crate::memory::TurnStatus;
use crate::nociception::Nociception;
use crate::nociception::PainAlert;
use crate::orchestrator::AgentOrchestrator;
use crate::orchestrator::AgentRequest;
use crate::orchestrator::fallback_observation;
use crate::reflex::ReflexController;
use crate::router::FanoutEnqueue;
use crate::router::SessionInbox;
use crate::router::SessionRouter;
use crate::session_state::SessionState;

pub(crate) struct SessionWorker {
    pub session_key: String,
    pub inbox: Arc<SessionInbox>,
    pub state: Arc<Mutex<SessionState>>,
    pub bus: Arc<InputBus>,
    pub router: Arc<SessionRouter>,
    pub gate: Arc<Gate>,
    pub config: Arc<GateConfigProvider>,
    pub orchestrator: Arc<dyn AgentOrchestrator>,
    pub memory: Arc<FailOpenMemory>,
    pub egress: Option<Arc<EgressHub>>,
    pub nociception: Arc<Mutex<Nociception>>,
    pub reflex: Arc<Mutex<ReflexController>>,
    pub metrics: Arc<CoreMetrics>,
    pub options: Arc<CoreOptions>,
    pub health: Arc<SystemHealthFlag>,
    pub cancel: CancellationToken,
}

impl SessionWorker {
    pub async fn run(self) {
        debug!(session_key = %self.session_key, "worker started");
        loop {
            let obs = tokio::select! {
                _ = self.cancel.cancelled() => break,
                obs = self.inbox.recv() => match obs {
                    Some(obs) => obs,
                    None => break,
                },
            };
            self.process(obs).await;
        }
        debug!(session_key = %self.session_key, "worker stopped");
    }

    async fn process(&self, obs: Observation) {
        let now = Utc::now();
        trace!(session_key = %self.session_key, obs_id = %obs.obs_id, "processing");

        self.state.lock().unwrap().note_ingress(&obs, now);

        // Reflex sees every observation: suggestions apply here, and any
        // observation can trigger the TTL revert.
        let reflex_emits = self.reflex.lock().unwrap().handle_observation(&obs, now);
        for emit in reflex_emits {
            self.publish_emit(emit).await;
        }

        if obs.obs_type == ObservationType::Alert {
            self.nociception.lock().unwrap().on_alert(&obs, now);
        }

        if self.session_key == self.options.system_session_key
            && matches!(obs.payload, Payload::Schedule(_))
            && self.options.enable_system_fanout
        {
            self.fan_out(&obs).await;
        }

        let ctx = GateContext {
            now,
            config: self.config.snapshot(),
            session_key: self.session_key.clone(),
            system_session_key: self.options.system_session_key.clone(),
            system_health: self.health.snapshot(),
        };
        let outcome = self.gate.handle(&obs, &ctx);

        // Emits go out before the next inbox item so downstream observers
        // see a consistent post-condition.
        for emit in outcome.emit {
            self.publish_emit(emit).await;
        }
        for ingest in outcome.ingest {
            self.gate.ingest(ingest, &outcome.decision);
        }

        if outcome.decision.action == GateAction::Deliver && !obs.is_agent_sourced() {
            self.invoke_agent(obs, outcome.decision).await;
        }
    }

    /// Copy a system-scope SCHEDULE into every other active session's
    /// inbox. Local drop-newest on full inboxes; one aggregated alert
    /// covers all overflows.
    async fn fan_out(&self, obs: &Observation) {
        {
            let noci = self.nociception.lock().unwrap();
            if noci.is_fanout_disabled(Utc::now()) {
                debug!("fan-out suppressed by nociception");
                return;
            }
        }

        let mut dropped: u64 = 0;
        let mut copied: u64 = 0;
        for session_key in self.router.list_active_sessions() {
            if session_key == self.options.system_session_key {
                continue;
            }
            let mut copy = obs.clone();
            copy.obs_id = Uuid::new_v4().to_string();
            copy.session_key = Some(session_key.clone());
            match self.router.enqueue_existing(&session_key, copy) {
                FanoutEnqueue::Enqueued => copied += 1,
                FanoutEnqueue::DroppedFull => dropped += 1,
                FanoutEnqueue::NoSuchSession => {}
            }
        }
        self.metrics.add_fanout(copied);

        if dropped > 0 {
            let alert = PainAlert::medium("core", "fanout_overflow")
                .message("fan-out dropped copies on full inboxes")
                .data("dropped", dropped.into())
                .build(&self.options.system_session_key);
            self.publish_emit(alert).await;
        }
    }

    async fn invoke_agent(&self, mut obs: Observation, decision: GateDecision) {
        let now = Utc::now();
        let session_key = self.session_key.clone();

        let event = self
            .memory
            .append_event(&obs, &session_key, Some(&decision))
            .await;
        if let Some(event) = &event {
            obs.metadata.insert(
                "memory_event_id".to_string(),
                serde_json::Value::String(event.event_id.clone()),
            );
        }
        let turn = match &event {
            Some(event) => self.memory.append_turn(&session_key, &event.event_id).await,
            None => None,
        };

        let gate_hint = decision.hint.clone();
        let session_state = self.state.lock().unwrap().clone();
        let req = AgentRequest {
            obs: obs.clone(),
            gate_decision: decision,
            session_state,
            now,
            gate_hint: gate_hint.clone(),
        };

        self.metrics.inc_agent_invocations();
        let deadline = std::time::Duration::from_millis(gate_hint.budget.time_ms.max(1));

        match timeout(deadline, self.orchestrator.handle(req)).await {
            Ok(outcome) => {
                let final_obs_id = outcome.emit.last().map(|o| o.obs_id.clone());
                for mut emit in outcome.emit {
                    if let Some(turn) = &turn {
                        emit.metadata.insert(
                            "memory_turn_id".to_string(),
                            serde_json::Value::String(turn.turn_id.clone()),
                        );
                    }
                    self.state.lock().unwrap().note_emit(&emit, Utc::now());
                    self.publish_emit(emit).await;
                }

                let status = if outcome.error.is_some() {
                    self.state.lock().unwrap().record_error();
                    self.metrics.inc_agent_errors();
                    TurnStatus::Error
                } else {
                    TurnStatus::Ok
                };
                if let Some(turn) = &turn {
                    self.memory
                        .finish_turn(
                            &turn.turn_id,
                            final_obs_id.as_deref(),
                            status,
                            outcome.error.as_deref(),
                        )
                        .await;
                }
            }
            Err(_elapsed) => {
                self.state.lock().unwrap().record_error();
                self.metrics.inc_agent_errors();
                let reason = CoreErr::AgentDeadline(gate_hint.budget.time_ms).to_string();
                debug!(session_key = %session_key, "agent call timed out");

                let mut fallback = fallback_observation(&session_key, &obs.obs_id, &reason);
                if let Some(turn) = &turn {
                    fallback.metadata.insert(
                        "memory_turn_id".to_string(),
                        serde_json::Value::String(turn.turn_id.clone()),
                    );
                }
                let fallback_id = fallback.obs_id.clone();
                self.state.lock().unwrap().note_emit(&fallback, Utc::now());
                self.publish_emit(fallback).await;

                if let Some(turn) = &turn {
                    self.memory
                        .finish_turn(
                            &turn.turn_id,
                            Some(&fallback_id),
                            TurnStatus::Error,
                            Some(&reason),
                        )
                        .await;
                }
            }
        }
    }

    async fn publish_emit(&self, obs: Observation) {
        if let Some(egress) = &self.egress {
            egress.dispatch(&obs).await;
        }
        self.bus.publish_nowait(obs);
    }
}
