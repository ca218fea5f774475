//! Memory collaborator interface.
//!
//! Persistence is a downstream service; the core only needs correlation
//! ids back. Every call is optional and fail-open: the worker talks to the
//! service through [`FailOpenMemory`], which swallows errors, counts them
//! and moves on. A broken memory backend must never cost a user reply.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use cortex_protocol::Observation;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::gate::types::GateDecision;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedEvent {
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedTurn {
    pub turn_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnStatus {
    Ok,
    Error,
}

#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn append_event(
        &self,
        obs: &Observation,
        session_key: &str,
        gate: Option<&GateDecision>,
    ) -> Result<AppendedEvent>;

    async fn append_turn(&self, session_key: &str, input_event_id: &str) -> Result<AppendedTurn>;

    async fn finish_turn(
        &self,
        turn_id: &str,
        final_output_obs_id: Option<&str>,
        status: TurnStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Default backend: remembers nothing, returns synthetic ids.
#[derive(Default)]
pub struct NoopMemory;

#[async_trait]
impl MemoryService for NoopMemory {
    async fn append_event(
        &self,
        obs: &Observation,
        _session_key: &str,
        _gate: Option<&GateDecision>,
    ) -> Result<AppendedEvent> {
        Ok(AppendedEvent {
            event_id: format!("noop-event-{}", obs.obs_id),
        })
    }

    async fn append_turn(&self, _session_key: &str, input_event_id: &str) -> Result<AppendedTurn> {
        Ok(AppendedTurn {
            turn_id: format!("noop-turn-{input_event_id}"),
        })
    }

    async fn finish_turn(
        &self,
        _turn_id: &str,
        _final_output_obs_id: Option<&str>,
        _status: TurnStatus,
        _error: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Fail-open facade the worker uses. Errors are logged, counted and
/// converted to `None`.
pub struct FailOpenMemory {
    inner: Arc<dyn MemoryService>,
    error_total: AtomicU64,
}

impl FailOpenMemory {
    pub fn new(inner: Arc<dyn MemoryService>) -> Self {
        Self {
            inner,
            error_total: AtomicU64::new(0),
        }
    }

    pub fn error_total(&self) -> u64 {
        self.error_total.load(Ordering::Relaxed)
    }

    pub async fn append_event(
        &self,
        obs: &Observation,
        session_key: &str,
        gate: Option<&GateDecision>,
    ) -> Option<AppendedEvent> {
        match self.inner.append_event(obs, session_key, gate).await {
            Ok(event) => Some(event),
            Err(e) => {
                self.note_error("append_event", &e);
                None
            }
        }
    }

    pub async fn append_turn(
        &self,
        session_key: &str,
        input_event_id: &str,
    ) -> Option<AppendedTurn> {
        match self.inner.append_turn(session_key, input_event_id).await {
            Ok(turn) => Some(turn),
            Err(e) => {
                self.note_error("append_turn", &e);
                None
            }
        }
    }

    pub async fn finish_turn(
        &self,
        turn_id: &str,
        final_output_obs_id: Option<&str>,
        status: TurnStatus,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .inner
            .finish_turn(turn_id, final_output_obs_id, status, error)
            .await
        {
            self.note_error("finish_turn", &e);
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            self.note_error("close", &e);
        }
    }

    fn note_error(&self, op: &str, e: &crate::error::CoreErr) {
        self.error_total.fetch_add(1, Ordering::Relaxed);
        warn!(op, "memory call failed: {e}");
    }
}
