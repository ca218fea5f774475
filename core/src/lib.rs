//! Root of the `cortex-core` library.
//!
//! The runtime core of an event-driven conversational agent: observations
//! flow `adapter -> bus -> router -> inbox -> worker -> gate -> agent ->
//! bus` with agent emits re-entering the same stream.

// Prevent accidental direct writes to stdout/stderr in library code. All
// diagnostics go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod adapter;
pub mod bus;
pub mod config_provider;
pub mod core;
pub mod egress;
pub mod error;
pub mod gate;
pub mod memory;
pub mod nociception;
pub mod orchestrator;
pub mod reflex;
pub mod router;
pub mod session_state;
mod util;
mod worker;

pub use bus::InputBus;
pub use bus::PublishOutcome;
pub use config_provider::GateConfigProvider;
pub use crate::core::Core;
pub use crate::core::CoreBuilder;
pub use crate::core::CoreOptions;
pub use egress::EgressHub;
pub use egress::OutputSink;
pub use error::CoreErr;
pub use error::Result;
pub use gate::Gate;
pub use gate::config::GateConfig;
pub use gate::types::BudgetLevel;
pub use gate::types::BudgetSpec;
pub use gate::types::GateAction;
pub use gate::types::GateDecision;
pub use gate::types::GateHint;
pub use gate::types::ModelTier;
pub use gate::types::Scene;
pub use memory::MemoryService;
pub use memory::NoopMemory;
pub use nociception::Nociception;
pub use orchestrator::AgentOrchestrator;
pub use orchestrator::AgentOutcome;
pub use orchestrator::AgentRequest;
pub use orchestrator::DefaultAgentOrchestrator;
pub use reflex::ReflexConfig;
pub use reflex::ReflexController;
pub use router::MessageRouting;
pub use router::SessionRouter;
pub use session_state::SessionState;
